//! Segment Store: the disk-resident rolling set of encoded video segments
//! for one recording session.
//!
//! A segment, once named, is immutable until deleted by
//! [`crate::retention`] — the encoder never overwrites or wraps segment
//! numbers. Ordinals are strictly increasing for the life of one session
//! and are embedded in the filename with a fixed-width, zero-padded
//! suffix, preceded by a random session prefix so that a crashed prior
//! session's leftover segments never collide with the current one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// One encoded segment file on disk.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Segment {
    pub ordinal: u64,
    pub path: PathBuf,
}

/// Owns the directory holding one session's segments.
pub struct SegmentStore {
    dir: PathBuf,
    session_prefix: String,
}

impl SegmentStore {
    /// Create a fresh session directory under `root` with a random 128-bit
    /// session prefix embedded in the segment base name.
    pub fn create(root: &Path) -> io::Result<Self> {
        let session_prefix = uuid::Uuid::new_v4().simple().to_string();
        let dir = root.join(format!("segments_{session_prefix}"));
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, session_prefix })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The filename base (without extension or ordinal suffix) that the
    /// encoder process should template as `<base>_%06d.mkv`.
    pub fn segment_base(&self) -> String {
        format!("clip_{}", self.session_prefix)
    }

    /// `ffmpeg`'s segment-muxer output template, e.g.
    /// `<dir>/clip_<prefix>_%06d.mkv`.
    pub fn segment_template(&self) -> PathBuf {
        self.dir.join(format!("{}_%06d.mkv", self.segment_base()))
    }

    /// List all segments currently on disk, sorted by ordinal (equivalent
    /// to lexicographic filename order given the fixed-width suffix).
    pub fn list_segments(&self) -> io::Result<Vec<Segment>> {
        let prefix = format!("{}_", self.segment_base());
        let mut segments = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(ordinal) = parse_ordinal(name, &prefix) {
                segments.push(Segment { ordinal, path });
            }
        }

        segments.sort();
        Ok(segments)
    }

    /// Erase the entire session directory. Called on recorder dispose.
    pub fn dispose(self) -> io::Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

fn parse_ordinal(filename: &str, prefix: &str) -> Option<u64> {
    let rest = filename.strip_prefix(prefix)?;
    let rest = rest.strip_suffix(".mkv")?;
    rest.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn segment_template_has_six_digit_placeholder() {
        let root = tempdir().unwrap();
        let store = SegmentStore::create(root.path()).unwrap();
        let template = store.segment_template();
        assert!(template.to_string_lossy().ends_with("_%06d.mkv"));
    }

    #[test]
    fn list_segments_sorts_by_ordinal() {
        let root = tempdir().unwrap();
        let store = SegmentStore::create(root.path()).unwrap();
        let base = store.segment_base();

        for ordinal in [2u64, 0, 1] {
            fs::write(
                store.dir().join(format!("{base}_{ordinal:06}.mkv")),
                b"data",
            )
            .unwrap();
        }
        // An unrelated file must be ignored.
        fs::write(store.dir().join("notes.txt"), b"x").unwrap();

        let segments = store.list_segments().unwrap();
        let ordinals: Vec<u64> = segments.iter().map(|s| s.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[test]
    fn dispose_removes_the_whole_session_directory() {
        let root = tempdir().unwrap();
        let store = SegmentStore::create(root.path()).unwrap();
        let dir = store.dir().to_path_buf();
        fs::write(dir.join("leftover.mkv"), b"x").unwrap();

        store.dispose().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn two_sessions_never_collide() {
        let root = tempdir().unwrap();
        let a = SegmentStore::create(root.path()).unwrap();
        let b = SegmentStore::create(root.path()).unwrap();
        assert_ne!(a.dir(), b.dir());
    }
}
