//! Snapshot Builder: turns the current segment tail plus sidecar audio into
//! one finalized MP4.
//!
//! Video is always stream-copied out of the concat'd segment tail — only
//! audio, when present, is transcoded. The concat manifest is written with
//! segment basenames only and the mux subprocess's working directory is
//! pinned to the segment directory, so the manifest never embeds a path
//! that could be invalidated by the save directory moving.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RecorderConfig;
use crate::segment::SegmentStore;
use crate::utils::cleanup::TempFileGuard;
use crate::utils::error::SnapshotError;
use crate::utils::retry::{retry_with_backoff, RetryConfig};

const CANCELLATION_GUARD: Duration = Duration::from_secs(60);

const MUX_RETRY_CONFIG: RetryConfig = RetryConfig {
    max_attempts: 2,
    initial_delay: Duration::from_millis(200),
    max_delay: Duration::from_secs(1),
    backoff_multiplier: 2.0,
    jitter_factor: 0.1,
};

/// One sidecar's audio, located and offset-clamped for this snapshot.
pub struct SidecarInput {
    pub path: PathBuf,
    /// Seconds into the WAV file to seek to before muxing.
    pub seek_seconds: f64,
}

/// Everything the Snapshot Builder needs that the facade alone can see.
pub struct SnapshotAudioInputs {
    pub desktop: Option<SidecarInput>,
    pub microphone: Option<SidecarInput>,
}

/// Compute a sidecar's seek offset per the resolved clamp: never seek past
/// how long that specific sidecar has actually been recording, even if the
/// overall session has run longer (it may have started mid-session).
pub fn sidecar_seek_offset(
    recording_elapsed_seconds: f64,
    sidecar_start_offset_ms: u64,
    video_duration_seconds: f64,
) -> f64 {
    let sidecar_lifetime = (recording_elapsed_seconds - sidecar_start_offset_ms as f64 / 1000.0).max(0.0);
    (sidecar_lifetime - video_duration_seconds).max(0.0)
}

pub fn generate_filename() -> String {
    let now = chrono::Local::now();
    let suffix: u32 = rand::thread_rng().gen();
    format!(
        "clip_{}_{:08x}.mp4",
        now.format("%Y%m%d_%H%M%S_%3f"),
        suffix
    )
}

/// Build the final clip. `cancel` is observed alongside the 60-second
/// ceiling; on cancellation or mux failure the segments on disk are left
/// untouched (only the concat manifest is ever deleted).
pub async fn build(
    store: &SegmentStore,
    config: &RecorderConfig,
    audio: SnapshotAudioInputs,
    cancel: CancellationToken,
) -> Result<PathBuf, SnapshotError> {
    let deadline = Instant::now() + CANCELLATION_GUARD;
    let linked_cancel = cancel.child_token();
    let guard_cancel = linked_cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(CANCELLATION_GUARD).await;
        guard_cancel.cancel();
    });

    let segments = store.list_segments()?;
    if segments.is_empty() {
        return Err(SnapshotError::NoSegments);
    }

    let keep = config.segments_to_keep().min(segments.len());
    let tail = &segments[segments.len() - keep..];
    let video_duration = (tail.len() as u32 * config.segment_duration_seconds) as f64;

    let manifest_path = store.dir().join(format!("manifest_{}.txt", uuid::Uuid::new_v4().simple()));
    let manifest_body: String = tail
        .iter()
        .map(|s| {
            let name = s.path.file_name().unwrap().to_string_lossy().into_owned();
            format!("file '{name}'\n")
        })
        .collect();
    std::fs::write(&manifest_path, manifest_body)?;
    let _manifest_guard = TempFileGuard::new(manifest_path.clone());

    let output_path = config.save_path.join(generate_filename());
    let args = build_mux_args(&manifest_path, &audio, &output_path);

    let remaining = deadline.saturating_duration_since(Instant::now());
    let mux = spawn_mux(store.dir(), &args, video_duration);
    tokio::pin!(mux);

    let result = tokio::select! {
        _ = linked_cancel.cancelled() => Err(SnapshotError::Cancelled),
        _ = tokio::time::sleep(remaining) => Err(SnapshotError::Cancelled),
        res = &mut mux => res,
    };

    match result {
        Ok(()) => {
            info!("snapshot written to {:?}", output_path);
            Ok(output_path)
        }
        Err(e) => {
            warn!("snapshot mux did not complete: {e}");
            Err(e)
        }
    }
}

fn build_mux_args(
    manifest_path: &Path,
    audio: &SnapshotAudioInputs,
    output_path: &Path,
) -> Vec<String> {
    let manifest_name = manifest_path.file_name().unwrap().to_string_lossy().into_owned();
    let mut args: Vec<String> = vec![
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        manifest_name,
    ];

    match (&audio.desktop, &audio.microphone) {
        (Some(desktop), Some(mic)) => {
            args.extend([
                "-ss".into(),
                format!("{:.3}", desktop.seek_seconds),
                "-i".into(),
                desktop.path.to_string_lossy().into_owned(),
                "-ss".into(),
                format!("{:.3}", mic.seek_seconds),
                "-i".into(),
                mic.path.to_string_lossy().into_owned(),
                "-filter_complex".into(),
                "[1:a][2:a]amix=inputs=2:duration=first[aout]".into(),
                "-map".into(),
                "0:v".into(),
                "-map".into(),
                "[aout]".into(),
                "-c:v".into(),
                "copy".into(),
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                "192k".into(),
            ]);
        }
        (Some(only), None) | (None, Some(only)) => {
            args.extend([
                "-ss".into(),
                format!("{:.3}", only.seek_seconds),
                "-i".into(),
                only.path.to_string_lossy().into_owned(),
                "-map".into(),
                "0:v".into(),
                "-map".into(),
                "1:a".into(),
                "-c:v".into(),
                "copy".into(),
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                "192k".into(),
                "-shortest".into(),
            ]);
        }
        (None, None) => {
            args.extend(["-map".into(), "0:v".into(), "-c:v".into(), "copy".into()]);
        }
    }

    args.extend([
        "-movflags".into(),
        "+faststart".into(),
        "-y".into(),
        output_path.to_string_lossy().into_owned(),
    ]);

    args
}

async fn spawn_mux(
    working_dir: &Path,
    args: &[String],
    _video_duration: f64,
) -> Result<(), SnapshotError> {
    let args = args.to_vec();
    let working_dir = working_dir.to_path_buf();

    let mut child = retry_with_backoff(MUX_RETRY_CONFIG, "snapshot mux spawn", || {
        let args = args.clone();
        let working_dir = working_dir.clone();
        async move {
            Command::new("ffmpeg")
                .current_dir(&working_dir)
                .args(&args)
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
        }
    })
    .await
    .map_err(|e| SnapshotError::SpawnFailed(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

    let status = child.wait().await?;
    if !status.success() {
        return Err(SnapshotError::MuxFailed(status.code().unwrap_or(-1)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn sidecar_seek_clamps_to_sidecar_lifetime() {
        // Session has run 40s; this sidecar only started 35s in (5s alive).
        let offset = sidecar_seek_offset(40.0, 35_000, 10.0);
        assert_eq!(offset, 0.0); // 5s alive < 10s video tail, so no seek
    }

    #[test]
    fn sidecar_seek_is_positive_when_sidecar_outlives_tail() {
        let offset = sidecar_seek_offset(40.0, 0, 10.0);
        assert_eq!(offset, 30.0);
    }

    #[test]
    fn no_audio_variant_only_maps_video() {
        let manifest = Path::new("manifest.txt");
        let output = Path::new("/tmp/out.mp4");
        let args = build_mux_args(
            manifest,
            &SnapshotAudioInputs {
                desktop: None,
                microphone: None,
            },
            output,
        );
        assert!(args.iter().any(|a| a == "+faststart"));
        assert!(!args.iter().any(|a| a == "amix=inputs=2:duration=first"));
    }

    #[tokio::test]
    async fn build_fails_fast_with_no_segments() {
        let root = tempdir().unwrap();
        let store = SegmentStore::create(root.path()).unwrap();
        let config = RecorderConfig {
            save_path: root.path().to_path_buf(),
            ..Default::default()
        };
        let audio = SnapshotAudioInputs {
            desktop: None,
            microphone: None,
        };
        let result = build(&store, &config, audio, CancellationToken::new()).await;
        assert!(matches!(result, Err(SnapshotError::NoSegments)));
        let _ = fs::remove_dir_all(store.dir());
    }
}
