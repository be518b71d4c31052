//! Segment retention: periodically prunes the oldest segments once the
//! session directory holds more than the configured buffer window needs.
//!
//! The teacher's `SegmentBuffer` deleted the oldest segment synchronously
//! every time a new one was added, tightly coupling buffer size to the
//! encoder's own rotation cadence. Here the encoder (an external `ffmpeg`
//! process) rotates segments on its own schedule, so retention runs as an
//! independent background sweep instead, tolerant of segments that briefly
//! can't be deleted because the encoder (or an antivirus scanner, on
//! Windows) still has a handle open.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::segment::SegmentStore;
use crate::utils::metrics::MetricsCollector;

const SWEEP_INTERVAL: Duration = Duration::from_secs(2);
const BUSY_DELETE_RETRIES: u32 = 3;
const BUSY_DELETE_DELAY: Duration = Duration::from_millis(50);

/// Spawns the background pruning task. Dropping the returned handle does
/// *not* stop the sweep; call [`SegmentRetention::stop`] (or abort the
/// handle directly) to do that.
pub struct SegmentRetention {
    handle: JoinHandle<()>,
}

impl SegmentRetention {
    pub fn start(store: Arc<SegmentStore>, max_segments: usize, metrics: Arc<MetricsCollector>) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = sweep_once(&store, max_segments, &metrics).await {
                    warn!("segment retention sweep failed: {e}");
                }
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

async fn sweep_once(
    store: &SegmentStore,
    max_segments: usize,
    metrics: &MetricsCollector,
) -> std::io::Result<()> {
    let segments = store.list_segments()?;
    let total_bytes: u64 = segments
        .iter()
        .filter_map(|s| std::fs::metadata(&s.path).ok())
        .map(|m| m.len())
        .sum();
    metrics
        .update_buffer_metrics(segments.len(), total_bytes as f32 / (1024.0 * 1024.0))
        .await;

    if segments.len() <= max_segments {
        return Ok(());
    }

    let excess = segments.len() - max_segments;
    for segment in segments.into_iter().take(excess) {
        delete_with_retry(&segment.path).await;
    }
    Ok(())
}

async fn delete_with_retry(path: &Path) {
    for attempt in 1..=BUSY_DELETE_RETRIES {
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!("pruned segment {path:?}");
                return;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) if attempt < BUSY_DELETE_RETRIES => {
                debug!("segment {path:?} busy (attempt {attempt}), retrying: {e}");
                tokio::time::sleep(BUSY_DELETE_DELAY).await;
            }
            Err(e) => {
                warn!("giving up pruning {path:?} after {attempt} attempts: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::metrics::HealthThresholds;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn sweep_prunes_oldest_first() {
        let root = tempdir().unwrap();
        let store = SegmentStore::create(root.path()).unwrap();
        let base = store.segment_base();
        for ordinal in 0..5u64 {
            fs::write(store.dir().join(format!("{base}_{ordinal:06}.mkv")), b"x").unwrap();
        }

        let metrics = MetricsCollector::new(HealthThresholds::default());
        sweep_once(&store, 3, &metrics).await.unwrap();

        let remaining = store.list_segments().unwrap();
        let ordinals: Vec<u64> = remaining.iter().map(|s| s.ordinal).collect();
        assert_eq!(ordinals, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn sweep_is_a_no_op_under_the_limit() {
        let root = tempdir().unwrap();
        let store = SegmentStore::create(root.path()).unwrap();
        let base = store.segment_base();
        fs::write(store.dir().join(format!("{base}_000000.mkv")), b"x").unwrap();

        let metrics = MetricsCollector::new(HealthThresholds::default());
        sweep_once(&store, 5, &metrics).await.unwrap();

        assert_eq!(store.list_segments().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_with_retry_tolerates_already_missing_file() {
        let root = tempdir().unwrap();
        delete_with_retry(&root.path().join("missing.mkv")).await;
    }
}
