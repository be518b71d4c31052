//! End-to-end-style integration tests against the crate's public surface.
//!
//! Scenarios that need a real GPU duplication surface, a real encoder
//! binary, or real audio hardware are marked `#[ignore]` and left for
//! manual/CI-with-hardware runs, following the same pattern the teacher
//! uses for its own `gdigrab`/hardware-encoder checks.

use std::sync::Arc;
use std::time::Duration;

use instant_replay_core::pool::FrameBufferPool;
use instant_replay_core::segment::SegmentStore;
use instant_replay_core::snapshot::sidecar_seek_offset;
use instant_replay_core::{Recorder, RecorderConfig};
use tempfile::tempdir;

/// S1 (pool half): after warmup, renting and releasing within the warmed
/// capacity should never fall back to a fresh allocation.
#[test]
fn pool_hit_rate_is_high_once_warm() {
    let pool = Arc::new(FrameBufferPool::new(1920 * 1080 * 4));
    pool.warmup(8);

    for _ in 0..100 {
        let buf = pool.rent();
        pool.release(buf);
    }

    assert!(
        pool.hit_rate() >= 0.70,
        "hit rate {} below 70% threshold",
        pool.hit_rate()
    );
}

/// S5 item 2: the audio seek offset clamp never goes negative and never
/// exceeds how long the sidecar itself has actually been alive.
#[test]
fn sidecar_seek_offset_never_exceeds_sidecar_lifetime() {
    // Sidecar started 2s into a 10s-elapsed session; only alive for 8s.
    let offset = sidecar_seek_offset(10.0, 2_000, 30.0);
    assert_eq!(offset, 0.0);

    // Sidecar has been alive the whole session and outlives the tail window.
    let offset = sidecar_seek_offset(40.0, 0, 10.0);
    assert_eq!(offset, 30.0);
}

/// Segment ordinals are strictly increasing and distinct sessions never
/// collide on the same directory, per the session-prefix scheme.
#[test]
fn segment_store_sessions_do_not_collide() {
    let root = tempdir().unwrap();
    let a = SegmentStore::create(root.path()).unwrap();
    let b = SegmentStore::create(root.path()).unwrap();
    assert_ne!(a.dir(), b.dir());
    assert_ne!(a.segment_base(), b.segment_base());
}

/// S6: retention leaves at most `max_segments_to_keep()` segments on disk,
/// exercised directly against the segment directory rather than a live
/// encoder (no ffmpeg dependency).
#[tokio::test]
async fn retention_prunes_down_to_the_configured_ceiling() {
    use instant_replay_core::retention::SegmentRetention;
    use instant_replay_core::utils::metrics::{HealthThresholds, MetricsCollector};

    let root = tempdir().unwrap();
    let store = Arc::new(SegmentStore::create(root.path()).unwrap());
    let base = store.segment_base();
    for i in 0..20u32 {
        std::fs::write(store.dir().join(format!("{base}_{i:06}.mkv")), [0u8; 16]).unwrap();
    }

    let metrics = Arc::new(MetricsCollector::new(HealthThresholds::default()));
    let retention = SegmentRetention::start(store.clone(), 7, metrics);

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    retention.stop();

    let remaining = store.list_segments().unwrap();
    assert!(
        remaining.len() <= 7,
        "expected at most 7 segments, found {}",
        remaining.len()
    );
    let _ = std::fs::remove_dir_all(store.dir());
}

/// Construction-time validation rejects an fps outside the supported
/// range before any capture resource is touched.
#[test]
fn recorder_construction_rejects_invalid_fps() {
    let dir = tempdir().unwrap();
    let config = RecorderConfig {
        save_path: dir.path().to_path_buf(),
        fps: 500,
        ..Default::default()
    };
    assert!(Recorder::new(config, 1).is_err());
}

/// S1 end-to-end: real desktop duplication, real encoder subprocess, real
/// 30s buffer. Needs a GPU-backed desktop session and `ffmpeg` on PATH.
#[test]
#[ignore]
fn s1_idle_desktop_produces_a_valid_thirty_second_clip() {
    // Manual/CI-with-hardware run: start a Recorder with the default
    // config, wait 35s, save_clip, pause, dispose, then probe the
    // resulting MP4 with `ffprobe` for duration and stream presence.
}
