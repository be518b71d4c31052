use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use instant_replay_core::pool::FrameBufferPool;
use instant_replay_core::segment::SegmentStore;
use instant_replay_core::snapshot::sidecar_seek_offset;
use std::sync::Arc;
use tempfile::tempdir;

/// Frame pool rent/release under the 1080p60 frame size, at the default
/// and a widened pool ceiling.
fn benchmark_pool_rent_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_rent_release");
    let frame_size = 1920 * 1080 * 4;

    for max_pool_size in [8usize, 32].iter() {
        let pool = Arc::new(FrameBufferPool::with_max_pool_size(frame_size, *max_pool_size));
        pool.warmup(*max_pool_size);
        group.bench_with_input(
            BenchmarkId::from_parameter(max_pool_size),
            max_pool_size,
            |b, _| {
                b.iter(|| {
                    let buf = pool.rent();
                    pool.release(black_box(buf));
                });
            },
        );
    }

    group.finish();
}

/// Sidecar seek offset math, already O(1) — measured mainly as a baseline
/// for the I/O-bound benchmarks in this file.
fn benchmark_sidecar_seek_offset(c: &mut Criterion) {
    c.bench_function("sidecar_seek_offset", |b| {
        b.iter(|| black_box(sidecar_seek_offset(black_box(42.0), black_box(3_000), black_box(30.0))));
    });
}

/// Listing segments scales with directory size; a long-running session can
/// accumulate hundreds of short segments before retention catches up.
fn benchmark_list_segments(c: &mut Criterion) {
    let mut group = c.benchmark_group("list_segments");

    for segment_count in [10usize, 100, 500].iter() {
        let root = tempdir().unwrap();
        let store = SegmentStore::create(root.path()).unwrap();
        let base = store.segment_base();
        for i in 0..*segment_count {
            std::fs::write(store.dir().join(format!("{base}_{i:06}.mkv")), []).unwrap();
        }

        group.bench_with_input(
            BenchmarkId::from_parameter(segment_count),
            segment_count,
            |b, _| {
                b.iter(|| black_box(store.list_segments().unwrap()));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_pool_rent_release,
    benchmark_sidecar_seek_offset,
    benchmark_list_segments,
);
criterion_main!(benches);
