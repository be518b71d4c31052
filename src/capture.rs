//! Desktop capture loop.
//!
//! Runs on its own OS thread (desktop duplication is a blocking, per-frame
//! poll, not something worth parking a tokio worker on) and paces itself to
//! the configured fps using a wait-then-spin strategy: sleep for all but the
//! last millisecond of the remaining budget, then spin to the exact tick so
//! jitter from `thread::sleep`'s OS-granularity never pushes a frame late.
//!
//! Frame drops are handled in tiers: one or two consecutive misses just
//! republish the last valid frame (duplication surfaces commonly report "no
//! new frame" well within a healthy capture), three or more are treated as a
//! genuine stall and skipped rather than flooding the channel with repeats,
//! and ten or more trigger a bounded recovery (release the duplication
//! surface, wait, reacquire). Recovery attempts across the whole session are
//! additionally governed by a [`CircuitBreaker`]: once three reacquire
//! attempts fail, the breaker opens and further stalls fail fast instead of
//! burning a retry-and-wait cycle on a surface that just came back from
//! exhausting the same budget. The loop itself never exits on a capture
//! failure, however persistent — recovery exhaustion broadcasts a non-fatal
//! `RecorderEvent::Error` and backs off before the next attempt, rather than
//! terminating the capture thread.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::channel::{Frame, FrameSender};
use crate::pool::FrameBufferPool;
use crate::recorder::RecorderEvent;
use crate::utils::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::utils::error::CaptureError;
use crate::utils::metrics::{MetricsCollector, PerformanceStats};

const MAX_RECOVERY_ATTEMPTS: u32 = 3;
const RECOVERY_WAIT: Duration = Duration::from_millis(100);
const RECOVERY_BACKOFF: Duration = Duration::from_secs(1);
const REBASE_THRESHOLD_TICKS: u32 = 5;

/// Abstraction over a desktop-duplication source, so the pacing and
/// drop-handling logic can be exercised with a deterministic fake instead of
/// real GPU capture.
pub trait CaptureSource: Send {
    fn width(&self) -> usize;
    fn height(&self) -> usize;

    /// Non-blocking poll for the next frame, copied into `out` (sized to
    /// the pool's `frame_size`). Returns the number of valid bytes written,
    /// or `Ok(None)` if no new frame is ready yet (not an error); `Err` is
    /// a fatal duplication fault that warrants recovery.
    ///
    /// Takes a caller-owned buffer rather than returning a borrow: the
    /// underlying duplication APIs hand back frame data whose lifetime is
    /// tied to the next `try_frame` call, not to `self`, so copying here
    /// once is simpler than fighting that borrow at the trait boundary.
    fn try_frame(&mut self, out: &mut [u8]) -> Result<Option<usize>, CaptureError>;
}

/// Factory used both for the initial acquire and for recovery reacquires.
pub trait CaptureSourceFactory: Send {
    fn acquire(&mut self, monitor_index: usize) -> Result<Box<dyn CaptureSource>, CaptureError>;
}

pub struct ScrapCaptureFactory;

impl CaptureSourceFactory for ScrapCaptureFactory {
    fn acquire(&mut self, monitor_index: usize) -> Result<Box<dyn CaptureSource>, CaptureError> {
        let displays = scrap::Display::all()
            .map_err(|e| CaptureError::DuplicationUnavailable(e.to_string()))?;
        if displays.is_empty() {
            return Err(CaptureError::NoMonitors);
        }
        if monitor_index >= displays.len() {
            return Err(CaptureError::MonitorOutOfRange {
                requested: monitor_index,
                available: displays.len(),
            });
        }
        let display = displays.into_iter().nth(monitor_index).unwrap();
        let (width, height) = (display.width(), display.height());
        let capturer = scrap::Capturer::new(display)
            .map_err(|e| CaptureError::DuplicationUnavailable(e.to_string()))?;
        Ok(Box::new(ScrapCaptureSource {
            capturer,
            width,
            height,
        }))
    }
}

struct ScrapCaptureSource {
    capturer: scrap::Capturer,
    width: usize,
    height: usize,
}

impl CaptureSource for ScrapCaptureSource {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn try_frame(&mut self, out: &mut [u8]) -> Result<Option<usize>, CaptureError> {
        match self.capturer.frame() {
            Ok(frame) => {
                let n = frame.len().min(out.len());
                out[..n].copy_from_slice(&frame[..n]);
                Ok(Some(n))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(CaptureError::DuplicationUnavailable(e.to_string())),
        }
    }
}

/// Acquire a source just long enough to read its dimensions, then drop it.
/// The recorder facade needs `width`/`height` to size the frame pool and the
/// encoder's raw video input before the capture thread itself starts (which
/// acquires its own, independent source).
pub fn probe_dimensions(
    factory: &mut dyn CaptureSourceFactory,
    monitor_index: usize,
) -> Result<(usize, usize), CaptureError> {
    let source = factory.acquire(monitor_index)?;
    Ok((source.width(), source.height()))
}

/// Owns the capture thread; dropping it (or calling [`CaptureLoop::stop`])
/// signals the thread to exit and joins it.
pub struct CaptureLoop {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureLoop {
    pub fn start(
        mut factory: Box<dyn CaptureSourceFactory>,
        monitor_index: usize,
        fps: u32,
        pool: Arc<FrameBufferPool>,
        mut sender: FrameSender,
        metrics: Arc<MetricsCollector>,
        events: broadcast::Sender<RecorderEvent>,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self, CaptureError> {
        // Fail fast on an unrecoverable initial acquire (no monitors, bad
        // index) rather than only discovering it inside the thread.
        let source = factory.acquire(monitor_index)?;

        // One breaker per session: a duplication surface that keeps stalling
        // and barely recovering should eventually stop retrying altogether
        // rather than pay the same three-attempt, 100ms-spaced cost forever.
        let breaker = Arc::new(CircuitBreaker::new(
            "capture-recovery",
            CircuitBreakerConfig {
                failure_threshold: MAX_RECOVERY_ATTEMPTS,
                success_threshold: 1,
                timeout: Duration::from_secs(5),
                failure_window: Duration::from_secs(30),
            },
        ));

        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handle = thread::Builder::new()
            .name("capture-loop".into())
            .spawn(move || {
                run(
                    factory, source, monitor_index, fps, pool, sender, metrics, events, stop_clone, breaker,
                    runtime,
                )
            })
            .expect("failed to spawn capture-loop thread");

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    mut factory: Box<dyn CaptureSourceFactory>,
    mut source: Box<dyn CaptureSource>,
    monitor_index: usize,
    fps: u32,
    pool: Arc<FrameBufferPool>,
    mut sender: FrameSender,
    metrics: Arc<MetricsCollector>,
    events: broadcast::Sender<RecorderEvent>,
    stop: Arc<AtomicBool>,
    breaker: Arc<CircuitBreaker>,
    runtime: tokio::runtime::Handle,
) {
    let tick = Duration::from_secs_f64(1.0 / fps as f64);
    let stats_interval = (fps as u64 * 10).max(1);

    let mut last_valid: Option<Vec<u8>> = None;
    let mut consecutive_misses: u32 = 0;
    let mut next_tick = Instant::now();
    let run_started = Instant::now();

    let mut produced: u64 = 0;
    let mut capture_drops: u64 = 0;
    let mut since_stats: u64 = 0;

    while !stop.load(Ordering::Relaxed) {
        wait_for_tick(&mut next_tick, tick);

        let mut buf = pool.rent();
        let poll_result = source.try_frame(&mut buf);

        match poll_result {
            Ok(Some(n)) => {
                consecutive_misses = 0;

                match &mut last_valid {
                    Some(cached) => cached[..n].copy_from_slice(&buf[..n]),
                    None => last_valid = Some(buf.clone()),
                }

                sender.publish(Frame {
                    buffer: buf,
                    valid_length: n,
                });
                produced += 1;
            }
            Ok(None) => {
                pool.release(buf);
                consecutive_misses += 1;
                if consecutive_misses <= 2 {
                    if let Some(cached) = &last_valid {
                        let mut buf = pool.rent();
                        let n = cached.len().min(buf.len());
                        buf[..n].copy_from_slice(&cached[..n]);
                        sender.publish(Frame {
                            buffer: buf,
                            valid_length: n,
                        });
                        produced += 1;
                    }
                } else {
                    capture_drops += 1;
                    if consecutive_misses >= 10 {
                        match recover(&mut factory, monitor_index, &breaker, &runtime) {
                            Ok(new_source) => {
                                source = new_source;
                                consecutive_misses = 0;
                                info!("capture recovered after stall");
                            }
                            Err(e) => {
                                error!("capture recovery exhausted, backing off: {e}");
                                emit_error(&events, e.to_string());
                                thread::sleep(RECOVERY_BACKOFF);
                            }
                        }
                    }
                }
            }
            Err(e) => {
                pool.release(buf);
                warn!("capture error, attempting recovery: {e}");
                match recover(&mut factory, monitor_index, &breaker, &runtime) {
                    Ok(new_source) => {
                        source = new_source;
                        consecutive_misses = 0;
                    }
                    Err(e) => {
                        error!("capture recovery exhausted, backing off: {e}");
                        emit_error(&events, e.to_string());
                        thread::sleep(RECOVERY_BACKOFF);
                    }
                }
            }
        }

        since_stats += 1;
        if since_stats >= stats_interval {
            since_stats = 0;
            let elapsed = run_started.elapsed().as_secs_f32().max(0.001);
            let effective_fps = produced as f32 / elapsed;
            let stats = PerformanceStats {
                fps: effective_fps,
                frames_produced: produced,
                capture_drops,
                queue_drops: sender.dropped_count(),
                pool_hit_rate: pool.hit_rate(),
                ..PerformanceStats::default()
            };
            let metrics = metrics.clone();
            tokio_block_update(&runtime, &metrics, stats);
        }

        next_tick += tick;
    }

    debug!("capture loop exiting, produced {produced} frames, {capture_drops} drops");
}

/// The capture thread is synchronous; the metrics collector's fields are
/// behind a tokio `RwLock` because the rest of the crate is async. Rather
/// than drag the capture loop onto a runtime, hop onto the facade's runtime
/// (captured once by `CaptureLoop::start` and threaded down through `run`)
/// for a one-off update task instead of blocking the capture thread on it.
fn tokio_block_update(runtime: &tokio::runtime::Handle, metrics: &Arc<MetricsCollector>, stats: PerformanceStats) {
    let metrics = metrics.clone();
    runtime.spawn(async move {
        metrics.update_stats(stats).await;
    });
}

/// Broadcast a non-fatal capture error. `send` only fails when there are no
/// subscribers left, which just means nobody is listening for events right
/// now — not something the capture thread needs to act on.
fn emit_error(events: &broadcast::Sender<RecorderEvent>, message: String) {
    let _ = events.send(RecorderEvent::Error {
        source: "capture".to_string(),
        message,
        is_fatal: false,
    });
}

fn wait_for_tick(next_tick: &mut Instant, tick: Duration) {
    let now = Instant::now();
    if now < *next_tick {
        let remaining = *next_tick - now;
        if remaining > Duration::from_millis(2) {
            thread::sleep(remaining - Duration::from_millis(1));
        }
        while Instant::now() < *next_tick {
            thread::yield_now();
        }
    } else if now > *next_tick + tick * REBASE_THRESHOLD_TICKS {
        // Far enough behind that catching up would just burn frames trying
        // to replay a schedule nobody will see; rebase to now instead.
        *next_tick = now;
    }
}

/// Attempt to reacquire a capture source, up to `MAX_RECOVERY_ATTEMPTS`
/// times. Each attempt is routed through `breaker` so that failures persist
/// across distinct stall events within the session: once the breaker opens,
/// further calls fail immediately instead of sleeping and retrying against a
/// surface that has already burned its budget.
fn recover(
    factory: &mut Box<dyn CaptureSourceFactory>,
    monitor_index: usize,
    breaker: &CircuitBreaker,
    runtime: &tokio::runtime::Handle,
) -> Result<Box<dyn CaptureSource>, CaptureError> {
    runtime.block_on(async {
        for attempt in 1..=MAX_RECOVERY_ATTEMPTS {
            if breaker.get_state().await == CircuitState::Open {
                break;
            }
            thread::sleep(RECOVERY_WAIT);
            let result = breaker
                .call(|| async { factory.acquire(monitor_index).map_err(|e| anyhow::anyhow!(e.to_string())) })
                .await;
            match result {
                Ok(source) => return Ok(source),
                Err(e) if attempt < MAX_RECOVERY_ATTEMPTS => {
                    warn!("capture recovery attempt {attempt} failed: {e}");
                }
                Err(_) => {}
            }
        }
        Err(CaptureError::RecoveryExhausted {
            attempts: MAX_RECOVERY_ATTEMPTS,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FrameBufferPool;

    struct FakeSource {
        width: usize,
        height: usize,
        frames: Vec<Option<Vec<u8>>>,
        index: usize,
    }

    impl CaptureSource for FakeSource {
        fn width(&self) -> usize {
            self.width
        }
        fn height(&self) -> usize {
            self.height
        }
        fn try_frame(&mut self, out: &mut [u8]) -> Result<Option<usize>, CaptureError> {
            let item = self.frames.get(self.index).cloned().flatten();
            self.index = (self.index + 1).min(self.frames.len().saturating_sub(1));
            match item {
                Some(data) => {
                    let n = data.len().min(out.len());
                    out[..n].copy_from_slice(&data[..n]);
                    Ok(Some(n))
                }
                None => Ok(None),
            }
        }
    }

    struct FakeFactory {
        width: usize,
        height: usize,
    }

    impl CaptureSourceFactory for FakeFactory {
        fn acquire(&mut self, _monitor_index: usize) -> Result<Box<dyn CaptureSource>, CaptureError> {
            Ok(Box::new(FakeSource {
                width: self.width,
                height: self.height,
                frames: vec![Some(vec![7u8; self.width * self.height * 4])],
                index: 0,
            }))
        }
    }

    #[test]
    fn wait_for_tick_rebases_when_far_behind() {
        let tick = Duration::from_millis(16);
        let mut next_tick = Instant::now() - tick * 20;
        wait_for_tick(&mut next_tick, tick);
        assert!(next_tick.elapsed() < tick);
    }

    #[tokio::test]
    async fn recover_gives_up_after_max_attempts() {
        struct AlwaysFails;
        impl CaptureSourceFactory for AlwaysFails {
            fn acquire(&mut self, _: usize) -> Result<Box<dyn CaptureSource>, CaptureError> {
                Err(CaptureError::DuplicationUnavailable("gone".into()))
            }
        }
        let mut factory: Box<dyn CaptureSourceFactory> = Box::new(AlwaysFails);
        let breaker = CircuitBreaker::new(
            "test-capture-recovery",
            CircuitBreakerConfig {
                failure_threshold: MAX_RECOVERY_ATTEMPTS,
                success_threshold: 1,
                timeout: Duration::from_secs(5),
                failure_window: Duration::from_secs(30),
            },
        );
        let runtime = tokio::runtime::Handle::current();
        let result =
            tokio::task::spawn_blocking(move || recover(&mut factory, 0, &breaker, &runtime))
                .await
                .unwrap();
        assert!(matches!(
            result,
            Err(CaptureError::RecoveryExhausted { attempts: 3 })
        ));
    }

    #[test]
    fn fake_source_reports_configured_dimensions() {
        let mut factory = FakeFactory {
            width: 64,
            height: 36,
        };
        let source = factory.acquire(0).unwrap();
        assert_eq!(source.width(), 64);
        assert_eq!(source.height(), 36);
    }

    #[test]
    fn probe_dimensions_reports_factory_size_without_leaking_the_source() {
        let mut factory = FakeFactory {
            width: 64,
            height: 36,
        };
        let (width, height) = probe_dimensions(&mut factory, 0).unwrap();
        assert_eq!((width, height), (64, 36));
    }

    #[test]
    fn pool_rent_matches_frame_dimensions() {
        let pool = Arc::new(FrameBufferPool::new(64 * 36 * 4));
        let buf = pool.rent();
        assert_eq!(buf.len(), 64 * 36 * 4);
    }
}
