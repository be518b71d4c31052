//! Recorder facade: the single entry point that wires capture, encode,
//! audio, retention and snapshot together behind one state machine.
//!
//! `Idle -> Starting -> Running <-> Paused -> Disposed`. Only the four
//! public operations below cross states; every other type in this crate is
//! plumbing one of them drives. Each operation holds the state lock for its
//! whole duration, so `start`/`pause`/`dispose` calls from two tasks at once
//! serialize rather than race.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::audio::{self, AudioSidecars};
use crate::capture::{self, CaptureLoop, ScrapCaptureFactory};
use crate::channel::frame_channel;
use crate::config::RecorderConfig;
use crate::encoder::EncoderProcess;
use crate::pool::FrameBufferPool;
use crate::retention::SegmentRetention;
use crate::segment::SegmentStore;
use crate::snapshot::{self, SidecarInput, SnapshotAudioInputs};
use crate::utils::error::RecorderError;
use crate::utils::metrics::{HealthThresholds, MetricsCollector, PerformanceStats};
use crate::utils::Result;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const POOL_WARMUP: usize = 4;
const WRITER_DRAIN_GRACE: Duration = Duration::from_millis(100);
const ENCODER_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const STATS_FORWARD_INTERVAL: Duration = Duration::from_secs(1);

#[cfg(windows)]
mod timer_resolution {
    use windows::Win32::Media::{timeBeginPeriod, timeEndPeriod};

    /// Raises the Windows system timer to 1ms resolution for the life of the
    /// guard; without this, `thread::sleep`'s default ~15.6ms granularity
    /// would blow the capture loop's per-tick budget at anything above ~60
    /// fps.
    pub struct TimerResolutionGuard;

    impl TimerResolutionGuard {
        pub fn acquire() -> Self {
            unsafe {
                timeBeginPeriod(1);
            }
            Self
        }
    }

    impl Drop for TimerResolutionGuard {
        fn drop(&mut self) {
            unsafe {
                timeEndPeriod(1);
            }
        }
    }
}

#[cfg(not(windows))]
mod timer_resolution {
    pub struct TimerResolutionGuard;

    impl TimerResolutionGuard {
        pub fn acquire() -> Self {
            Self
        }
    }
}

use timer_resolution::TimerResolutionGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Starting,
    Running,
    Paused,
    Disposed,
}

/// Events the facade publishes for a UI or logging layer to consume.
#[derive(Debug, Clone)]
pub enum RecorderEvent {
    RecordingStateChanged(RecordingState),
    ClipSaved {
        filename: String,
        path: std::path::PathBuf,
        size_bytes: u64,
        save_duration: Duration,
    },
    Error {
        source: String,
        message: String,
        is_fatal: bool,
    },
    PerformanceStats(PerformanceStats),
}

/// Everything that exists only while `Running`. Built fresh by every
/// `start()` call, including a resume from `Paused` — only the segment
/// store and the session clock persist across a pause.
struct RunningSession {
    capture: CaptureLoop,
    /// `Option` only so [`stop_session`], which destructures `self` by
    /// value, can hand the encoder to its consuming `stop()`; always `Some`
    /// for a session still installed in `Recorder::session`.
    encoder: Option<EncoderProcess>,
    audio: AudioSidecars,
    retention: SegmentRetention,
    stats_forwarder: JoinHandle<()>,
    store: Arc<SegmentStore>,
    session_started: Instant,
    _timer_guard: TimerResolutionGuard,
}

pub struct Recorder {
    config: RecorderConfig,
    state: Mutex<RecordingState>,
    store: Mutex<Option<Arc<SegmentStore>>>,
    session_started: Mutex<Option<Instant>>,
    session: Mutex<Option<RunningSession>>,
    metrics: Arc<MetricsCollector>,
    events: broadcast::Sender<RecorderEvent>,
}

impl Recorder {
    /// Validates `config` against `available_monitors` and constructs an
    /// idle recorder. No resources are acquired until [`Recorder::start`].
    pub fn new(config: RecorderConfig, available_monitors: usize) -> Result<Self> {
        let config = config.validate(available_monitors)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            state: Mutex::new(RecordingState::Idle),
            store: Mutex::new(None),
            session_started: Mutex::new(None),
            session: Mutex::new(None),
            metrics: Arc::new(MetricsCollector::new(HealthThresholds::default())),
            events,
        })
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub async fn state(&self) -> RecordingState {
        *self.state.lock().await
    }

    pub async fn stats(&self) -> PerformanceStats {
        self.metrics.stats().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.events.subscribe()
    }

    /// Transition `Idle`/`Paused` -> `Running`. Resuming from `Paused`
    /// rebuilds the capture/encode/audio pipeline but keeps writing into the
    /// same segment store, so ordinals stay strictly increasing across the
    /// pause.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match *state {
            RecordingState::Idle | RecordingState::Paused => {}
            other => {
                return Err(RecorderError::InvalidState(format!(
                    "cannot start from {other:?}"
                )))
            }
        }
        *state = RecordingState::Starting;

        match self.start_inner().await {
            Ok(()) => {
                *state = RecordingState::Running;
                let _ = self
                    .events
                    .send(RecorderEvent::RecordingStateChanged(RecordingState::Running));
                Ok(())
            }
            Err(e) => {
                *state = RecordingState::Idle;
                self.emit_error("start", &e, true);
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        let store = {
            let mut guard = self.store.lock().await;
            match guard.as_ref() {
                Some(store) => store.clone(),
                None => {
                    let staging_root = self.config.save_path.join("temp_segments");
                    let store = Arc::new(SegmentStore::create(&staging_root)?);
                    *guard = Some(store.clone());
                    store
                }
            }
        };

        let session_started = {
            let mut guard = self.session_started.lock().await;
            *guard.get_or_insert_with(Instant::now)
        };

        let mut probe_factory = ScrapCaptureFactory;
        let (width, height) =
            capture::probe_dimensions(&mut probe_factory, self.config.monitor_index)?;
        let (width, height) = (width as u32, height as u32);

        let pool = Arc::new(FrameBufferPool::new(self.config.frame_size(width, height)));
        pool.warmup(POOL_WARMUP);

        let (sender, receiver) = frame_channel(pool.clone());

        let audio_sidecars = audio::start(&self.config.audio, store.dir(), session_started);

        let encoder = EncoderProcess::start(
            &self.config,
            self.config.encoder,
            width,
            height,
            &store,
            receiver,
        )
        .await?;

        let capture = CaptureLoop::start(
            Box::new(ScrapCaptureFactory),
            self.config.monitor_index,
            self.config.fps,
            pool,
            sender,
            self.metrics.clone(),
            self.events.clone(),
            tokio::runtime::Handle::current(),
        )?;

        let retention = SegmentRetention::start(
            store.clone(),
            self.config.max_segments_to_keep(),
            self.metrics.clone(),
        );

        let events_tx = self.events.clone();
        let metrics_for_forward = self.metrics.clone();
        let stats_forwarder = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_FORWARD_INTERVAL);
            loop {
                ticker.tick().await;
                let stats = metrics_for_forward.stats().await;
                if events_tx.send(RecorderEvent::PerformanceStats(stats)).is_err() {
                    return;
                }
            }
        });

        *self.session.lock().await = Some(RunningSession {
            capture,
            encoder: Some(encoder),
            audio: audio_sidecars,
            retention,
            stats_forwarder,
            store,
            session_started,
            _timer_guard: TimerResolutionGuard::acquire(),
        });

        Ok(())
    }

    /// Transition `Running` -> `Paused`. Segments already on disk are left
    /// alone; only the live pipeline is torn down.
    pub async fn pause(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state != RecordingState::Running {
            return Err(RecorderError::InvalidState(format!(
                "cannot pause from {:?}",
                *state
            )));
        }

        let session = self.session.lock().await.take();
        let Some(session) = session else {
            return Err(RecorderError::InvalidState(
                "no active session to pause".into(),
            ));
        };

        stop_session(session).await;

        *state = RecordingState::Paused;
        let _ = self
            .events
            .send(RecorderEvent::RecordingStateChanged(RecordingState::Paused));
        Ok(())
    }

    /// Materialize the current buffer tail into a finalized clip. Only
    /// valid while `Running`; a snapshot failure does not affect the
    /// recording session, it only surfaces as a non-fatal `Error` event.
    pub async fn save_clip(&self, cancel: CancellationToken) -> Result<String> {
        {
            let state = self.state.lock().await;
            if *state != RecordingState::Running {
                return Err(RecorderError::InvalidState(format!(
                    "save_clip requires Running, got {:?}",
                    *state
                )));
            }
        }

        let (store, audio_inputs) = {
            let session_guard = self.session.lock().await;
            let session = session_guard
                .as_ref()
                .ok_or_else(|| RecorderError::InvalidState("no active session".into()))?;

            let elapsed = session.session_started.elapsed().as_secs_f64();
            let video_duration = (self.config.segments_to_keep()
                * self.config.segment_duration_seconds as usize) as f64;

            let desktop = session.audio.desktop_sidecar().map(|(path, offset_ms)| SidecarInput {
                path: path.to_path_buf(),
                seek_seconds: snapshot::sidecar_seek_offset(elapsed, offset_ms, video_duration),
            });
            let microphone =
                session.audio.microphone_sidecar().map(|(path, offset_ms)| SidecarInput {
                    path: path.to_path_buf(),
                    seek_seconds: snapshot::sidecar_seek_offset(elapsed, offset_ms, video_duration),
                });

            (session.store.clone(), SnapshotAudioInputs { desktop, microphone })
        };

        let started = Instant::now();
        match snapshot::build(&store, &self.config, audio_inputs, cancel).await {
            Ok(path) => {
                let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let _ = self.events.send(RecorderEvent::ClipSaved {
                    filename: filename.clone(),
                    path,
                    size_bytes,
                    save_duration: started.elapsed(),
                });
                Ok(filename)
            }
            Err(e) => {
                let err = RecorderError::Snapshot(e);
                self.emit_error("snapshot", &err, false);
                Err(err)
            }
        }
    }

    /// Full teardown: stops any live session and erases the segment store's
    /// on-disk files. Idempotent once already `Disposed`.
    pub async fn dispose(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state == RecordingState::Disposed {
            return Ok(());
        }

        if let Some(session) = self.session.lock().await.take() {
            stop_session(session).await;
        }

        if let Some(store) = self.store.lock().await.take() {
            match Arc::try_unwrap(store) {
                Ok(store) => {
                    if let Err(e) = store.dispose() {
                        warn!("failed to erase segment store: {e}");
                    }
                }
                Err(store) => {
                    // A retention sweep or similar may briefly still hold a
                    // clone; the directory is still safe to remove directly.
                    let _ = std::fs::remove_dir_all(store.dir());
                }
            }
        }
        *self.session_started.lock().await = None;

        *state = RecordingState::Disposed;
        let _ = self
            .events
            .send(RecorderEvent::RecordingStateChanged(RecordingState::Disposed));
        Ok(())
    }

    fn emit_error(&self, source: &str, err: &RecorderError, is_fatal: bool) {
        warn!("{source} error: {err}");
        let _ = self.events.send(RecorderEvent::Error {
            source: source.to_string(),
            message: err.to_string(),
            is_fatal,
        });
    }
}

/// Shared stop sequence for `pause` and `dispose`: stop capture, give the
/// frame-writer a short grace period to drain the (3-slot) channel, then
/// close/kill the encoder, audio and retention.
async fn stop_session(session: RunningSession) {
    let RunningSession {
        mut capture,
        encoder,
        audio,
        retention,
        stats_forwarder,
        ..
    } = session;

    capture.stop();
    tokio::time::sleep(WRITER_DRAIN_GRACE).await;

    if let Some(encoder) = encoder {
        if let Err(e) = encoder.stop(ENCODER_STOP_TIMEOUT).await {
            warn!("encoder did not stop cleanly: {e}");
        }
    }

    stats_forwarder.abort();
    audio.stop();
    retention.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> RecorderConfig {
        RecorderConfig {
            save_path: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn new_recorder_starts_idle() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::new(test_config(dir.path()), 1).unwrap();
        assert_eq!(recorder.state().await, RecordingState::Idle);
    }

    #[tokio::test]
    async fn pause_from_idle_is_rejected() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::new(test_config(dir.path()), 1).unwrap();
        let result = recorder.pause().await;
        assert!(matches!(result, Err(RecorderError::InvalidState(_))));
    }

    #[tokio::test]
    async fn save_clip_from_idle_is_rejected() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::new(test_config(dir.path()), 1).unwrap();
        let result = recorder.save_clip(CancellationToken::new()).await;
        assert!(matches!(result, Err(RecorderError::InvalidState(_))));
    }

    #[tokio::test]
    async fn dispose_from_idle_is_a_no_op() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::new(test_config(dir.path()), 1).unwrap();
        assert!(recorder.dispose().await.is_ok());
        assert_eq!(recorder.state().await, RecordingState::Disposed);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::new(test_config(dir.path()), 1).unwrap();
        recorder.dispose().await.unwrap();
        assert!(recorder.dispose().await.is_ok());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_construction() {
        let dir = tempdir().unwrap();
        let config = RecorderConfig {
            fps: 1000,
            ..test_config(dir.path())
        };
        assert!(Recorder::new(config, 1).is_err());
    }
}
