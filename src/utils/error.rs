#![allow(dead_code)]

//! Crate-wide error types.
//!
//! Each subsystem gets its own small error enum scoped to the faults it can
//! actually produce; [`RecorderError`] is the umbrella the facade and its
//! callers deal with.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no monitors available to capture")]
    NoMonitors,

    #[error("monitor index {requested} out of range (have {available})")]
    MonitorOutOfRange { requested: usize, available: usize },

    #[error("failed to acquire desktop duplication surface: {0}")]
    DuplicationUnavailable(String),

    #[error("capture recovery exhausted after {attempts} attempts")]
    RecoveryExhausted { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("failed to spawn encoder process: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("encoder exited before accepting any frames")]
    DiedImmediately,

    #[error("encoder stdin pipe closed")]
    PipeClosed,

    #[error("no hardware encoder detected for requested codec")]
    NoHardwareEncoder,
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("failed to enumerate audio devices: {0}")]
    EnumerationFailed(String),

    #[error("requested audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("failed to open audio stream: {0}")]
    StreamOpenFailed(String),

    #[error("failed to write WAV sidecar {path:?}: {source}")]
    WavWrite {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("desktop loopback capture is not supported on this platform")]
    LoopbackUnsupported,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no segments available yet")]
    NoSegments,

    #[error("failed to spawn mux process: {0}")]
    SpawnFailed(std::io::Error),

    #[error("mux process exited with status {0}")]
    MuxFailed(i32),

    #[error("mux process killed (timeout or cancellation)")]
    Cancelled,

    #[error("failed to write concat manifest: {0}")]
    ManifestWrite(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("fps {0} out of range 15..=144")]
    FpsOutOfRange(u32),

    #[error("buffer_seconds {0} out of range 5..=300")]
    BufferSecondsOutOfRange(u32),

    #[error("bitrate_bps {0} out of range 500000..=50000000")]
    BitrateOutOfRange(u32),

    #[error("crf {0} out of range 0..=51")]
    CrfOutOfRange(u8),

    #[error("volume {0} out of range 0.0..=2.0")]
    VolumeOutOfRange(f32),

    #[error("save_path {0:?} is not a directory")]
    SavePathNotDirectory(PathBuf),
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation not valid in current state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, RecorderError>;
