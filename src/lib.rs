//! Continuous desktop capture into a rolling on-disk segment buffer, with a
//! hotkey-triggered snapshot that materializes the buffer tail into a
//! finalized video file.
//!
//! This crate is the core: the capture/encode/retention/snapshot pipeline
//! and the facade that wires it together. Tray icons, hotkey registration,
//! settings persistence and the rest of a desktop app's UI layer are
//! expected to live outside this crate and bind to [`recorder::Recorder`].

pub mod audio;
pub mod capture;
pub mod channel;
pub mod config;
pub mod encoder;
pub mod pool;
pub mod recorder;
pub mod retention;
pub mod segment;
pub mod snapshot;
pub mod utils;

pub use config::RecorderConfig;
pub use recorder::{Recorder, RecorderEvent, RecordingState};
pub use utils::error::{ConfigError, RecorderError, Result};
