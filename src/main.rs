// Prevents additional console window on Windows in release, DO NOT REMOVE!!
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

//! Minimal demo binary exercising [`instant_replay_core::Recorder`] from the
//! command line. Hotkey registration, tray UI and settings persistence are
//! a hosting application's job, not this crate's; this binary just starts a
//! session, waits for Enter keypresses to trigger clip saves, and disposes
//! cleanly on Ctrl+C.

use std::io::BufRead;
use std::sync::Arc;

use instant_replay_core::utils::cleanup::{CleanupConfig, CleanupManager};
use instant_replay_core::utils::logging::{init_logging, LogConfig};
use instant_replay_core::{Recorder, RecorderConfig, RecorderEvent};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn available_monitors() -> usize {
    scrap::Display::all().map(|d| d.len()).unwrap_or(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_dir = dirs::data_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("instant-replay")
        .join("logs");
    init_logging(LogConfig::development(log_dir))?;

    info!("starting instant-replay-demo");

    let save_path = dirs::video_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("InstantReplay");
    std::fs::create_dir_all(&save_path)?;

    let cleanup = CleanupManager::new(save_path.clone(), CleanupConfig::default());
    if let Err(e) = cleanup.cleanup_on_startup().await {
        error!("startup cleanup failed: {e}");
    }

    let config = RecorderConfig {
        save_path,
        ..Default::default()
    };

    let recorder = Arc::new(Recorder::new(config, available_monitors())?);

    let mut events = recorder.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RecorderEvent::RecordingStateChanged(state) => info!(?state, "recording state changed"),
                RecorderEvent::ClipSaved { filename, size_bytes, save_duration, .. } => {
                    info!(filename, size_bytes, ?save_duration, "clip saved");
                }
                RecorderEvent::Error { source, message, is_fatal } => {
                    error!(source, message, is_fatal, "recorder error");
                }
                RecorderEvent::PerformanceStats(stats) => {
                    tracing::debug!(?stats, "performance stats");
                }
            }
        }
    });

    recorder.start().await?;
    info!("recording started; press Enter to save a clip, Ctrl+C to exit");

    let stdin_lines = {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                if line.is_err() || tx.send(()).is_err() {
                    break;
                }
            }
        });
        rx
    };
    let mut stdin_lines = stdin_lines;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            line = stdin_lines.recv() => {
                if line.is_none() {
                    break;
                }
                match recorder.save_clip(CancellationToken::new()).await {
                    Ok(filename) => info!(filename, "clip saved on demand"),
                    Err(e) => error!("failed to save clip: {e}"),
                }
            }
        }
    }

    recorder.dispose().await?;
    Ok(())
}
