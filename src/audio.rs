//! Audio sidecar writer.
//!
//! Desktop (loopback) and microphone audio are captured on their own
//! OS-thread capture loops and written to separate WAV sidecars next to the
//! segment buffer, so the snapshot builder can mix them in at mux time
//! rather than forcing the encoder to juggle a third input stream live.
//! Desktop loopback is WASAPI-only ([`wasapi`] crate — `cpal` has no
//! loopback mode); the microphone uses `cpal` for cross-platform input.
//!
//! Each track is capture-thread -> bounded `crossbeam-channel` ->
//! writer-thread, mirroring the capture/encode split used for video: the
//! capture thread never blocks on disk I/O.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::config::AudioConfig;
use crate::utils::error::AudioError;

const AUDIO_CHANNEL_CAPACITY: usize = 64;
const SAMPLE_RATE: u32 = 48_000;
const CHANNELS: u16 = 2;

/// One block of interleaved f32 samples plus the volume to apply before
/// writing (applied in the writer thread so the capture thread stays a
/// straight copy-and-send).
struct AudioChunk {
    samples: Vec<f32>,
}

/// A running capture+writer pair for one track (desktop or microphone).
struct AudioTrack {
    stop: Arc<AtomicBool>,
    capture_thread: Option<JoinHandle<()>>,
    writer_thread: Option<JoinHandle<()>>,
    path: PathBuf,
    /// Milliseconds between recorder start and this track's first sample,
    /// needed so the snapshot builder can align seeks against a sidecar
    /// that started later than the video buffer.
    start_offset_ms: u64,
}

impl AudioTrack {
    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(t) = self.capture_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.writer_thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for AudioTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handles produced by [`AudioSidecarWriter::start`]; `None` for a track
/// that was disabled or whose device failed to open (audio failures are
/// never fatal to the recording session).
pub struct AudioSidecars {
    desktop: Option<AudioTrack>,
    microphone: Option<AudioTrack>,
}

impl AudioSidecars {
    pub fn desktop_sidecar(&self) -> Option<(&Path, u64)> {
        self.desktop.as_ref().map(|t| (t.path.as_path(), t.start_offset_ms))
    }

    pub fn microphone_sidecar(&self) -> Option<(&Path, u64)> {
        self.microphone
            .as_ref()
            .map(|t| (t.path.as_path(), t.start_offset_ms))
    }

    pub fn stop(mut self) {
        if let Some(mut t) = self.desktop.take() {
            t.stop();
        }
        if let Some(mut t) = self.microphone.take() {
            t.stop();
        }
    }
}

/// Starts whichever tracks `config` requests. Device enumeration and
/// stream-open failures are logged and degrade that one track to `None`
/// rather than failing the whole recorder start.
pub fn start(config: &AudioConfig, save_dir: &Path, session_started: Instant) -> AudioSidecars {
    let desktop = if config.record_audio && config.record_desktop_audio {
        match start_desktop_loopback(
            save_dir.join("desktop_audio.wav"),
            config.desktop_volume,
            config.desktop_device_id.clone(),
            session_started,
        ) {
            Ok(track) => Some(track),
            Err(e) => {
                warn!("desktop audio capture unavailable, continuing without it: {e}");
                None
            }
        }
    } else {
        None
    };

    let microphone = if config.record_audio && config.record_microphone {
        match start_microphone(
            save_dir.join("microphone_audio.wav"),
            config.microphone_volume,
            config.microphone_device_id.clone(),
            session_started,
        ) {
            Ok(track) => Some(track),
            Err(e) => {
                warn!("microphone capture unavailable, continuing without it: {e}");
                None
            }
        }
    } else {
        None
    };

    AudioSidecars { desktop, microphone }
}

/// List available microphone input devices as `(display_name, opaque_id)`
/// pairs for the settings layer. The id is whatever `AudioConfig`'s
/// `microphone_device_id` expects, so a pair picked from this list can be
/// fed straight back into the config.
pub fn enumerate_microphones() -> Result<Vec<(String, String)>, AudioError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| AudioError::EnumerationFailed(e.to_string()))?;

    Ok(devices
        .filter_map(|d| d.name().ok())
        .map(|name| (name.clone(), name))
        .collect())
}

/// List available desktop loopback endpoints as `(display_name, opaque_id)`
/// pairs. Loopback capture is WASAPI-only, so this is only meaningful on
/// Windows.
#[cfg(target_os = "windows")]
pub fn enumerate_loopback_endpoints() -> Result<Vec<(String, String)>, AudioError> {
    use wasapi::{Direction, DeviceCollection};

    let collection = DeviceCollection::new(&Direction::Render)
        .map_err(|e| AudioError::EnumerationFailed(format!("{e:?}")))?;
    let count = collection
        .get_nbr_devices()
        .map_err(|e| AudioError::EnumerationFailed(format!("{e:?}")))?;

    let mut endpoints = Vec::with_capacity(count as usize);
    for i in 0..count {
        let device = collection
            .get_device_at_index(i)
            .map_err(|e| AudioError::EnumerationFailed(format!("{e:?}")))?;
        let name = device
            .get_friendlyname()
            .map_err(|e| AudioError::EnumerationFailed(format!("{e:?}")))?;
        let id = device
            .get_id()
            .map_err(|e| AudioError::EnumerationFailed(format!("{e:?}")))?;
        endpoints.push((name, id));
    }
    Ok(endpoints)
}

#[cfg(not(target_os = "windows"))]
pub fn enumerate_loopback_endpoints() -> Result<Vec<(String, String)>, AudioError> {
    Err(AudioError::LoopbackUnsupported)
}

fn spec() -> hound::WavSpec {
    hound::WavSpec {
        channels: CHANNELS,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    }
}

fn spawn_writer(
    path: PathBuf,
    rx: Receiver<AudioChunk>,
    volume: f32,
) -> Result<JoinHandle<()>, AudioError> {
    let writer = hound::WavWriter::create(&path, spec()).map_err(|e| AudioError::WavWrite {
        path: path.clone(),
        source: e,
    })?;

    Ok(thread::spawn(move || {
        let mut writer = writer;
        while let Ok(chunk) = rx.recv() {
            for sample in chunk.samples {
                let scaled = (sample * volume).clamp(-1.0, 1.0);
                if let Err(e) = writer.write_sample(scaled) {
                    error!("failed writing audio sample: {e}");
                    return;
                }
            }
        }
        if let Err(e) = writer.finalize() {
            error!("failed finalizing wav sidecar: {e}");
        }
    }))
}

fn start_microphone(
    path: PathBuf,
    volume: f32,
    device_id: Option<String>,
    session_started: Instant,
) -> Result<AudioTrack, AudioError> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let host = cpal::default_host();
    let device = match &device_id {
        Some(id) => host
            .input_devices()
            .map_err(|e| AudioError::EnumerationFailed(e.to_string()))?
            .find(|d| d.name().map(|n| &n == id).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(id.clone()))?,
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("default input".into()))?,
    };

    let config = device
        .default_input_config()
        .map_err(|e| AudioError::StreamOpenFailed(e.to_string()))?;

    let (tx, rx) = crossbeam_channel::bounded::<AudioChunk>(AUDIO_CHANNEL_CAPACITY);
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_thread = stop.clone();
    let start_offset_ms = session_started.elapsed().as_millis() as u64;

    let writer_thread = spawn_writer(path.clone(), rx, volume)?;

    let sample_format = config.sample_format();
    let stream_config: cpal::StreamConfig = config.into();

    let capture_thread = thread::spawn(move || {
        // cpal streams must be built and polled from the thread that owns
        // them; the stream itself drives capture via its own callback
        // thread, so this thread's job is just to keep the stream alive
        // until told to stop.
        let stream = match sample_format {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &stream_config,
                move |data: &[f32], _| {
                    let _ = tx.try_send(AudioChunk {
                        samples: data.to_vec(),
                    });
                },
                move |err| error!("microphone stream error: {err}"),
                None,
            ),
            _ => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _| {
                    let samples = data.iter().map(|s| *s as f32 / i16::MAX as f32).collect();
                    let _ = tx.try_send(AudioChunk { samples });
                },
                move |err| error!("microphone stream error: {err}"),
                None,
            ),
        };

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                error!("failed to build microphone input stream: {e}");
                return;
            }
        };

        if let Err(e) = stream.play() {
            error!("failed to start microphone stream: {e}");
            return;
        }

        while !stop_for_thread.load(Ordering::Relaxed) {
            thread::sleep(std::time::Duration::from_millis(50));
        }
    });

    info!("microphone capture started");
    Ok(AudioTrack {
        stop,
        capture_thread: Some(capture_thread),
        writer_thread: Some(writer_thread),
        path,
        start_offset_ms,
    })
}

#[cfg(target_os = "windows")]
fn start_desktop_loopback(
    path: PathBuf,
    volume: f32,
    _device_id: Option<String>,
    session_started: Instant,
) -> Result<AudioTrack, AudioError> {
    use wasapi::*;

    initialize_mta()
        .ok()
        .map_err(|e| AudioError::StreamOpenFailed(format!("COM init failed: {e:?}")))?;

    let enumerator =
        DeviceEnumerator::new().map_err(|e| AudioError::EnumerationFailed(format!("{e:?}")))?;
    let device = enumerator
        .get_default_device(&Direction::Render)
        .map_err(|e| AudioError::DeviceNotFound(format!("default render device: {e:?}")))?;

    let mut audio_client = device
        .get_iaudioclient()
        .map_err(|e| AudioError::StreamOpenFailed(format!("{e:?}")))?;

    let desired_format = WaveFormat::new(32, 32, &SampleType::Float, SAMPLE_RATE as usize, CHANNELS as usize, None);
    let (_def_time, min_time) = audio_client
        .get_device_period()
        .map_err(|e| AudioError::StreamOpenFailed(format!("{e:?}")))?;
    let mode = StreamMode::EventsShared {
        autoconvert: true,
        buffer_duration_hns: min_time,
    };
    audio_client
        .initialize_client(&desired_format, &Direction::Capture, &mode)
        .map_err(|e| AudioError::StreamOpenFailed(format!("{e:?}")))?;
    let event_handle = audio_client
        .set_get_eventhandle()
        .map_err(|e| AudioError::StreamOpenFailed(format!("{e:?}")))?;
    let capture_client = audio_client
        .get_audiocaptureclient()
        .map_err(|e| AudioError::StreamOpenFailed(format!("{e:?}")))?;

    let (tx, rx) = crossbeam_channel::bounded::<AudioChunk>(AUDIO_CHANNEL_CAPACITY);
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_thread = stop.clone();
    let start_offset_ms = session_started.elapsed().as_millis() as u64;

    let writer_thread = spawn_writer(path.clone(), rx, volume)?;

    let capture_thread = thread::spawn(move || {
        if let Err(e) = audio_client.start_stream() {
            error!("failed to start wasapi loopback stream: {e:?}");
            return;
        }
        let mut queue: std::collections::VecDeque<u8> = std::collections::VecDeque::new();
        while !stop_for_thread.load(Ordering::Relaxed) {
            if event_handle.wait_for_event(100).is_err() {
                continue;
            }
            if capture_client.read_from_device_to_deque(&mut queue).is_err() {
                continue;
            }
            let bytes_per_sample = 4usize;
            let full_samples = queue.len() / bytes_per_sample;
            if full_samples == 0 {
                continue;
            }
            let mut samples = Vec::with_capacity(full_samples);
            for _ in 0..full_samples {
                let bytes: Vec<u8> = (0..bytes_per_sample).filter_map(|_| queue.pop_front()).collect();
                samples.push(f32::from_le_bytes(bytes.try_into().unwrap()));
            }
            let _ = tx.try_send(AudioChunk { samples });
        }
        debug!("wasapi loopback capture thread exiting");
    });

    info!("desktop loopback capture started");
    Ok(AudioTrack {
        stop,
        capture_thread: Some(capture_thread),
        writer_thread: Some(writer_thread),
        path,
        start_offset_ms,
    })
}

#[cfg(not(target_os = "windows"))]
fn start_desktop_loopback(
    _path: PathBuf,
    _volume: f32,
    _device_id: Option<String>,
    _session_started: Instant,
) -> Result<AudioTrack, AudioError> {
    Err(AudioError::LoopbackUnsupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn volume_scaling_clamps_to_valid_range() {
        let scaled = (1.0f32 * 2.0).clamp(-1.0, 1.0);
        assert_eq!(scaled, 1.0);
        let scaled = (-0.5f32 * 2.0).clamp(-1.0, 1.0);
        assert_eq!(scaled, -1.0);
    }

    #[test]
    fn writer_finalizes_a_valid_wav_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let (tx, rx) = crossbeam_channel::bounded(4);
        let handle = spawn_writer(path.clone(), rx, 1.0).unwrap();
        tx.send(AudioChunk {
            samples: vec![0.1, -0.1, 0.2, -0.2],
        })
        .unwrap();
        drop(tx);
        handle.join().unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, CHANNELS);
    }

    #[test]
    #[ignore]
    fn enumerate_microphones_lists_real_input_devices() {
        let devices = enumerate_microphones().unwrap();
        assert!(!devices.is_empty());
    }

    #[test]
    #[cfg(not(target_os = "windows"))]
    fn loopback_reports_unsupported_off_windows() {
        let dir = tempdir().unwrap();
        let result = start_desktop_loopback(
            dir.path().join("d.wav"),
            1.0,
            None,
            Instant::now(),
        );
        assert!(matches!(result, Err(AudioError::LoopbackUnsupported)));
    }
}
