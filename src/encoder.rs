//! Continuous external `ffmpeg` encoder process.
//!
//! Unlike the teacher's segment-at-a-time `ffmpeg -t <duration>` subprocess
//! per clip, this encoder spawns *one* long-lived `ffmpeg` process per
//! recording session and feeds it raw BGRA frames on stdin; `ffmpeg`'s own
//! segment muxer (`-f segment`) is responsible for rotating output files.
//! That keeps encoder startup latency (and the hardware encoder
//! session-limit churn it can trigger) out of the steady-state capture path
//! entirely — it only happens once, at recorder start.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::FrameReceiver;
use crate::config::{Codec, EncoderChoice, EncoderVendor, Preset, RecorderConfig};
use crate::segment::SegmentStore;
use crate::utils::error::EncoderError;
use crate::utils::retry::{retry_with_backoff, RetryConfig};

const ENCODER_RETRY_CONFIG: RetryConfig = RetryConfig {
    max_attempts: 3,
    initial_delay: std::time::Duration::from_millis(500),
    max_delay: std::time::Duration::from_secs(5),
    backoff_multiplier: 2.0,
    jitter_factor: 0.1,
};

impl EncoderVendor {
    fn encoder_name(self, codec: Codec) -> &'static str {
        match (self, codec) {
            (EncoderVendor::Nvidia, Codec::H264) => "h264_nvenc",
            (EncoderVendor::Nvidia, Codec::H265) => "hevc_nvenc",
            (EncoderVendor::Nvidia, Codec::Av1) => "av1_nvenc",
            (EncoderVendor::Amd, Codec::H264) => "h264_amf",
            (EncoderVendor::Amd, Codec::H265) => "hevc_amf",
            (EncoderVendor::Amd, Codec::Av1) => "av1_amf",
            (EncoderVendor::Intel, Codec::H264) => "h264_qsv",
            (EncoderVendor::Intel, Codec::H265) => "hevc_qsv",
            (EncoderVendor::Intel, Codec::Av1) => "av1_qsv",
            (_, Codec::H264) => "libx264",
            (_, Codec::H265) => "libx265",
            // No hardware VP9 path is wired up; always software-encode it.
            (_, Codec::Vp9) => "libvpx-vp9",
            (_, Codec::Av1) => "libaom-av1",
        }
    }

    /// Encoder-specific options beyond the common bitrate/pix_fmt set. No
    /// vendor currently needs per-codec variation here.
    fn extra_args(self) -> &'static [&'static str] {
        match self {
            EncoderVendor::Nvidia => &["-rc", "vbr", "-rc-lookahead", "20", "-spatial-aq", "1"],
            EncoderVendor::Amd => &["-rc", "vbr_latency", "-quality", "balanced"],
            EncoderVendor::Intel => &["-look_ahead", "1", "-look_ahead_depth", "40"],
            EncoderVendor::Software | EncoderVendor::Auto => &[],
        }
    }
}

impl Preset {
    fn as_ffmpeg_str(self, vendor: EncoderVendor) -> &'static str {
        if matches!(vendor, EncoderVendor::Nvidia) {
            // NVENC presets are p1 (fastest) .. p7 (slowest), not named.
            return match self {
                Preset::Ultrafast => "p1",
                Preset::Veryfast => "p2",
                Preset::Faster => "p3",
                Preset::Fast => "p4",
                Preset::Medium => "p5",
                Preset::Slow => "p6",
            };
        }
        match self {
            Preset::Ultrafast => "ultrafast",
            Preset::Veryfast => "veryfast",
            Preset::Faster => "faster",
            Preset::Fast => "fast",
            Preset::Medium => "medium",
            Preset::Slow => "slow",
        }
    }
}

fn build_args(
    config: &RecorderConfig,
    encoder: EncoderChoice,
    width: u32,
    height: u32,
    template: &std::path::Path,
) -> Vec<String> {
    let vendor = if config.use_hardware_encoding {
        encoder.vendor
    } else {
        EncoderVendor::Software
    };

    let mut args: Vec<String> = vec![
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "bgra".into(),
        "-s".into(),
        format!("{width}x{height}"),
        "-r".into(),
        config.fps.to_string(),
        "-i".into(),
        "pipe:0".into(),
        "-c:v".into(),
        vendor.encoder_name(encoder.codec).into(),
        "-preset".into(),
        vendor.as_ffmpeg_str(config.preset).into(),
        "-b:v".into(),
        config.bitrate_bps.to_string(),
        "-maxrate".into(),
        config.bitrate_bps.to_string(),
        "-bufsize".into(),
        (config.bitrate_bps * 2).to_string(),
        "-crf".into(),
        config.crf.to_string(),
        "-pix_fmt".into(),
        "yuv420p".into(),
    ];

    args.extend(vendor.extra_args().iter().map(|s| s.to_string()));

    args.extend([
        "-f".into(),
        "segment".into(),
        "-segment_time".into(),
        config.segment_duration_seconds.to_string(),
        "-reset_timestamps".into(),
        "1".into(),
        "-segment_format".into(),
        "matroska".into(),
        template.to_string_lossy().into_owned(),
    ]);

    args
}

/// Owns the long-lived `ffmpeg` child process and the task feeding it
/// frames from the [`FrameReceiver`].
pub struct EncoderProcess {
    child: Child,
    stdin_task: JoinHandle<()>,
}

impl EncoderProcess {
    /// Spawn `ffmpeg` and start draining `receiver` into its stdin. Spawn is
    /// retried with backoff since a transient "device busy" from a hardware
    /// encoder is common right after a prior session released it.
    pub async fn start(
        config: &RecorderConfig,
        encoder: EncoderChoice,
        width: u32,
        height: u32,
        segments: &SegmentStore,
        receiver: FrameReceiver,
    ) -> Result<Self, EncoderError> {
        let args = build_args(config, encoder, width, height, &segments.segment_template());
        let args_for_log = args.join(" ");
        debug!("spawning ffmpeg: ffmpeg {args_for_log}");

        let mut child = retry_with_backoff(ENCODER_RETRY_CONFIG, "ffmpeg spawn", || {
            let args = args.clone();
            async move {
                Command::new("ffmpeg")
                    .args(&args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
            }
        })
        .await
        .map_err(|e| {
            EncoderError::SpawnFailed(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })?;

        let stdin = child.stdin.take().ok_or(EncoderError::DiedImmediately)?;

        if let Some(mut stderr) = child.stderr.take() {
            tokio::spawn(async move {
                use tokio::io::AsyncReadExt;
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                if !buf.is_empty() {
                    debug!("ffmpeg stderr: {}", String::from_utf8_lossy(&buf));
                }
            });
        }

        let stdin_task = tokio::spawn(frame_writer(stdin, receiver));

        info!("encoder process started ({}x{})", width, height);
        Ok(Self { child, stdin_task })
    }

    /// Check whether the process has exited without blocking.
    pub fn try_wait(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }

    /// Gracefully stop: close stdin so `ffmpeg` flushes and finalizes the
    /// current segment, then wait up to `timeout` before killing.
    pub async fn stop(mut self, timeout: std::time::Duration) -> Result<(), EncoderError> {
        self.stdin_task.abort();
        drop(self.child.stdin.take());

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("ffmpeg exited cleanly: {status}");
            }
            Ok(Err(e)) => {
                warn!("error waiting on ffmpeg: {e}");
            }
            Err(_) => {
                warn!("ffmpeg did not exit within {timeout:?}, killing");
                let _ = self.child.kill().await;
            }
        }
        Ok(())
    }
}

async fn frame_writer(mut stdin: ChildStdin, mut receiver: FrameReceiver) {
    loop {
        match receiver.try_recv() {
            Some(frame) => {
                let result = stdin.write_all(&frame.buffer[..frame.valid_length]).await;
                receiver.release_frame(frame.buffer);
                if let Err(e) = result {
                    error!("encoder stdin pipe closed: {e}");
                    return;
                }
            }
            None => {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Codec, EncoderChoice, EncoderVendor};

    #[test]
    fn software_fallback_uses_libx264_for_h264() {
        let name = EncoderVendor::Software.encoder_name(Codec::H264);
        assert_eq!(name, "libx264");
    }

    #[test]
    fn nvenc_preset_uses_p_scale() {
        assert_eq!(Preset::Fast.as_ffmpeg_str(EncoderVendor::Nvidia), "p4");
        assert_eq!(Preset::Fast.as_ffmpeg_str(EncoderVendor::Software), "fast");
    }

    #[test]
    fn build_args_includes_segment_muxer() {
        let config = RecorderConfig::default();
        let template = std::path::Path::new("/tmp/out_%06d.mkv");
        let args = build_args(
            &config,
            EncoderChoice {
                codec: Codec::H264,
                vendor: EncoderVendor::Software,
            },
            1920,
            1080,
            template,
        );
        assert!(args.iter().any(|a| a == "segment"));
        assert!(args.iter().any(|a| a == "1920x1080"));
    }
}
