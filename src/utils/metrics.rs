//! Performance metrics collection and health monitoring.
//!
//! Tracks capture/encode throughput and system resource utilization, and
//! classifies overall health against configurable thresholds. The Capture
//! Loop feeds [`PerformanceStats`] every `10 * fps` frames (see
//! `capture::CaptureLoop`); the facade forwards it as a
//! `RecorderEvent::PerformanceStats` event.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

/// Snapshot of capture/encode throughput.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceStats {
    /// Effective frames per second since recording started.
    pub fps: f32,

    /// Total frames successfully published to the frame channel.
    pub frames_produced: u64,

    /// Total consecutive-miss drops absorbed by the capture loop.
    pub capture_drops: u64,

    /// Frames dropped by the frame channel's drop-oldest policy.
    pub queue_drops: u64,

    /// Frame buffer pool hit rate (0.0-1.0) since warmup.
    pub pool_hit_rate: f32,

    /// Number of segments currently on disk.
    pub buffer_segments: usize,

    /// Total disk space used by segments, in MB.
    pub buffer_size_mb: f32,

    #[serde(skip, default = "Instant::now")]
    pub last_updated: Instant,
}

impl Default for PerformanceStats {
    fn default() -> Self {
        Self {
            fps: 0.0,
            frames_produced: 0,
            capture_drops: 0,
            queue_drops: 0,
            pool_hit_rate: 0.0,
            buffer_segments: 0,
            buffer_size_mb: 0.0,
            last_updated: Instant::now(),
        }
    }
}

/// Point-in-time system resource usage.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemMetrics {
    pub total_cpu_percent: f32,
    pub available_ram_gb: f32,
}

/// Thresholds used by [`MetricsCollector::check_health`].
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Minimum FPS before warning (default: 0.95 * target handled by caller;
    /// this is the absolute floor, default 55 for a 60fps target).
    pub min_fps: f32,

    /// Maximum queue drops considered acceptable.
    pub max_queue_drops: u64,

    /// Maximum CPU usage before warning.
    pub max_cpu_percent: f32,

    /// Maximum on-disk buffer size before warning, in MB.
    pub max_buffer_mb: f32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_fps: 55.0,
            max_queue_drops: 10,
            max_cpu_percent: 80.0,
            max_buffer_mb: 5000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

/// Collects [`PerformanceStats`] and [`SystemMetrics`] and classifies
/// overall health against [`HealthThresholds`].
pub struct MetricsCollector {
    stats: Arc<RwLock<PerformanceStats>>,
    system: Arc<RwLock<SystemMetrics>>,
    thresholds: HealthThresholds,
    sysinfo: Arc<RwLock<sysinfo::System>>,
}

impl MetricsCollector {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            stats: Arc::new(RwLock::new(PerformanceStats::default())),
            system: Arc::new(RwLock::new(SystemMetrics::default())),
            thresholds,
            sysinfo: Arc::new(RwLock::new(sysinfo::System::new_all())),
        }
    }

    pub async fn stats(&self) -> PerformanceStats {
        self.stats.read().await.clone()
    }

    pub async fn system_metrics(&self) -> SystemMetrics {
        self.system.read().await.clone()
    }

    pub async fn update_stats(&self, stats: PerformanceStats) {
        *self.stats.write().await = stats;
    }

    pub async fn update_buffer_metrics(&self, segments: usize, size_mb: f32) {
        let mut stats = self.stats.write().await;
        stats.buffer_segments = segments;
        stats.buffer_size_mb = size_mb;
        stats.last_updated = Instant::now();
    }

    pub async fn refresh_system_metrics(&self) {
        let mut sys = self.sysinfo.write().await;
        sys.refresh_cpu_all();
        sys.refresh_memory();

        let mut metrics = self.system.write().await;
        let cpu_count = sys.cpus().len().max(1) as f32;
        metrics.total_cpu_percent =
            sys.cpus().iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / cpu_count;
        metrics.available_ram_gb =
            (sys.available_memory() as f64 / 1024.0 / 1024.0 / 1024.0) as f32;
    }

    pub async fn check_health(&self) -> HealthStatus {
        let stats = self.stats.read().await;
        let system = self.system.read().await;

        if stats.fps > 0.0 && stats.fps < self.thresholds.min_fps - 10.0 {
            warn!("critical: fps too low ({:.1})", stats.fps);
            return HealthStatus::Critical;
        }
        if system.total_cpu_percent > 95.0 {
            warn!("critical: cpu usage too high ({:.1}%)", system.total_cpu_percent);
            return HealthStatus::Critical;
        }

        if stats.fps > 0.0 && stats.fps < self.thresholds.min_fps {
            warn!("warning: fps below threshold ({:.1})", stats.fps);
            return HealthStatus::Warning;
        }
        if stats.queue_drops > self.thresholds.max_queue_drops {
            warn!("warning: queue drops above threshold ({})", stats.queue_drops);
            return HealthStatus::Warning;
        }
        if system.total_cpu_percent > self.thresholds.max_cpu_percent {
            warn!("warning: high cpu usage ({:.1}%)", system.total_cpu_percent);
            return HealthStatus::Warning;
        }
        if stats.buffer_size_mb > self.thresholds.max_buffer_mb {
            warn!("warning: buffer size too large ({:.1} MB)", stats.buffer_size_mb);
            return HealthStatus::Warning;
        }

        HealthStatus::Healthy
    }

    /// Spawn a background task that refreshes system metrics and logs
    /// health transitions on a fixed interval.
    pub fn start_background_collection(
        self: Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.refresh_system_metrics().await;

                if !matches!(self.check_health().await, HealthStatus::Healthy) {
                    let stats = self.stats().await;
                    let system = self.system_metrics().await;
                    warn!(
                        "health check: fps={:.1} queue_drops={} cpu={:.1}% ram_avail={:.2}GB",
                        stats.fps, stats.queue_drops, system.total_cpu_percent, system.available_ram_gb
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthy_at_full_fps() {
        let collector = MetricsCollector::new(HealthThresholds::default());
        collector
            .update_stats(PerformanceStats {
                fps: 60.0,
                ..Default::default()
            })
            .await;

        assert_eq!(collector.check_health().await, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn warning_below_min_fps() {
        let collector = MetricsCollector::new(HealthThresholds::default());
        collector
            .update_stats(PerformanceStats {
                fps: 50.0,
                ..Default::default()
            })
            .await;

        assert_eq!(collector.check_health().await, HealthStatus::Warning);
    }

    #[tokio::test]
    async fn critical_far_below_min_fps() {
        let collector = MetricsCollector::new(HealthThresholds::default());
        collector
            .update_stats(PerformanceStats {
                fps: 40.0,
                ..Default::default()
            })
            .await;

        assert_eq!(collector.check_health().await, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn warning_on_excess_queue_drops() {
        let collector = MetricsCollector::new(HealthThresholds::default());
        collector
            .update_stats(PerformanceStats {
                fps: 60.0,
                queue_drops: 50,
                ..Default::default()
            })
            .await;

        assert_eq!(collector.check_health().await, HealthStatus::Warning);
    }
}
