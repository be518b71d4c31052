//! Structured logging setup.
///
/// Rotating JSON file logging for production, pretty console output for
/// development, built on `tracing`.
use std::fs;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level (default: INFO)
    pub level: Level,

    /// Enable file logging (default: true)
    pub file_enabled: bool,

    /// Log directory (default: ./logs)
    pub log_dir: PathBuf,

    /// Enable console logging
    pub console_enabled: bool,

    /// Pretty print console logs (default: true in debug)
    pub console_pretty: bool,
}

impl LogConfig {
    /// Production configuration: rotating JSON file, no console.
    pub fn production(log_dir: PathBuf) -> Self {
        Self {
            level: Level::INFO,
            file_enabled: true,
            log_dir,
            console_enabled: false,
            console_pretty: false,
        }
    }

    /// Development configuration: pretty console plus file.
    pub fn development(log_dir: PathBuf) -> Self {
        Self {
            level: Level::DEBUG,
            file_enabled: true,
            log_dir,
            console_enabled: true,
            console_pretty: true,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_enabled: true,
            log_dir: PathBuf::from("logs"),
            console_enabled: true,
            console_pretty: cfg!(debug_assertions),
        }
    }
}

/// Initialize the global `tracing` subscriber.
///
/// Callers (the demo binary, or a hosting application) call this once at
/// startup. The core library itself never initializes a subscriber.
///
/// # Example
/// ```no_run
/// use std::path::PathBuf;
/// use instant_replay_core::utils::logging::{LogConfig, init_logging};
///
/// let config = LogConfig::production(PathBuf::from("C:/logs"));
/// init_logging(config).expect("failed to initialize logging");
/// ```
pub fn init_logging(config: LogConfig) -> anyhow::Result<()> {
    if config.file_enabled {
        fs::create_dir_all(&config.log_dir)?;
    }

    let env_filter = EnvFilter::from_default_env().add_directive(config.level.into());

    if config.file_enabled {
        let file_appender =
            tracing_appender::rolling::daily(config.log_dir.clone(), "instant-replay.log");

        let subscriber = fmt()
            .with_env_filter(env_filter)
            .with_writer(file_appender)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_file(true)
            .json()
            .finish();

        tracing::subscriber::set_global_default(subscriber)?;
    } else if config.console_enabled {
        if config.console_pretty {
            let subscriber = fmt()
                .with_env_filter(env_filter)
                .pretty()
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_line_number(true)
                .with_file(true)
                .finish();

            tracing::subscriber::set_global_default(subscriber)?;
        } else {
            let subscriber = fmt()
                .with_env_filter(env_filter)
                .compact()
                .with_target(true)
                .with_thread_ids(true)
                .finish();

            tracing::subscriber::set_global_default(subscriber)?;
        }
    } else {
        return Err(anyhow::anyhow!("no logging output configured"));
    }

    Ok(())
}

/// Log a performance-critical event (frame stats, pool hit rate, etc).
#[macro_export]
macro_rules! log_perf {
    ($op:expr, $($arg:tt)*) => {
        tracing::debug!(operation = $op, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn production_config_disables_console() {
        let dir = tempdir().unwrap();
        let config = LogConfig::production(dir.path().to_path_buf());

        assert_eq!(config.level, Level::INFO);
        assert!(config.file_enabled);
        assert!(!config.console_enabled);
        assert!(!config.console_pretty);
    }

    #[test]
    fn development_config_enables_pretty_console() {
        let dir = tempdir().unwrap();
        let config = LogConfig::development(dir.path().to_path_buf());

        assert_eq!(config.level, Level::DEBUG);
        assert!(config.file_enabled);
        assert!(config.console_enabled);
        assert!(config.console_pretty);
    }

    #[test]
    fn init_logging_creates_log_directory() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("logs");

        let config = LogConfig {
            log_dir: log_dir.clone(),
            ..Default::default()
        };

        assert!(!log_dir.exists());
        init_logging(config).expect("logging init should succeed");
        assert!(log_dir.exists());
    }
}
