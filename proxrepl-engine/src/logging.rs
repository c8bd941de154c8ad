//! Logging configuration module
//! Provides structured logging configuration

use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,              // log level (trace, debug, info, warn, error)
    pub file_dir: Option<PathBuf>,  // directory for rotated file logs
    pub json_format: bool,          // use JSON formatting
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Initialize logging based on configuration.
    ///
    /// Returns the worker guard keeping the non-blocking file appender alive
    /// when file logging is enabled; the caller must hold it for the process
    /// lifetime.
    pub fn init(&self) -> Option<tracing_appender::non_blocking::WorkerGuard> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.clone()));

        if let Some(dir) = &self.file_dir {
            let appender = tracing_appender::rolling::daily(dir, "proxrepl.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let _ = fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_level(true)
                .with_ansi(false)
                .with_writer(writer)
                .try_init();

            tracing::info!("Logging initialized - level: {}, dir: {}", self.level, dir.display());
            return Some(guard);
        }

        let _ = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_level(true)
            .with_ansi(true)
            .try_init();

        tracing::info!("Logging initialized - level: {}", self.level);
        None
    }

    /// Initialize with environment variables
    pub fn init_from_env() -> Option<tracing_appender::non_blocking::WorkerGuard> {
        let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let file_dir = std::env::var("PROXREPL_LOG_DIR").ok().map(PathBuf::from);

        Self {
            level,
            file_dir,
            ..Default::default()
        }
        .init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.file_dir.is_none());
    }

    #[test]
    fn test_init_without_file_dir_returns_no_guard() {
        let config = LoggingConfig::default();
        assert!(config.init().is_none());
    }
}
