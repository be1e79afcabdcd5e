use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, Subscriber};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

#[cfg(feature = "advanced_logging")]
use crate::error::ChonkerError;
use crate::error::ChonkerResult;

/// Logging configuration for CHONKER
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_dir: PathBuf,
    pub enable_file_logging: bool,
    pub enable_json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: PathBuf::from("logs"),
            enable_file_logging: false,
            enable_json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Self::default()
        }
    }
}

/// Keeps the non-blocking file writer alive; drop it last so buffered
/// lines reach disk.
#[derive(Default)]
pub struct LoggingGuard {
    #[cfg(feature = "advanced_logging")]
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("chonker_matrix={},{}", config.level, "warn"))
    })
}

fn console_layer<S>() -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .compact()
        .boxed()
}

/// Initialize the logging system. A second call is a no-op so embedding
/// applications and tests can both call it.
pub fn init_logging(config: &LoggingConfig) -> ChonkerResult<LoggingGuard> {
    let registry = Registry::default().with(env_filter(config));

    #[cfg(feature = "advanced_logging")]
    {
        if config.enable_file_logging {
            std::fs::create_dir_all(&config.log_dir).map_err(|e| {
                ChonkerError::file_io(config.log_dir.to_string_lossy().to_string(), e)
            })?;

            let file_appender = tracing_appender::rolling::daily(&config.log_dir, "chonker.log");
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

            let file_layer = if config.enable_json_format {
                fmt::layer().json().with_writer(file_writer).boxed()
            } else {
                fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .boxed()
            };

            if registry
                .with(file_layer)
                .with(console_layer())
                .try_init()
                .is_ok()
            {
                info!("🐹 CHONKER logging initialized");
                info!("Log level: {}", config.level);
                info!("File logging enabled: {}", config.log_dir.display());
            }

            return Ok(LoggingGuard {
                _file_guard: Some(guard),
            });
        }
    }

    if registry.with(console_layer()).try_init().is_ok() {
        info!("🐹 CHONKER logging initialized");
        info!("Log level: {}", config.level);
    }

    Ok(LoggingGuard::default())
}

/// Performance logging utilities
pub struct PerformanceTimer {
    start: std::time::Instant,
    operation: String,
}

impl PerformanceTimer {
    pub fn start(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        tracing::debug!("⏱️  Starting: {}", operation);
        Self {
            start: std::time::Instant::now(),
            operation,
        }
    }

    pub fn checkpoint(&self, checkpoint: &str) {
        let elapsed = self.start.elapsed();
        tracing::debug!(
            "⏱️  {} - {}: {}ms",
            self.operation,
            checkpoint,
            elapsed.as_millis()
        );
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Drop for PerformanceTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        tracing::debug!("⏱️  Completed {}: {}ms", self.operation, elapsed.as_millis());
    }
}

/// Macro for logging with context
#[macro_export]
macro_rules! log_error {
    ($error:expr, $context:expr) => {
        tracing::warn!(
            error = %$error,
            context = $context,
            recoverable = $error.is_recoverable(),
            "CHONKER error occurred"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice_is_harmless() {
        let config = LoggingConfig::with_level("debug");
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
    }

    #[test]
    fn test_logging_section_from_toml() {
        let config: crate::config::ChonkerConfig =
            toml::from_str("[logging]\nlevel = \"trace\"\nenable_json_format = true\n").unwrap();
        assert_eq!(config.logging.level, "trace");
        assert!(config.logging.enable_json_format);
        assert_eq!(config.logging.log_dir, PathBuf::from("logs"));
        assert!(init_logging(&config.logging).is_ok());
    }

    #[test]
    fn test_log_level_env_override() {
        std::env::set_var("CHONKER_LOG_LEVEL", "DEBUG");
        let config = crate::config::ChonkerConfig::load_from_env();
        std::env::remove_var("CHONKER_LOG_LEVEL");
        assert_eq!(config.logging, LoggingConfig::with_level("debug"));
    }

    #[cfg(feature = "advanced_logging")]
    #[test]
    fn test_file_logging_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            log_dir: dir.path().join("logs"),
            enable_file_logging: true,
            ..LoggingConfig::default()
        };
        let guard = init_logging(&config).unwrap();
        assert!(config.log_dir.is_dir());
        drop(guard);
    }

    #[test]
    fn test_timer_reports_elapsed() {
        let timer = PerformanceTimer::start("unit");
        timer.checkpoint("halfway");
        assert!(timer.elapsed_ms() < 60_000);
    }
}
