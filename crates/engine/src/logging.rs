//! Tracing subscriber setup for processes embedding the engine

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;
use crate::error::EngineError;

const LOG_FILE_NAME: &str = "engine.log";

/// Keeps the file writer flushing; drop it last.
#[must_use]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured filter. With `config.file` set, a
/// second layer writes plain text to a daily-rolling file in `log_dir`.
pub fn init(config: &LogConfig, log_dir: &Path) -> Result<LogGuard, EngineError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| EngineError::Logging(e.to_string()))?;

    let (file_layer, guard) = if config.file {
        std::fs::create_dir_all(log_dir).map_err(|e| {
            EngineError::Logging(format!("failed to create {}: {}", log_dir.display(), e))
        })?;
        let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .try_init()
        .map_err(|e| EngineError::Logging(e.to_string()))?;

    Ok(LogGuard { _file: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_with_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let config = LogConfig {
            filter: "engine=debug".to_string(),
            file: true,
        };

        let guard = init(&config, &log_dir).unwrap();
        assert!(log_dir.is_dir());

        // the global subscriber can only be installed once
        let err = init(&config, &log_dir).err().unwrap();
        assert!(matches!(err, EngineError::Logging(_)));
        drop(guard);
    }
}
