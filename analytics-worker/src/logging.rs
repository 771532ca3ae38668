//! Process-wide tracing subscriber setup.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Result, WorkerError};
use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` when set, the configured level otherwise.
pub fn filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| {
        WorkerError::logging(format!("invalid log level {:?}: {}", config.level, e))
    })
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Human => builder.try_init(),
    };
    installed.map_err(|e| WorkerError::logging(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_directives() {
        let config = LoggingConfig {
            level: "analytics_amqp=debug,info".to_owned(),
            format: LogFormat::Json,
        };
        assert!(filter(&config).is_ok());
    }

    #[test]
    fn test_filter_rejects_garbage() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "analytics=verbose".to_owned(),
            format: LogFormat::Human,
        };
        assert!(matches!(filter(&config), Err(WorkerError::Logging(_))));
    }
}
