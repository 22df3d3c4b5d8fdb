//! Logging initialisation

use pollfs_config::LoggingConfig;
use pollfs_types::{Error, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global `tracing` subscriber described by `config`
///
/// `RUST_LOG` wins over the configured level. Returns `Ok(false)` when a global
/// subscriber was already installed, so calling this more than once is harmless.
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| Error::config(format!("invalid log level '{}': {}", config.level, e)))?,
    };

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        init_logging(&config).unwrap();
        // Whoever installed first, the second call never installs again
        assert!(!init_logging(&config).unwrap());
    }

    #[test]
    fn test_invalid_level_is_a_config_error() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "pollfs=loudest".to_string(),
            json: false,
        };
        let error = init_logging(&config).unwrap_err();
        assert_eq!(error.kind(), pollfs_types::ErrorKind::Config);
    }
}
