//! Structured logging setup
//!
//! Logs go to stderr so that command output on stdout (tokens, JSON) stays
//! pipeable.  `RUST_LOG` takes precedence over the configured level.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Builds the filter: `RUST_LOG` if set, otherwise `oauthkit=<level>`.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(format!("oauthkit={}", config.level))?),
    }
}

/// Initialize logging based on configuration.
///
/// # Arguments
///
/// * `config` - Logging configuration
///
/// # Errors
///
/// Returns an error if the level is not a valid filter directive or a
/// global subscriber is already installed.
///
/// # Examples
///
/// ```no_run
/// use oauthkit::config::LoggingConfig;
/// use oauthkit::logging::init_logging;
///
/// init_logging(&LoggingConfig::default()).unwrap();
/// ```
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(env_filter(config)?);

    if config.json {
        let layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(std::io::stderr);
        registry.with(layer).try_init()?;
    } else {
        let layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr);
        registry.with(layer).try_init()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_from_level() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            json: false,
        };
        assert!(env_filter(&config).is_ok());
    }

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(!config.json);
    }
}
