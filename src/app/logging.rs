//! Logging configuration and initialization

use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// Returns `false` when a subscriber was already installed, which is the
/// normal case when several tests initialise logging.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level()));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.verbose >= 2)
        .with_thread_ids(config.verbose >= 3)
        .with_line_number(config.verbose >= 3)
        .try_init()
        .is_ok();

    if installed {
        debug!("Logging initialised at verbosity {}", config.verbose);
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_harmless() {
        let config = LoggingConfig {
            level: Some("warn".to_string()),
            verbose: 0,
        };
        init_logging(&config);
        assert!(!init_logging(&config));
    }

    #[test]
    fn test_verbosity_levels() {
        let level = |verbose| LoggingConfig {
            level: None,
            verbose,
        }
        .log_level();
        assert_eq!(level(0), "info");
        assert_eq!(level(1), "debug");
        assert_eq!(level(3), "trace");
    }
}
