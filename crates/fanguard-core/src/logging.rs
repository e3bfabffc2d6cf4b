//! Tracing subscriber setup for the daemon and the CLI.
//!
//! Filter precedence: `RUST_LOG`, then `-v` flags, then `[logging] level`.

use fanguard_config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is not set.
pub fn filter_directive(config_level: &str, verbosity: u8) -> String {
    match verbosity {
        0 if config_level.trim().is_empty() => "info".to_string(),
        0 => config_level.trim().to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(config: &LoggingConfig, verbosity: u8) {
    let directive = filter_directive(&config.level, verbosity);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive));

    let result = match config.format.as_str() {
        "compact" => tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_level_when_quiet() {
        assert_eq!(filter_directive("warn", 0), "warn");
        assert_eq!(filter_directive("fanguard_core=debug,info", 0), "fanguard_core=debug,info");
    }

    #[test]
    fn test_empty_level_defaults_to_info() {
        assert_eq!(filter_directive("  ", 0), "info");
    }

    #[test]
    fn test_verbosity_overrides_config() {
        assert_eq!(filter_directive("warn", 1), "debug");
        assert_eq!(filter_directive("warn", 2), "trace");
        assert_eq!(filter_directive("warn", 9), "trace");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LoggingConfig::default();
        init(&config, 0);
        init(&config, 2);
    }
}
