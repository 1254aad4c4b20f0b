use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber for a play-server process from its
/// configured [`LoggingConfig`].
///
/// `RUST_LOG` wins over the configured filter, so operators can turn
/// individual targets up without touching the config file. Later calls are
/// no-ops: several servers sharing one process (the integration suites do
/// this) keep the first subscriber.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let result = if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("subscriber already installed, keeping it");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init(&LoggingConfig::default());
        // A second call with different settings must not panic
        init(&LoggingConfig {
            filter: "debug".to_string(),
            json: true,
        });
    }
}
