use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber from the configuration, with an
/// optional CLI override for the level. `RUST_LOG` wins over both.
/// Re-initialization (e.g. in tests) is a no-op.
pub fn init(config: &LoggingConfig, level_override: Option<&str>) {
    let level = level_override.unwrap_or(config.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if result.is_err() {
        tracing::debug!("a global subscriber was already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_initialization_is_harmless() {
        let config = LoggingConfig::default();
        init(&config, None);
        init(&config, Some("debug"));
    }
}
