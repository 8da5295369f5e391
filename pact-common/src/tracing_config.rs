//! Tracing subscriber initialisation.
//!
//! The engine is embedded in host test runners that may already own a global
//! subscriber, so initialisation never panics when one is installed.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format of log events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Tracing settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Event format
    pub format: LogFormat,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl TracingConfig {
    /// Filter directive, e.g. `debug` or `pact_engine=trace`.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Event format.
    #[must_use]
    pub const fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.filter))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured filter, and an
/// unparsable filter falls back to `info`. Returns `false` when a global
/// subscriber was already installed.
pub fn init_tracing(config: &TracingConfig) -> bool {
    let registry = tracing_subscriber::registry().with(config.env_filter());
    let installed = match config.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    }
    .is_ok();

    if installed {
        tracing::debug!(filter = %config.filter, format = ?config.format, "Tracing initialised");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = TracingConfig::default()
            .with_filter("pact_engine=debug")
            .with_format(LogFormat::Json);
        assert_eq!(config.filter, "pact_engine=debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(TracingConfig::default().format, LogFormat::Text);
    }

    #[test]
    fn test_second_init_is_harmless() {
        let config = TracingConfig::default().with_filter("not a [valid filter");
        let _ = init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
