//! Engine configuration.
//!
//! All settings come from environment variables (a `.env` file is honoured)
//! and are validated when loaded. [`Config::from_lookup`] takes any variable
//! source so tests never touch the process environment.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use pact_common::{LogFormat, TracingConfig};
use secrecy::SecretString;
use thiserror::Error;

/// Default verifier request timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable holds a value that cannot be parsed
    #[error("Invalid {name}: {reason}")]
    Invalid {
        /// Variable name
        name: &'static str,
        /// Parse failure
        reason: String,
    },

    /// Variables that cannot be combined
    #[error("Conflicting settings: {0}")]
    Conflict(String),
}

/// Default credentials for pact sources.
#[derive(Debug, Clone, Default)]
pub struct BrokerDefaults {
    /// Broker base URL
    pub base_url: Option<String>,
    /// Basic auth username
    pub username: Option<String>,
    /// Basic auth password
    pub password: Option<SecretString>,
    /// Bearer token
    pub token: Option<SecretString>,
}

/// Default verifier filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterDefaults {
    /// Description regex
    pub description: Option<String>,
    /// Provider state regex
    pub state: Option<String>,
    /// Only interactions without provider states
    pub no_state: bool,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Tracing filter directive
    pub log_level: String,
    /// Emit JSON log lines
    pub log_json: bool,
    /// Directory holding installed plugins
    pub plugin_dir: PathBuf,
    /// Default timeout for verifier HTTP calls
    pub request_timeout: Duration,
    /// Default verifier filters
    pub filters: FilterDefaults,
    /// Default broker settings and credentials
    pub broker: BrokerDefaults,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            plugin_dir: default_plugin_dir(None),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            filters: FilterDefaults::default(),
            broker: BrokerDefaults::default(),
        }
    }
}

fn default_plugin_dir(home: Option<String>) -> PathBuf {
    home.map_or_else(|| PathBuf::from(".pact/plugins"), |home| PathBuf::from(home).join(".pact/plugins"))
}

impl Config {
    /// Load configuration from the environment, reading `.env` first.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// Empty values count as unset.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let log_level = var("PACT_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let log_json = parse_var(var("PACT_LOG_JSON"), "PACT_LOG_JSON", false)?;
        let plugin_dir = var("PACT_PLUGIN_DIR").map_or_else(|| default_plugin_dir(var("HOME")), PathBuf::from);

        let timeout_ms = parse_var(
            var("PACT_VERIFIER_REQUEST_TIMEOUT"),
            "PACT_VERIFIER_REQUEST_TIMEOUT",
            DEFAULT_REQUEST_TIMEOUT_MS,
        )?;
        if timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                name: "PACT_VERIFIER_REQUEST_TIMEOUT",
                reason: "must be greater than zero".to_string(),
            });
        }

        let filters = FilterDefaults {
            description: var("PACT_DESCRIPTION"),
            state: var("PACT_PROVIDER_STATE"),
            no_state: var("PACT_PROVIDER_NO_STATE").is_some_and(|v| !matches!(v.as_str(), "0" | "false")),
        };

        let broker = BrokerDefaults {
            base_url: var("PACT_BROKER_BASE_URL"),
            username: var("PACT_BROKER_USERNAME"),
            password: var("PACT_BROKER_PASSWORD").map(SecretString::from),
            token: var("PACT_BROKER_TOKEN").map(SecretString::from),
        };
        if broker.token.is_some() && (broker.username.is_some() || broker.password.is_some()) {
            return Err(ConfigError::Conflict(
                "PACT_BROKER_TOKEN cannot be combined with PACT_BROKER_USERNAME/PACT_BROKER_PASSWORD".to_string(),
            ));
        }

        Ok(Self {
            log_level,
            log_json,
            plugin_dir,
            request_timeout: Duration::from_millis(timeout_ms),
            filters,
            broker,
        })
    }

    /// Tracing settings derived from this configuration.
    #[must_use]
    pub fn tracing(&self) -> TracingConfig {
        let format = if self.log_json { LogFormat::Json } else { LogFormat::Text };
        TracingConfig::default()
            .with_filter(self.log_level.clone())
            .with_format(format)
    }
}

/// Parse an optional variable with a default value.
fn parse_var<T: std::str::FromStr>(value: Option<String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match value {
        Some(val) => val.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("HOME", "/home/dev")]).unwrap();
        assert_eq!(config.log_level, "info");
        assert!(!config.log_json);
        assert_eq!(config.plugin_dir, PathBuf::from("/home/dev/.pact/plugins"));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.filters, FilterDefaults::default());
        assert!(config.broker.token.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("PACT_LOG_LEVEL", "debug"),
            ("PACT_LOG_JSON", "true"),
            ("PACT_PLUGIN_DIR", "/opt/plugins"),
            ("PACT_VERIFIER_REQUEST_TIMEOUT", "1500"),
            ("PACT_DESCRIPTION", "^a request"),
            ("PACT_PROVIDER_NO_STATE", "1"),
            ("PACT_BROKER_TOKEN", "s3cret"),
        ])
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.log_json);
        assert_eq!(config.plugin_dir, PathBuf::from("/opt/plugins"));
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.filters.description.as_deref(), Some("^a request"));
        assert!(config.filters.no_state);
        assert_eq!(config.broker.token.as_ref().unwrap().expose_secret(), "s3cret");
        assert_eq!(config.tracing().format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            config(&[("PACT_VERIFIER_REQUEST_TIMEOUT", "0")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            config(&[("PACT_VERIFIER_REQUEST_TIMEOUT", "soon")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            config(&[("PACT_LOG_JSON", "maybe")]),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_token_conflicts_with_basic_auth() {
        let result = config(&[("PACT_BROKER_TOKEN", "t"), ("PACT_BROKER_USERNAME", "u")]);
        assert!(matches!(result, Err(ConfigError::Conflict(_))));
    }

    #[test]
    fn test_empty_values_are_unset() {
        let config = config(&[("PACT_LOG_LEVEL", ""), ("PACT_BROKER_TOKEN", " ")]).unwrap();
        assert_eq!(config.log_level, "info");
        assert!(config.broker.token.is_none());
    }
}
