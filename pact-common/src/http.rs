//! Outbound HTTP clients.
//!
//! Every outbound call of the engine (provider requests, state change hooks,
//! pact source fetches, result publication) goes through a client built here.

use std::time::Duration;

use reqwest::{Client, ClientBuilder};

const USER_AGENT: &str = concat!("pact-engine/", env!("CARGO_PKG_VERSION"));

/// Settings for an outbound client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    /// Whole-request timeout
    pub timeout: Duration,
    /// TCP and TLS connect timeout
    pub connect_timeout: Duration,
    /// Skip certificate validation
    pub accept_invalid_certs: bool,
    /// `User-Agent` header value
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            accept_invalid_certs: false,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

impl HttpConfig {
    /// Whole-request timeout. The connect timeout never exceeds it.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.connect_timeout = self.connect_timeout.min(timeout);
        self
    }

    /// Connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `User-Agent` header value.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Accept self-signed or otherwise invalid provider certificates.
    #[must_use]
    pub const fn with_invalid_certs_accepted(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }
}

/// Build a client from `config`.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialised.
///
/// # Examples
///
/// ```
/// use pact_common::{HttpConfig, build_http_client};
/// use std::time::Duration;
///
/// let config = HttpConfig::default().with_timeout(Duration::from_secs(5));
/// assert!(build_http_client(&config).is_ok());
/// ```
pub fn build_http_client(config: &HttpConfig) -> Result<Client, reqwest::Error> {
    ClientBuilder::new()
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout)
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .user_agent(config.user_agent.as_str())
        .use_rustls_tls()
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HttpConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(!config.accept_invalid_certs);
        assert!(config.user_agent.starts_with("pact-engine/"));
    }

    #[test]
    fn test_short_timeout_caps_connect_timeout() {
        let config = HttpConfig::default()
            .with_timeout(Duration::from_millis(500))
            .with_invalid_certs_accepted(true)
            .with_user_agent("verifier");
        assert_eq!(config.connect_timeout, Duration::from_millis(500));
        assert!(config.accept_invalid_certs);
        assert_eq!(config.user_agent, "verifier");
        assert!(build_http_client(&config).is_ok());
    }
}
