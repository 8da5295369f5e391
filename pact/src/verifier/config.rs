//! Verifier settings.
//!
//! Every setter of a verifier handle writes one of these fields; the last
//! write wins. Settings are cloned into the background run, so a run never
//! observes later changes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use url::Url;

use crate::config::Config;
use crate::error::{PactError, Result};
use crate::model::ProviderState;

/// Keys accepted in a consumer version selector.
pub const SELECTOR_KEYS: &[&str] = &[
    "pacticipant",
    "tag",
    "version",
    "latest",
    "all",
    "consumer",
    "branch",
    "mainBranch",
    "matchingBranch",
    "deployed",
    "released",
    "deployedOrReleased",
    "environment",
    "fallbackTag",
    "fallbackBranch",
];

/// One way of reaching the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderTransport {
    /// Protocol name (`http`, `https`, or a plugin transport)
    pub protocol: String,
    /// Port; `None` uses the scheme default
    pub port: Option<u16>,
    /// Path prefix prepended to every request path
    pub path: String,
    /// URL scheme; defaults to the protocol
    pub scheme: String,
}

impl ProviderTransport {
    /// Build a transport, normalising empty values.
    #[must_use]
    pub fn new(protocol: &str, port: Option<u16>, path: &str, scheme: &str) -> Self {
        let protocol = if protocol.trim().is_empty() { "http" } else { protocol.trim() };
        let scheme = if scheme.trim().is_empty() { protocol } else { scheme.trim() };
        Self {
            protocol: protocol.to_ascii_lowercase(),
            port: port.filter(|p| *p > 0),
            path: path.trim().trim_end_matches('/').to_string(),
            scheme: scheme.to_ascii_lowercase(),
        }
    }

    /// Base URL for a host.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the pieces do not form a URL.
    pub fn base_url(&self, host: &str) -> Result<Url> {
        let authority = match self.port {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Url::parse(&format!("{}://{authority}{}/", self.scheme, self.path))
            .map_err(|e| PactError::invalid_argument(format!("Invalid provider address: {e}")))
    }
}

/// Provider under verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    /// Provider name; directory sources keep only its pacts
    pub name: String,
    /// Host name or address
    pub host: String,
    /// Transports; the first is the default
    pub transports: Vec<ProviderTransport>,
}

impl Default for ProviderInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: "localhost".to_string(),
            transports: vec![ProviderTransport::new("http", Some(8080), "", "http")],
        }
    }
}

impl ProviderInfo {
    /// Transport for an interaction: the one named by it, else the first
    /// HTTP(S) transport, else the first of all.
    #[must_use]
    pub fn transport_for(&self, name: Option<&str>) -> Option<&ProviderTransport> {
        name.and_then(|name| self.transports.iter().find(|t| t.protocol.eq_ignore_ascii_case(name)))
            .or_else(|| {
                self.transports
                    .iter()
                    .find(|t| matches!(t.protocol.as_str(), "http" | "https"))
            })
            .or_else(|| self.transports.first())
    }
}

/// Interaction filters, AND-combined.
#[derive(Debug, Clone, Default)]
pub struct FilterInfo {
    /// Description must match
    pub description: Option<Regex>,
    /// Some provider state must match
    pub state: Option<Regex>,
    /// Interaction must declare no provider state
    pub no_state: bool,
}

fn compile(pattern: &str, what: &str) -> Result<Option<Regex>> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|e| PactError::invalid_argument(format!("Invalid {what} filter '{pattern}': {e}")))
}

impl FilterInfo {
    /// Build filters; empty patterns are not applied.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a pattern that does not compile.
    pub fn new(description: &str, state: &str, no_state: bool) -> Result<Self> {
        Ok(Self {
            description: compile(description, "description")?,
            state: compile(state, "provider state")?,
            no_state,
        })
    }

    /// Whether an interaction passes every filter.
    #[must_use]
    pub fn matches(&self, description: &str, states: &[ProviderState]) -> bool {
        let description_ok = self.description.as_ref().is_none_or(|re| re.is_match(description));
        let state_ok = self
            .state
            .as_ref()
            .is_none_or(|re| states.iter().any(|s| re.is_match(&s.name)));
        let no_state_ok = !self.no_state || states.is_empty();
        description_ok && state_ok && no_state_ok
    }

    /// No filter is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.description.is_none() && self.state.is_none() && !self.no_state
    }
}

/// Provider state change callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStateConfig {
    /// Endpoint receiving state changes
    pub url: Url,
    /// Also call it after each interaction with `action=teardown`
    pub teardown: bool,
    /// Send the change as a JSON body; query parameters otherwise
    pub body: bool,
}

/// Options of the verification run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOptions {
    /// Skip provider certificate validation
    pub disable_ssl_verification: bool,
    /// Timeout of each provider call
    pub request_timeout: Duration,
}

impl Default for VerificationOptions {
    fn default() -> Self {
        Self {
            disable_ssl_verification: false,
            request_timeout: Duration::from_millis(crate::config::DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

/// Where verification results are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Provider application version
    pub provider_version: String,
    /// CI build URL
    pub build_url: Option<String>,
    /// Tags applied to the provider version
    pub tags: Vec<String>,
    /// Provider branch
    pub branch: Option<String>,
}

/// Credentials for a remote source.
#[derive(Debug, Clone, Default)]
pub enum Credentials {
    /// Anonymous
    #[default]
    None,
    /// Basic auth
    Basic {
        /// Username
        username: String,
        /// Password
        password: Option<SecretString>,
    },
    /// Bearer token
    Token(SecretString),
}

impl Credentials {
    /// Build credentials from optional pieces; empty strings are unset.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when a token is combined with a username
    /// or password.
    pub fn new(username: Option<&str>, password: Option<&str>, token: Option<&str>) -> Result<Self> {
        let clean = |v: Option<&str>| v.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string);
        match (clean(username), clean(password), clean(token)) {
            (None, None, None) => Ok(Self::None),
            (None, None, Some(token)) => Ok(Self::Token(SecretString::from(token))),
            (Some(username), password, None) => Ok(Self::Basic {
                username,
                password: password.map(SecretString::from),
            }),
            (None, Some(_), None) => Err(PactError::invalid_argument("A password requires a username")),
            _ => Err(PactError::invalid_argument(
                "Provide a token or a username/password, but not both",
            )),
        }
    }

    /// Explicit credentials, else the configured defaults.
    #[must_use]
    pub fn or_defaults(self, config: &Config) -> Self {
        match self {
            Self::None => {
                if let Some(token) = &config.broker.token {
                    Self::Token(token.clone())
                } else if let Some(username) = &config.broker.username {
                    Self::Basic {
                        username: username.clone(),
                        password: config.broker.password.clone(),
                    }
                } else {
                    Self::None
                }
            }
            explicit => explicit,
        }
    }

    /// Attach the credentials to a request.
    #[must_use]
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Self::None => request,
            Self::Basic { username, password } => {
                request.basic_auth(username, password.as_ref().map(|p| p.expose_secret().to_string()))
            }
            Self::Token(token) => request.bearer_auth(token.expose_secret()),
        }
    }
}

/// Pact broker query.
#[derive(Debug, Clone)]
pub struct BrokerSource {
    /// Broker base URL
    pub url: Url,
    /// Broker credentials
    pub credentials: Credentials,
    /// Include pending pacts
    pub enable_pending: bool,
    /// Include work-in-progress pacts created since this date
    pub include_wip_since: Option<String>,
    /// Provider version tags
    pub provider_tags: Vec<String>,
    /// Provider branch
    pub provider_branch: Option<String>,
    /// Consumer version selectors
    pub selectors: Vec<Value>,
    /// Consumer version tags, turned into selectors when no selector is given
    pub consumer_version_tags: Vec<String>,
}

/// A place pacts are loaded from.
#[derive(Debug, Clone)]
pub enum PactSource {
    /// One pact file
    File(PathBuf),
    /// Every `.json` pact in a directory
    Directory(PathBuf),
    /// A pact fetched over HTTP
    Url {
        /// Pact URL
        url: Url,
        /// Credentials
        credentials: Credentials,
    },
    /// Pacts for verification selected by a broker
    Broker(Box<BrokerSource>),
}

impl PactSource {
    /// Short label for logs and reports.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::File(path) => format!("file {}", path.display()),
            Self::Directory(path) => format!("directory {}", path.display()),
            Self::Url { url, .. } => format!("url {url}"),
            Self::Broker(broker) => format!("broker {}", broker.url),
        }
    }
}

/// Parse an absolute URL.
///
/// # Errors
///
/// Returns `InvalidArgument` when the value is not an absolute URL.
pub fn parse_url(value: &str, what: &str) -> Result<Url> {
    Url::parse(value.trim()).map_err(|e| PactError::invalid_argument(format!("Invalid {what} '{value}': {e}")))
}

/// Parse and validate consumer version selectors, one JSON object each.
///
/// # Errors
///
/// Returns `InvalidArgument` for malformed JSON, a non-object, or an
/// unknown key.
pub fn parse_selectors<S: AsRef<str>>(selectors: &[S]) -> Result<Vec<Value>> {
    selectors
        .iter()
        .map(|raw| {
            let raw = raw.as_ref();
            let value: Value = serde_json::from_str(raw)
                .map_err(|e| PactError::invalid_argument(format!("Invalid consumer version selector '{raw}': {e}")))?;
            let Some(map) = value.as_object() else {
                return Err(PactError::invalid_argument(format!(
                    "Consumer version selector '{raw}' is not a JSON object"
                )));
            };
            if let Some(key) = map.keys().find(|k| !SELECTOR_KEYS.contains(&k.as_str())) {
                return Err(PactError::invalid_argument(format!(
                    "'{key}' is not a valid consumer version selector property; allowed: {}",
                    SELECTOR_KEYS.join(", ")
                )));
            }
            if map.get("tag").and_then(Value::as_str) == Some("latest") {
                tracing::warn!("Selecting the tag 'latest' probably does not do what you intended; use {{\"latest\": true}}");
            }
            Ok(value)
        })
        .collect()
}

/// Everything a verifier handle holds.
#[derive(Debug, Clone)]
pub struct VerifierSettings {
    /// Provider under verification
    pub provider: ProviderInfo,
    /// Interaction filters
    pub filters: FilterInfo,
    /// Only pacts of these consumers; empty keeps all
    pub consumer_filters: Vec<String>,
    /// Provider state change callback
    pub state_change: Option<ProviderStateConfig>,
    /// Run options
    pub options: VerificationOptions,
    /// Result publication
    pub publish: Option<PublishOptions>,
    /// Fail when no interaction was loaded
    pub fail_if_no_pacts_found: bool,
    /// Headers added to every provider request, replacing same-named ones
    pub custom_headers: BTreeMap<String, String>,
    /// Pact sources in registration order
    pub sources: Vec<PactSource>,
}

impl VerifierSettings {
    /// Settings seeded from the engine configuration.
    ///
    /// Filters from the environment are applied when they compile; a bad
    /// pattern is logged and ignored.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let filters = FilterInfo::new(
            config.filters.description.as_deref().unwrap_or_default(),
            config.filters.state.as_deref().unwrap_or_default(),
            config.filters.no_state,
        )
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring filters from the environment");
            FilterInfo::default()
        });
        Self {
            provider: ProviderInfo::default(),
            filters,
            consumer_filters: Vec::new(),
            state_change: None,
            options: VerificationOptions {
                disable_ssl_verification: false,
                request_timeout: config.request_timeout,
            },
            publish: None,
            fail_if_no_pacts_found: true,
            custom_headers: BTreeMap::new(),
            sources: Vec::new(),
        }
    }
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_defaults_and_base_url() {
        let transport = ProviderTransport::new("", Some(0), "/api/", "");
        assert_eq!(transport.protocol, "http");
        assert_eq!(transport.scheme, "http");
        assert_eq!(transport.port, None);
        assert_eq!(transport.base_url("localhost").unwrap().as_str(), "http://localhost/api/");

        let transport = ProviderTransport::new("https", Some(8443), "", "");
        assert_eq!(transport.base_url("127.0.0.1").unwrap().as_str(), "https://127.0.0.1:8443/");
    }

    #[test]
    fn test_transport_selection() {
        let provider = ProviderInfo {
            transports: vec![
                ProviderTransport::new("grpc", Some(9000), "", "tcp"),
                ProviderTransport::new("http", Some(8080), "", ""),
            ],
            ..ProviderInfo::default()
        };
        assert_eq!(provider.transport_for(Some("grpc")).unwrap().port, Some(9000));
        assert_eq!(provider.transport_for(None).unwrap().port, Some(8080));
        assert_eq!(provider.transport_for(Some("kafka")).unwrap().port, Some(8080));
    }

    #[test]
    fn test_filters_are_and_combined() {
        let with_state = vec![ProviderState::new("user exists")];
        let filters = FilterInfo::new("^get", "user", false).unwrap();
        assert!(filters.matches("get user", &with_state));
        assert!(!filters.matches("delete user", &with_state));
        assert!(!filters.matches("get user", &[]));

        let filters = FilterInfo::new("^get", "", true).unwrap();
        assert!(filters.matches("get user", &[]));
        assert!(!filters.matches("get user", &with_state));

        assert!(FilterInfo::new("", "", false).unwrap().is_empty());
        assert!(FilterInfo::new("(", "", false).is_err());
    }

    #[test]
    fn test_credentials() {
        assert!(matches!(Credentials::new(None, None, None), Ok(Credentials::None)));
        assert!(matches!(Credentials::new(Some(""), None, Some("t")), Ok(Credentials::Token(_))));
        assert!(matches!(
            Credentials::new(Some("u"), Some("p"), None),
            Ok(Credentials::Basic { .. })
        ));
        assert!(Credentials::new(Some("u"), None, Some("t")).is_err());
        assert!(Credentials::new(None, Some("p"), None).is_err());
    }

    #[test]
    fn test_credentials_fall_back_to_config() {
        let mut config = Config::default();
        config.broker.token = Some(SecretString::from("from-env"));
        match Credentials::None.or_defaults(&config) {
            Credentials::Token(token) => assert_eq!(token.expose_secret(), "from-env"),
            other => panic!("unexpected {other:?}"),
        }
        let explicit = Credentials::new(Some("u"), None, None).unwrap().or_defaults(&config);
        assert!(matches!(explicit, Credentials::Basic { .. }));
    }

    #[test]
    fn test_selectors_validated() {
        let parsed = parse_selectors(&[r#"{"mainBranch": true}"#, r#"{"tag": "prod", "latest": true}"#]).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parse_selectors(&[r#"{"colour": "blue"}"#]).is_err());
        assert!(parse_selectors(&["[1]"]).is_err());
        assert!(parse_selectors(&["{"]).is_err());
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.request_timeout = Duration::from_millis(250);
        config.filters.description = Some("^a".into());
        let settings = VerifierSettings::from_config(&config);
        assert_eq!(settings.options.request_timeout, Duration::from_millis(250));
        assert!(settings.filters.description.is_some());
        assert!(settings.fail_if_no_pacts_found);
    }
}
