//! Provider verification.
//!
//! A verifier handle collects settings through repeated setter calls, then
//! runs on a background task of the engine runtime. The per-handle mutex is
//! only held to read or write settings; the run itself works on a snapshot,
//! so no lock is held across network I/O.
//!
//! ```text
//! Configuring ──execute──▶ Executing ──run done──▶ Completed(report)
//!      ▲                                                 │
//!      └──────────────── setters / execute ──────────────┘
//! ```

pub mod config;
mod execution;
mod provider_client;
pub mod report;
mod sources;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::{HeaderName, HeaderValue};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub use config::{
    BrokerSource, Credentials, FilterInfo, PactSource, ProviderInfo, ProviderStateConfig, ProviderTransport,
    PublishOptions, SELECTOR_KEYS, VerificationOptions, VerifierSettings, parse_selectors,
};
pub use report::{InteractionOutcome, InteractionResult, SourceError, VerificationReport};

use crate::config::Config;
use crate::error::{PactError, Result};
use crate::registry::{Registry, VerifierHandle};

#[derive(Debug, Clone)]
enum RunState {
    Configuring,
    Executing,
    Completed(VerificationReport),
}

/// Verifier state held behind a handle.
#[derive(Debug)]
pub struct Verifier {
    name: String,
    version: String,
    defaults: Config,
    settings: VerifierSettings,
    state: RunState,
}

impl Verifier {
    /// Verifier for a calling application.
    #[must_use]
    pub fn new(config: &Config, name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            defaults: config.clone(),
            settings: VerifierSettings::from_config(config),
            state: RunState::Configuring,
        }
    }

    /// Current settings.
    #[must_use]
    pub const fn settings(&self) -> &VerifierSettings {
        &self.settings
    }

    /// A run is in flight.
    #[must_use]
    pub const fn is_executing(&self) -> bool {
        matches!(self.state, RunState::Executing)
    }

    /// Report of the last completed run.
    #[must_use]
    pub const fn last_report(&self) -> Option<&VerificationReport> {
        match &self.state {
            RunState::Completed(report) => Some(report),
            RunState::Configuring | RunState::Executing => None,
        }
    }
}

/// Broker query as passed to [`Registry::verifier_broker_source_with_selectors`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerQuery<'a> {
    /// Broker base URL; the configured default is used when empty
    pub url: &'a str,
    /// Basic auth username
    pub username: Option<&'a str>,
    /// Basic auth password
    pub password: Option<&'a str>,
    /// Bearer token
    pub token: Option<&'a str>,
    /// Include pending pacts
    pub enable_pending: bool,
    /// Include WIP pacts created since this date
    pub include_wip_since: Option<&'a str>,
    /// Provider version tags
    pub provider_tags: &'a [String],
    /// Provider branch
    pub provider_branch: Option<&'a str>,
    /// Consumer version selectors, one JSON object each
    pub selectors: &'a [String],
    /// Consumer version tags
    pub consumer_version_tags: &'a [String],
}

/// Completion of a verification run.
///
/// Resolves once with the report. Dropping the task does not stop the
/// run; the report is still stored on the verifier.
#[derive(Debug)]
pub struct VerificationTask {
    handle: JoinHandle<VerificationReport>,
}

impl Future for VerificationTask {
    type Output = Result<VerificationReport>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle)
            .poll(cx)
            .map(|joined| joined.map_err(|e| PactError::internal(format!("verification task failed: {e}"))))
    }
}

/// Puts the verifier back to `Configuring` when a run ends without a report.
struct RunGuard {
    verifier: Arc<Mutex<Verifier>>,
    completed: bool,
}

impl RunGuard {
    fn complete(mut self, report: &VerificationReport) {
        self.verifier.lock().state = RunState::Completed(report.clone());
        self.completed = true;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.verifier.lock().state = RunState::Configuring;
        }
    }
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

impl Registry {
    /// Create a verifier for the calling application.
    pub fn verifier_new_for_application(&self, config: &Config, name: &str, version: &str) -> VerifierHandle {
        let handle = self.insert_verifier(Verifier::new(config, name, version));
        debug!(%handle, name, version, "Created verifier");
        handle
    }

    fn configure_verifier<R>(
        &self,
        handle: VerifierHandle,
        f: impl FnOnce(&mut VerifierSettings, &Config) -> Result<R>,
    ) -> Result<R> {
        let verifier = self.verifier(handle)?;
        let mut verifier = verifier.lock();
        if verifier.is_executing() {
            return Err(PactError::Frozen(format!("Verifier {handle} while executing")));
        }
        let Verifier { settings, defaults, .. } = &mut *verifier;
        f(settings, defaults)
    }

    /// Set the provider name and its default transport.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` for an unknown handle and `Frozen` while a
    /// run is executing.
    pub fn verifier_set_provider_info(
        &self,
        handle: VerifierHandle,
        name: &str,
        scheme: &str,
        host: &str,
        port: Option<u16>,
        path: &str,
    ) -> Result<()> {
        self.configure_verifier(handle, |settings, _| {
            let provider = &mut settings.provider;
            provider.name = name.trim().to_string();
            if let Some(host) = trimmed(Some(host)) {
                provider.host = host;
            }
            let transport = ProviderTransport::new(scheme, port, path, scheme);
            match provider.transports.first_mut() {
                Some(first) => *first = transport,
                None => provider.transports.push(transport),
            }
            Ok(())
        })
    }

    /// Add another way of reaching the provider.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` for an unknown handle and `Frozen` while a
    /// run is executing.
    pub fn verifier_add_provider_transport(
        &self,
        handle: VerifierHandle,
        protocol: &str,
        port: Option<u16>,
        path: &str,
        scheme: &str,
    ) -> Result<()> {
        self.configure_verifier(handle, |settings, _| {
            settings
                .provider
                .transports
                .push(ProviderTransport::new(protocol, port, path, scheme));
            Ok(())
        })
    }

    /// Set interaction filters; empty patterns are not applied.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a pattern that does not compile.
    pub fn verifier_set_filter_info(
        &self,
        handle: VerifierHandle,
        description: &str,
        state: &str,
        no_state: bool,
    ) -> Result<()> {
        let filters = FilterInfo::new(description, state, no_state)?;
        self.configure_verifier(handle, |settings, _| {
            settings.filters = filters;
            Ok(())
        })
    }

    /// Set the provider state change endpoint; an empty URL removes it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a malformed URL.
    pub fn verifier_set_provider_state(&self, handle: VerifierHandle, url: &str, teardown: bool, body: bool) -> Result<()> {
        let state_change = trimmed(Some(url))
            .map(|url| config::parse_url(&url, "provider state URL"))
            .transpose()?
            .map(|url| ProviderStateConfig { url, teardown, body });
        self.configure_verifier(handle, |settings, _| {
            settings.state_change = state_change;
            Ok(())
        })
    }

    /// Set TLS verification and the request timeout in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero timeout.
    pub fn verifier_set_verification_options(
        &self,
        handle: VerifierHandle,
        disable_ssl_verification: bool,
        timeout_ms: u64,
    ) -> Result<()> {
        if timeout_ms == 0 {
            return Err(PactError::invalid_argument("The request timeout must be greater than zero"));
        }
        self.configure_verifier(handle, |settings, _| {
            settings.options = VerificationOptions {
                disable_ssl_verification,
                request_timeout: Duration::from_millis(timeout_ms),
            };
            Ok(())
        })
    }

    /// Publish results to the broker after the run.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the provider version is empty.
    pub fn verifier_set_publish_options<S: AsRef<str>>(
        &self,
        handle: VerifierHandle,
        provider_version: &str,
        build_url: Option<&str>,
        tags: &[S],
        branch: Option<&str>,
    ) -> Result<()> {
        let Some(provider_version) = trimmed(Some(provider_version)) else {
            return Err(PactError::invalid_argument(
                "A provider version is required to publish verification results",
            ));
        };
        let publish = PublishOptions {
            provider_version,
            build_url: trimmed(build_url),
            tags: tags.iter().filter_map(|t| trimmed(Some(t.as_ref()))).collect(),
            branch: trimmed(branch),
        };
        self.configure_verifier(handle, |settings, _| {
            settings.publish = Some(publish);
            Ok(())
        })
    }

    /// Only verify pacts of these consumers; an empty list keeps all.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` for an unknown handle and `Frozen` while a
    /// run is executing.
    pub fn verifier_set_consumer_filters<S: AsRef<str>>(&self, handle: VerifierHandle, consumers: &[S]) -> Result<()> {
        let consumers = consumers.iter().filter_map(|c| trimmed(Some(c.as_ref()))).collect();
        self.configure_verifier(handle, |settings, _| {
            settings.consumer_filters = consumers;
            Ok(())
        })
    }

    /// Whether a run that loads nothing fails.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` for an unknown handle and `Frozen` while a
    /// run is executing.
    pub fn verifier_set_fail_if_no_pacts_found(&self, handle: VerifierHandle, fail: bool) -> Result<()> {
        self.configure_verifier(handle, |settings, _| {
            settings.fail_if_no_pacts_found = fail;
            Ok(())
        })
    }

    /// Add a header to every provider request.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a malformed header name or value.
    pub fn verifier_add_custom_header(&self, handle: VerifierHandle, name: &str, value: &str) -> Result<()> {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| PactError::invalid_argument(format!("Invalid header name '{name}'")))?;
        HeaderValue::from_str(value)
            .map_err(|_| PactError::invalid_argument(format!("Invalid value for header '{name}'")))?;
        self.configure_verifier(handle, |settings, _| {
            settings.custom_headers.insert(name.to_string(), value.to_string());
            Ok(())
        })
    }

    /// Verify a pact file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty path.
    pub fn verifier_add_file_source(&self, handle: VerifierHandle, path: &str) -> Result<()> {
        let path = trimmed(Some(path)).ok_or_else(|| PactError::invalid_argument("The pact file path is empty"))?;
        self.configure_verifier(handle, |settings, _| {
            settings.sources.push(PactSource::File(PathBuf::from(path)));
            Ok(())
        })
    }

    /// Verify every pact for the provider in a directory.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty path.
    pub fn verifier_add_directory_source(&self, handle: VerifierHandle, path: &str) -> Result<()> {
        let path = trimmed(Some(path)).ok_or_else(|| PactError::invalid_argument("The pact directory path is empty"))?;
        self.configure_verifier(handle, |settings, _| {
            settings.sources.push(PactSource::Directory(PathBuf::from(path)));
            Ok(())
        })
    }

    /// Verify a pact fetched from a URL.
    ///
    /// Without explicit credentials the configured broker credentials are
    /// used.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a malformed URL or a token combined
    /// with basic auth.
    pub fn verifier_url_source(
        &self,
        handle: VerifierHandle,
        url: &str,
        username: Option<&str>,
        password: Option<&str>,
        token: Option<&str>,
    ) -> Result<()> {
        let url = config::parse_url(url, "pact URL")?;
        let credentials = Credentials::new(username, password, token)?;
        self.configure_verifier(handle, |settings, defaults| {
            settings.sources.push(PactSource::Url {
                url,
                credentials: credentials.or_defaults(defaults),
            });
            Ok(())
        })
    }

    /// Verify the pacts a broker selects for this provider.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when no broker URL is given or configured,
    /// for invalid selectors, and for a token combined with basic auth.
    pub fn verifier_broker_source_with_selectors(&self, handle: VerifierHandle, query: BrokerQuery<'_>) -> Result<()> {
        let selectors = parse_selectors(query.selectors)?;
        let credentials = Credentials::new(query.username, query.password, query.token)?;
        self.configure_verifier(handle, |settings, defaults| {
            let url = trimmed(Some(query.url))
                .or_else(|| defaults.broker.base_url.clone())
                .ok_or_else(|| PactError::invalid_argument("A broker URL is required"))?;
            let url = config::parse_url(&url, "broker URL")?;
            settings.sources.push(PactSource::Broker(Box::new(BrokerSource {
                url,
                credentials: credentials.or_defaults(defaults),
                enable_pending: query.enable_pending,
                include_wip_since: trimmed(query.include_wip_since),
                provider_tags: query.provider_tags.to_vec(),
                provider_branch: trimmed(query.provider_branch),
                selectors,
                consumer_version_tags: query.consumer_version_tags.to_vec(),
            })));
            Ok(())
        })
    }

    /// Start a verification run on `runtime`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` for an unknown handle and `AlreadyExecuting`
    /// while a previous run is in flight.
    pub fn verifier_execute(&self, handle: VerifierHandle, runtime: &Handle) -> Result<VerificationTask> {
        let shared = self.verifier(handle)?;
        let (settings, name, version) = {
            let mut verifier = shared.lock();
            if verifier.is_executing() {
                return Err(PactError::AlreadyExecuting(handle.id()));
            }
            verifier.state = RunState::Executing;
            (verifier.settings.clone(), verifier.name.clone(), verifier.version.clone())
        };
        info!(%handle, sources = settings.sources.len(), "Starting verification");

        let guard = RunGuard {
            verifier: shared,
            completed: false,
        };
        let handle = runtime.spawn(async move {
            let report = execution::run(settings, name, version).await;
            guard.complete(&report);
            report
        });
        Ok(VerificationTask { handle })
    }

    /// Report of the last completed run, if any.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` for an unknown handle.
    pub fn verifier_last_report(&self, handle: VerifierHandle) -> Result<Option<VerificationReport>> {
        Ok(self.verifier(handle)?.lock().last_report().cloned())
    }

    /// Release a verifier. An in-flight run completes and its report is
    /// discarded.
    pub fn verifier_shutdown(&self, handle: VerifierHandle) -> bool {
        let removed = self.remove_verifier(handle);
        debug!(%handle, removed, "Verifier shut down");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Body, ContentType, HttpInteraction, Pact, PactInteraction};
    use crate::pact_file::to_json;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pact_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut pact = Pact::new("Consumer", "Provider");
        let mut http = HttpInteraction::new("get data");
        http.request.path = "/data".into();
        http.response.body = Body::from_text(r#"{"ok":true}"#, Some(ContentType::json()));
        pact.interactions.push(PactInteraction::Http(http));
        std::fs::write(dir.path().join("consumer-provider.json"), to_json(&pact).to_string()).unwrap();
        dir
    }

    #[test]
    fn test_setters_update_settings() {
        let registry = Registry::new();
        let handle = registry.verifier_new_for_application(&Config::default(), "tests", "1.0");
        registry
            .verifier_set_provider_info(handle, "Provider", "https", "example.com", Some(8443), "/api")
            .unwrap();
        registry
            .verifier_add_provider_transport(handle, "grpc", Some(9000), "", "tcp")
            .unwrap();
        registry.verifier_set_filter_info(handle, "^get", "", true).unwrap();
        registry.verifier_add_custom_header(handle, "X-Api-Key", "k").unwrap();
        registry.verifier_set_fail_if_no_pacts_found(handle, false).unwrap();
        registry.verifier_set_consumer_filters(handle, &["A", " "]).unwrap();

        let shared = registry.verifier(handle).unwrap();
        let verifier = shared.lock();
        let settings = verifier.settings();
        assert_eq!(settings.provider.name, "Provider");
        assert_eq!(settings.provider.host, "example.com");
        assert_eq!(settings.provider.transports.len(), 2);
        assert_eq!(
            settings.provider.transports[0].base_url("example.com").unwrap().as_str(),
            "https://example.com:8443/api/"
        );
        assert!(settings.filters.no_state);
        assert_eq!(settings.custom_headers["X-Api-Key"], "k");
        assert!(!settings.fail_if_no_pacts_found);
        assert_eq!(settings.consumer_filters, vec!["A".to_string()]);
    }

    #[test]
    fn test_invalid_arguments() {
        let registry = Registry::new();
        let handle = registry.verifier_new_for_application(&Config::default(), "tests", "1.0");
        assert!(matches!(
            registry.verifier_set_verification_options(handle, false, 0),
            Err(PactError::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.verifier_set_publish_options::<&str>(handle, "", None, &[], None),
            Err(PactError::InvalidArgument(_))
        ));
        assert!(registry.verifier_set_filter_info(handle, "(", "", false).is_err());
        assert!(registry.verifier_url_source(handle, "not a url", None, None, None).is_err());
        assert!(
            registry
                .verifier_url_source(handle, "http://broker/pact", Some("u"), None, Some("t"))
                .is_err()
        );
        assert!(registry.verifier_add_custom_header(handle, "bad header", "v").is_err());
        assert!(
            registry
                .verifier_broker_source_with_selectors(
                    handle,
                    BrokerQuery {
                        url: "http://broker",
                        selectors: &[r#"{"colour":"blue"}"#.to_string()],
                        ..BrokerQuery::default()
                    }
                )
                .is_err()
        );
        assert!(matches!(
            registry.verifier_broker_source_with_selectors(handle, BrokerQuery::default()),
            Err(PactError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_unknown_handle() {
        let registry = Registry::new();
        let handle = VerifierHandle::new(42);
        assert!(matches!(
            registry.verifier_add_file_source(handle, "pact.json"),
            Err(PactError::InvalidHandle { .. })
        ));
        assert!(!registry.verifier_shutdown(handle));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute_rejects_concurrent_runs_and_freezes_settings() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": true}))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        let dir = pact_dir();

        let registry = Registry::new();
        let handle = registry.verifier_new_for_application(&Config::default(), "tests", "1.0");
        let port = server.address().port();
        registry
            .verifier_set_provider_info(handle, "Provider", "http", "127.0.0.1", Some(port), "")
            .unwrap();
        registry
            .verifier_add_directory_source(handle, dir.path().to_str().unwrap())
            .unwrap();

        let runtime = Handle::current();
        let task = registry.verifier_execute(handle, &runtime).unwrap();
        assert!(matches!(
            registry.verifier_execute(handle, &runtime),
            Err(PactError::AlreadyExecuting(_))
        ));
        assert!(matches!(
            registry.verifier_set_fail_if_no_pacts_found(handle, false),
            Err(PactError::Frozen(_))
        ));

        let report = task.await.unwrap();
        assert!(report.success());
        assert_eq!(registry.verifier_last_report(handle).unwrap(), Some(report));

        // Completed runs can be repeated.
        let again = registry.verifier_execute(handle, &runtime).unwrap().await.unwrap();
        assert!(again.success());
        assert!(registry.verifier_shutdown(handle));
    }

    #[tokio::test]
    async fn test_shutdown_during_run_discards_result() {
        let registry = Registry::new();
        let handle = registry.verifier_new_for_application(&Config::default(), "tests", "1.0");
        registry.verifier_set_fail_if_no_pacts_found(handle, true).unwrap();
        let task = registry.verifier_execute(handle, &Handle::current()).unwrap();
        assert!(registry.verifier_shutdown(handle));
        let report = task.await.unwrap();
        assert!(!report.success(), "nothing was loaded");
        assert!(registry.verifier_last_report(handle).is_err());
    }
}
