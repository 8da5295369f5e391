//! Loading pacts for verification.
//!
//! Local sources are read from disk; remote sources go through the retry
//! policy so a flaky broker does not fail the run on the first hiccup. A
//! source that still fails is reported, never fatal for the others.

use std::path::Path;

use pact_common::{RetryPolicy, TransportError};
use reqwest::Client;
use reqwest::header::ACCEPT;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::config::{BrokerSource, Credentials, PactSource, VerifierSettings};
use super::report::SourceError;
use crate::model::Pact;
use crate::pact_file::parse_pact;

const HAL_ACCEPT: &str = "application/hal+json, application/json";
const PACTS_FOR_VERIFICATION: &str = "pb:provider-pacts-for-verification";
const PUBLISH_RESULTS: &str = "pb:publish-verification-results";

/// Where and how to publish results for a pact.
#[derive(Debug, Clone)]
pub(crate) struct PublishTarget {
    pub results_url: Url,
    pub broker_base: Url,
    pub credentials: Credentials,
}

/// A pact ready for verification.
#[derive(Debug, Clone)]
pub(crate) struct LoadedPact {
    pub pact: Pact,
    pub source: String,
    pub pending: bool,
    pub publish: Option<PublishTarget>,
}

fn link(doc: &Value, name: &str) -> Option<String> {
    doc.get("_links")
        .and_then(|links| links.get(name))
        .and_then(|link| link.get("href"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn origin(url: &Url) -> Url {
    let mut base = url.clone();
    base.set_path("/");
    base.set_query(None);
    base.set_fragment(None);
    base
}

async fn read_local(path: &Path) -> Result<Pact, String> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let doc: Value = serde_json::from_str(&text).map_err(|e| format!("{} is not JSON: {e}", path.display()))?;
    parse_pact(&doc).map_err(|e| format!("{}: {e}", path.display()))
}

async fn read_directory(dir: &Path, provider: &str) -> Result<Vec<Pact>, String> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| format!("cannot read directory {}: {e}", dir.display()))?;
    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| format!("cannot read directory {}: {e}", dir.display()))?
    {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut pacts = Vec::new();
    for path in paths {
        match read_local(&path).await {
            Ok(pact) if provider.is_empty() || pact.provider == provider => pacts.push(pact),
            Ok(pact) => debug!(path = %path.display(), provider = %pact.provider, "Skipping pact for another provider"),
            Err(e) => warn!(error = %e, "Skipping unreadable file in pact directory"),
        }
    }
    Ok(pacts)
}

async fn send_json(
    client: &Client,
    retry: &RetryPolicy,
    credentials: &Credentials,
    url: &Url,
    body: Option<&Value>,
) -> Result<Value, TransportError> {
    retry
        .execute(move || async move {
            let request = match body {
                Some(body) => client.post(url.clone()).json(body),
                None => client.get(url.clone()),
            };
            let response = credentials.apply(request).header(ACCEPT, HAL_ACCEPT).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::status(status.as_u16(), url.as_str()));
            }
            Ok(response.json::<Value>().await?)
        })
        .await
}

#[instrument(skip(client, retry, credentials))]
async fn fetch_pact(
    client: &Client,
    retry: &RetryPolicy,
    credentials: &Credentials,
    url: &Url,
    broker_base: Option<&Url>,
) -> Result<(Pact, Option<PublishTarget>), String> {
    let doc = send_json(client, retry, credentials, url, None)
        .await
        .map_err(|e| e.to_string())?;
    let pact = parse_pact(&doc).map_err(|e| format!("{url}: {e}"))?;
    let publish = link(&doc, PUBLISH_RESULTS)
        .and_then(|href| Url::parse(&href).ok())
        .map(|results_url| PublishTarget {
            broker_base: broker_base.cloned().unwrap_or_else(|| origin(&results_url)),
            results_url,
            credentials: credentials.clone(),
        });
    Ok((pact, publish))
}

fn selectors(broker: &BrokerSource) -> Vec<Value> {
    if broker.selectors.is_empty() {
        broker
            .consumer_version_tags
            .iter()
            .map(|tag| json!({ "tag": tag, "latest": true }))
            .collect()
    } else {
        broker.selectors.clone()
    }
}

#[instrument(skip_all, fields(broker = %broker.url, provider))]
async fn fetch_from_broker(
    client: &Client,
    retry: &RetryPolicy,
    broker: &BrokerSource,
    provider: &str,
) -> Result<Vec<LoadedPact>, String> {
    let credentials = &broker.credentials;
    let index = send_json(client, retry, credentials, &broker.url, None)
        .await
        .map_err(|e| e.to_string())?;
    let template = link(&index, PACTS_FOR_VERIFICATION)
        .ok_or_else(|| format!("{} does not offer {PACTS_FOR_VERIFICATION}", broker.url))?;
    let encoded: String = url::form_urlencoded::byte_serialize(provider.as_bytes()).collect();
    let endpoint = Url::parse(&template.replace("{provider}", &encoded))
        .map_err(|e| format!("invalid {PACTS_FOR_VERIFICATION} link: {e}"))?;

    let mut query = json!({
        "consumerVersionSelectors": selectors(broker),
        "includePendingStatus": broker.enable_pending,
    });
    if !broker.provider_tags.is_empty() {
        query["providerVersionTags"] = json!(broker.provider_tags);
    }
    if let Some(branch) = &broker.provider_branch {
        query["providerVersionBranch"] = json!(branch);
    }
    if let Some(since) = &broker.include_wip_since {
        query["includeWipPactsSince"] = json!(since);
    }
    let listing = send_json(client, retry, credentials, &endpoint, Some(&query))
        .await
        .map_err(|e| e.to_string())?;

    let entries = listing
        .pointer("/_embedded/pacts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    info!(count = entries.len(), "Broker returned pacts for verification");

    let mut loaded = Vec::with_capacity(entries.len());
    for entry in entries {
        let href = link(&entry, "self").ok_or("broker listed a pact without a self link")?;
        let url = Url::parse(&href).map_err(|e| format!("invalid pact link {href}: {e}"))?;
        let pending = entry
            .pointer("/verificationProperties/pending")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let (pact, publish) = fetch_pact(client, retry, credentials, &url, Some(&broker.url)).await?;
        loaded.push(LoadedPact {
            pact,
            source: format!("broker {url}"),
            pending,
            publish,
        });
    }
    Ok(loaded)
}

async fn load_one(
    client: &Client,
    retry: &RetryPolicy,
    source: &PactSource,
    provider: &str,
) -> Result<Vec<LoadedPact>, String> {
    let local = |pact: Pact| LoadedPact {
        pact,
        source: source.label(),
        pending: false,
        publish: None,
    };
    match source {
        PactSource::File(path) => Ok(vec![local(read_local(path).await?)]),
        PactSource::Directory(dir) => Ok(read_directory(dir, provider).await?.into_iter().map(local).collect()),
        PactSource::Url { url, credentials } => {
            let (pact, publish) = fetch_pact(client, retry, credentials, url, None).await?;
            Ok(vec![LoadedPact {
                pact,
                source: source.label(),
                pending: false,
                publish,
            }])
        }
        PactSource::Broker(broker) => fetch_from_broker(client, retry, broker, provider).await,
    }
}

/// Load every configured source, keeping only pacts of the selected
/// consumers.
pub(crate) async fn load_all(
    client: &Client,
    retry: &RetryPolicy,
    settings: &VerifierSettings,
) -> (Vec<LoadedPact>, Vec<SourceError>) {
    let mut pacts = Vec::new();
    let mut errors = Vec::new();
    for source in &settings.sources {
        match load_one(client, retry, source, &settings.provider.name).await {
            Ok(loaded) => {
                debug!(source = %source.label(), pacts = loaded.len(), "Loaded pact source");
                pacts.extend(loaded);
            }
            Err(message) => {
                warn!(source = %source.label(), error = %message, "Failed to load pact source");
                errors.push(SourceError {
                    source: source.label(),
                    message,
                });
            }
        }
    }
    if !settings.consumer_filters.is_empty() {
        pacts.retain(|loaded| settings.consumer_filters.iter().any(|c| *c == loaded.pact.consumer));
    }
    (pacts, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pact_file::to_json;

    fn pact_doc(consumer: &str, provider: &str) -> String {
        let mut pact = Pact::new(consumer, provider);
        pact.interactions
            .push(crate::model::PactInteraction::Http(crate::model::HttpInteraction::new("a request")));
        to_json(&pact).to_string()
    }

    #[tokio::test]
    async fn test_directory_filters_by_provider() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("c-p.json"), pact_doc("C", "P")).unwrap();
        std::fs::write(dir.path().join("c-other.json"), pact_doc("C", "Other")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let pacts = read_directory(dir.path(), "P").await.unwrap();
        assert_eq!(pacts.len(), 1);
        assert_eq!(pacts[0].provider, "P");
        assert_eq!(read_directory(dir.path(), "").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_is_a_source_error() {
        let mut settings = VerifierSettings::default();
        settings.sources.push(PactSource::File("/definitely/not/here.json".into()));
        let (pacts, errors) = load_all(&Client::new(), &RetryPolicy::no_retries(), &settings).await;
        assert!(pacts.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].source.starts_with("file "));
    }

    #[tokio::test]
    async fn test_consumer_filters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), pact_doc("A", "P")).unwrap();
        std::fs::write(dir.path().join("b.json"), pact_doc("B", "P")).unwrap();
        let mut settings = VerifierSettings::default();
        settings.sources.push(PactSource::Directory(dir.path().to_path_buf()));
        settings.consumer_filters = vec!["B".into()];
        let (pacts, errors) = load_all(&Client::new(), &RetryPolicy::no_retries(), &settings).await;
        assert!(errors.is_empty());
        assert_eq!(pacts.len(), 1);
        assert_eq!(pacts[0].pact.consumer, "B");
    }

    #[test]
    fn test_tags_become_selectors() {
        let broker = BrokerSource {
            url: Url::parse("http://broker/").unwrap(),
            credentials: Credentials::None,
            enable_pending: false,
            include_wip_since: None,
            provider_tags: vec![],
            provider_branch: None,
            selectors: vec![],
            consumer_version_tags: vec!["prod".into()],
        };
        assert_eq!(selectors(&broker), vec![json!({"tag": "prod", "latest": true})]);
    }

    #[test]
    fn test_origin() {
        let url = Url::parse("https://broker.example/pacts/provider/P/results?x=1").unwrap();
        assert_eq!(origin(&url).as_str(), "https://broker.example/");
    }
}
