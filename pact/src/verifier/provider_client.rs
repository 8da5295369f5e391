//! Calls made against the provider during verification.

use std::collections::BTreeMap;

use bytes::Bytes;
use pact_common::{HttpConfig, TransportError, build_http_client};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde_json::{Value, json};
use tracing::{debug, instrument};
use url::Url;

use super::config::{ProviderStateConfig, VerificationOptions};
use crate::error::{PactError, Result};
use crate::model::{Body, ContentType, HttpRequest, HttpResponse, MultiValues, ProviderState};

/// Whether a state change sets a state up or tears it down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StateAction {
    Setup,
    Teardown,
}

impl StateAction {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Teardown => "teardown",
        }
    }
}

/// HTTP client for one verification run.
pub(crate) fn client(options: &VerificationOptions) -> std::result::Result<Client, TransportError> {
    let config = HttpConfig::default()
        .with_timeout(options.request_timeout)
        .with_invalid_certs_accepted(options.disable_ssl_verification);
    Ok(build_http_client(&config)?)
}

/// URL for an expected request relative to the provider base URL.
pub(crate) fn request_url(base: &Url, request: &HttpRequest) -> Result<Url> {
    let mut url = base
        .join(request.path.trim_start_matches('/'))
        .map_err(|e| PactError::invalid_argument(format!("Invalid request path '{}': {e}", request.path)))?;
    if !request.query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (name, values) in &request.query {
            for value in values {
                pairs.append_pair(name, value);
            }
        }
    }
    Ok(url)
}

fn header_map(headers: &MultiValues, custom: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    let invalid = |name: &str| PactError::invalid_argument(format!("Invalid header '{name}'"));
    for (name, values) in headers {
        if custom.keys().any(|c| c.eq_ignore_ascii_case(name)) {
            continue;
        }
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid(name))?;
        for value in values {
            map.append(header.clone(), HeaderValue::from_str(value).map_err(|_| invalid(name))?);
        }
    }
    for (name, value) in custom {
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid(name))?;
        map.insert(header, HeaderValue::from_str(value).map_err(|_| invalid(name))?);
    }
    Ok(map)
}

fn response_headers(headers: &HeaderMap) -> MultiValues {
    let mut out = MultiValues::new();
    for (name, value) in headers {
        out.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}

/// Replay an expected request against the provider.
#[instrument(skip_all, fields(method = %request.method, path = %request.path))]
pub(crate) async fn send(
    client: &Client,
    base: &Url,
    request: &HttpRequest,
    custom_headers: &BTreeMap<String, String>,
) -> Result<HttpResponse> {
    let url = request_url(base, request)?;
    let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| PactError::invalid_argument(format!("Invalid method '{}'", request.method)))?;
    let mut headers = header_map(&request.headers, custom_headers)?;
    if request.body.is_present() && !headers.contains_key(CONTENT_TYPE) {
        if let Some(content_type) = request.body.content_type() {
            if let Ok(value) = HeaderValue::from_str(&content_type.to_string()) {
                headers.insert(CONTENT_TYPE, value);
            }
        }
    }

    let response = client
        .request(method, url)
        .headers(headers)
        .body(request.body.bytes())
        .send()
        .await
        .map_err(TransportError::from)?;

    let status = response.status().as_u16();
    let headers = response_headers(response.headers());
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<ContentType>().ok());
    let bytes: Bytes = response.bytes().await.map_err(TransportError::from)?;
    debug!(status, bytes = bytes.len(), "Provider responded");

    Ok(HttpResponse {
        status,
        headers,
        body: Body::from_bytes(bytes, content_type),
        ..HttpResponse::default()
    })
}

/// Invoke the state change endpoint for one provider state.
#[instrument(skip(client, config), fields(state = %state.name, action = action.as_str()))]
pub(crate) async fn change_state(
    client: &Client,
    config: &ProviderStateConfig,
    state: &ProviderState,
    action: StateAction,
) -> Result<()> {
    let request = if config.body {
        client.post(config.url.clone()).json(&json!({
            "state": state.name,
            "params": Value::Object(state.params.clone()),
            "action": action.as_str(),
        }))
    } else {
        let mut url = config.url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("state", &state.name);
            pairs.append_pair("action", action.as_str());
            for (name, value) in &state.params {
                pairs.append_pair(name, &param_string(value));
            }
        }
        client.post(url)
    };

    let response = request.send().await.map_err(TransportError::from)?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(TransportError::status(status.as_u16(), config.url.as_str()).into())
    }
}

fn param_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
