//! HTTP interactions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::body::Body;
use super::content_type::ContentType;
use super::matchers::MatchingRules;

/// Header or query values keyed by name, in positional order.
pub type MultiValues = BTreeMap<String, Vec<String>>;

/// Precondition the provider must be put in before an interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderState {
    /// State name
    pub name: String,
    /// State parameters
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

impl ProviderState {
    /// State without parameters.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }
}

/// Case-insensitive header lookup.
#[must_use]
pub fn find_header<'a>(headers: &'a MultiValues, name: &str) -> Option<(&'a String, &'a Vec<String>)> {
    headers.iter().find(|(key, _)| key.eq_ignore_ascii_case(name))
}

/// Set a positional value, padding earlier positions with empty strings.
///
/// Header names are matched case-insensitively; the first spelling wins.
pub fn set_positional(values: &mut MultiValues, name: &str, index: usize, value: String, case_insensitive: bool) {
    let key = if case_insensitive {
        values
            .keys()
            .find(|key| key.eq_ignore_ascii_case(name))
            .cloned()
            .unwrap_or_else(|| name.to_string())
    } else {
        name.to_string()
    };
    let entry = values.entry(key).or_default();
    if entry.len() <= index {
        entry.resize(index + 1, String::new());
    }
    entry[index] = value;
}

/// Expected or observed HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// Query parameters
    pub query: MultiValues,
    /// Request headers
    pub headers: MultiValues,
    /// Request body
    pub body: Body,
    /// Matching rules for path, query, headers and body
    pub matching_rules: MatchingRules,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            path: "/".to_string(),
            query: MultiValues::new(),
            headers: MultiValues::new(),
            body: Body::Missing,
            matching_rules: MatchingRules::default(),
        }
    }
}

impl HttpRequest {
    /// Content type from the header, falling back to the body.
    #[must_use]
    pub fn content_type(&self) -> Option<ContentType> {
        header_content_type(&self.headers).or_else(|| self.body.effective_content_type())
    }
}

/// Expected or observed HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Response headers
    pub headers: MultiValues,
    /// Response body
    pub body: Body,
    /// Matching rules for status, headers and body
    pub matching_rules: MatchingRules,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: MultiValues::new(),
            body: Body::Missing,
            matching_rules: MatchingRules::default(),
        }
    }
}

impl HttpResponse {
    /// Content type from the header, falling back to the body.
    #[must_use]
    pub fn content_type(&self) -> Option<ContentType> {
        header_content_type(&self.headers).or_else(|| self.body.effective_content_type())
    }
}

fn header_content_type(headers: &MultiValues) -> Option<ContentType> {
    find_header(headers, "content-type")
        .and_then(|(_, values)| values.first())
        .and_then(|value| value.parse().ok())
}

/// One HTTP request/response expectation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpInteraction {
    /// Unique description within the pact
    pub description: String,
    /// Provider states, in order
    pub provider_states: Vec<ProviderState>,
    /// Expected request
    pub request: HttpRequest,
    /// Response to return
    pub response: HttpResponse,
    /// Named provider transport used during verification
    pub transport: Option<String>,
    /// Failures do not fail verification
    pub pending: bool,
    /// Configuration returned by plugins, keyed by plugin name
    pub plugin_config: BTreeMap<String, Value>,
}

impl HttpInteraction {
    /// Interaction with a description and default request/response.
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }
}
