//! Matching engine.
//!
//! Compares expected interaction parts with observed traffic. Matching is
//! pure: neither side is modified, and the result is the ordered list of
//! mismatches found (empty when the parts match).

mod body;
pub(crate) mod rules;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::annotated::value_to_string;
use crate::model::interaction::find_header;
use crate::model::{
    Category, ContentType, DocPath, HttpRequest, HttpResponse, MatchingRules, MessageContents,
    MultiValues,
};

use body::{BodyInput, match_body};
use rules::{check_rules, check_str_rules};

/// Kind of a mismatch, independent of its details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MismatchKind {
    /// HTTP method differs
    Method,
    /// Request path differs
    Path,
    /// Response status differs
    Status,
    /// Query parameter differs or is missing
    Query,
    /// Header differs or is missing
    Header,
    /// Body content types are incompatible
    BodyType,
    /// A body value differs
    Body,
    /// Message metadata differs or is missing
    Metadata,
}

impl MismatchKind {
    /// Stable name used in reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Method => "method",
            Self::Path => "path",
            Self::Status => "status",
            Self::Query => "query",
            Self::Header => "header",
            Self::BodyType => "body-type",
            Self::Body => "body",
            Self::Metadata => "metadata",
        }
    }
}

/// One failed comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[allow(missing_docs)]
pub enum Mismatch {
    MethodMismatch {
        expected: String,
        actual: String,
    },
    PathMismatch {
        expected: String,
        actual: String,
        mismatch: String,
    },
    StatusMismatch {
        expected: u16,
        actual: u16,
        mismatch: String,
    },
    QueryMismatch {
        parameter: String,
        expected: String,
        actual: String,
        mismatch: String,
    },
    HeaderMismatch {
        key: String,
        expected: String,
        actual: String,
        mismatch: String,
    },
    BodyTypeMismatch {
        expected: String,
        actual: String,
        mismatch: String,
    },
    BodyMismatch {
        path: String,
        expected: Option<String>,
        actual: Option<String>,
        mismatch: String,
    },
    MetadataMismatch {
        key: String,
        expected: String,
        actual: String,
        mismatch: String,
    },
}

impl Mismatch {
    pub(crate) fn body(
        path: &DocPath,
        expected: Option<String>,
        actual: Option<String>,
        mismatch: impl Into<String>,
    ) -> Self {
        Self::BodyMismatch {
            path: path.to_string(),
            expected,
            actual,
            mismatch: mismatch.into(),
        }
    }

    pub(crate) fn body_type(expected: &ContentType, actual: &ContentType) -> Self {
        Self::BodyTypeMismatch {
            expected: expected.base_type(),
            actual: actual.base_type(),
            mismatch: format!(
                "Expected a body of '{}' but the actual content type was '{}'",
                expected.base_type(),
                actual.base_type()
            ),
        }
    }

    /// Kind of this mismatch.
    #[must_use]
    pub const fn kind(&self) -> MismatchKind {
        match self {
            Self::MethodMismatch { .. } => MismatchKind::Method,
            Self::PathMismatch { .. } => MismatchKind::Path,
            Self::StatusMismatch { .. } => MismatchKind::Status,
            Self::QueryMismatch { .. } => MismatchKind::Query,
            Self::HeaderMismatch { .. } => MismatchKind::Header,
            Self::BodyTypeMismatch { .. } => MismatchKind::BodyType,
            Self::BodyMismatch { .. } => MismatchKind::Body,
            Self::MetadataMismatch { .. } => MismatchKind::Metadata,
        }
    }

    /// Human readable description.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::MethodMismatch { expected, actual } => {
                format!("Expected method {expected} but received {actual}")
            }
            Self::StatusMismatch { mismatch, .. }
            | Self::PathMismatch { mismatch, .. }
            | Self::BodyTypeMismatch { mismatch, .. } => mismatch.clone(),
            Self::QueryMismatch { parameter, mismatch, .. } => {
                format!("query parameter '{parameter}': {mismatch}")
            }
            Self::HeaderMismatch { key, mismatch, .. } => format!("header '{key}': {mismatch}"),
            Self::BodyMismatch { path, mismatch, .. } => format!("{path}: {mismatch}"),
            Self::MetadataMismatch { key, mismatch, .. } => format!("metadata '{key}': {mismatch}"),
        }
    }
}

/// Matching options.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchConfig {
    /// Report query parameters that were not expected
    pub strict_query: bool,
}

/// Compare an observed request with an expected one.
#[must_use]
pub fn match_request(expected: &HttpRequest, actual: &HttpRequest, config: MatchConfig) -> Vec<Mismatch> {
    let mut out = Vec::new();
    let rules = &expected.matching_rules;

    if !expected.method.eq_ignore_ascii_case(&actual.method) {
        out.push(Mismatch::MethodMismatch {
            expected: expected.method.to_uppercase(),
            actual: actual.method.to_uppercase(),
        });
    }

    let path_result = match rules.single(Category::Path) {
        Some(list) => check_str_rules(list, &expected.path, &actual.path),
        None if expected.path == actual.path => Ok(()),
        None => Err(format!(
            "Expected path '{}' but received '{}'",
            expected.path, actual.path
        )),
    };
    if let Err(mismatch) = path_result {
        out.push(Mismatch::PathMismatch {
            expected: expected.path.clone(),
            actual: actual.path.clone(),
            mismatch,
        });
    }

    out.extend(match_query(&expected.query, &actual.query, rules, config));
    out.extend(match_headers(&expected.headers, &actual.headers, rules));
    out.extend(match_body(
        &BodyInput {
            body: &expected.body,
            content_type: expected.content_type(),
        },
        &BodyInput {
            body: &actual.body,
            content_type: actual.content_type(),
        },
        rules.category(Category::Body),
        false,
    ));
    out
}

/// Compare an observed response with an expected one.
///
/// Unexpected body keys are tolerated.
#[must_use]
pub fn match_response(expected: &HttpResponse, actual: &HttpResponse) -> Vec<Mismatch> {
    let mut out = Vec::new();
    let rules = &expected.matching_rules;

    let status_result = match rules.single(Category::Status) {
        Some(list) => check_rules(list, &Value::from(expected.status), &Value::from(actual.status)),
        None if expected.status == actual.status => Ok(()),
        None => Err(format!(
            "Expected status {} but received {}",
            expected.status, actual.status
        )),
    };
    if let Err(mismatch) = status_result {
        out.push(Mismatch::StatusMismatch {
            expected: expected.status,
            actual: actual.status,
            mismatch,
        });
    }

    out.extend(match_headers(&expected.headers, &actual.headers, rules));
    out.extend(match_body(
        &BodyInput {
            body: &expected.body,
            content_type: expected.content_type(),
        },
        &BodyInput {
            body: &actual.body,
            content_type: actual.content_type(),
        },
        rules.category(Category::Body),
        true,
    ));
    out
}

/// Compare observed message contents with expected ones.
#[must_use]
pub fn match_message_contents(expected: &MessageContents, actual: &MessageContents) -> Vec<Mismatch> {
    let mut out = Vec::new();
    let rules = &expected.matching_rules;

    for (key, expected_value) in &expected.metadata {
        let Some(actual_value) = actual.metadata.get(key) else {
            out.push(Mismatch::MetadataMismatch {
                key: key.clone(),
                expected: value_to_string(expected_value),
                actual: String::new(),
                mismatch: format!("Expected metadata key '{key}' but was missing"),
            });
            continue;
        };
        let result = match rules.for_value(Category::Metadata, key, 0) {
            Some(list) => check_rules(list, expected_value, actual_value),
            None if is_content_type_key(key) => {
                compare_content_type_values(&value_to_string(expected_value), &value_to_string(actual_value))
            }
            None if value_to_string(expected_value) == value_to_string(actual_value) => Ok(()),
            None => Err(format!("Expected {expected_value} but received {actual_value}")),
        };
        if let Err(mismatch) = result {
            out.push(Mismatch::MetadataMismatch {
                key: key.clone(),
                expected: value_to_string(expected_value),
                actual: value_to_string(actual_value),
                mismatch,
            });
        }
    }

    out.extend(match_body(
        &BodyInput {
            body: &expected.contents,
            content_type: message_content_type(expected),
        },
        &BodyInput {
            body: &actual.contents,
            content_type: message_content_type(actual),
        },
        rules.category(Category::Body),
        true,
    ));
    out
}

fn is_content_type_key(key: &str) -> bool {
    key.eq_ignore_ascii_case("contentType") || key.eq_ignore_ascii_case("content-type")
}

/// Content type from the metadata, falling back to the body.
pub(crate) fn message_content_type(contents: &MessageContents) -> Option<ContentType> {
    contents
        .metadata
        .iter()
        .find(|(key, _)| is_content_type_key(key))
        .and_then(|(_, value)| value.as_str())
        .and_then(|value| value.parse().ok())
        .or_else(|| contents.contents.effective_content_type())
}

fn match_query(
    expected: &MultiValues,
    actual: &MultiValues,
    rules: &MatchingRules,
    config: MatchConfig,
) -> Vec<Mismatch> {
    let mut out = Vec::new();
    for (name, expected_values) in expected {
        let Some(actual_values) = actual.get(name) else {
            out.push(Mismatch::QueryMismatch {
                parameter: name.clone(),
                expected: expected_values.join(","),
                actual: String::new(),
                mismatch: format!("Expected query parameter '{name}' but was missing"),
            });
            continue;
        };

        let len = expected_values.len().max(actual_values.len());
        for index in 0..len {
            let rule = rules.for_value(Category::Query, name, index);
            let result = match (expected_values.get(index), actual_values.get(index)) {
                (Some(e), Some(a)) => match rule {
                    Some(list) => check_str_rules(list, e, a),
                    None if e == a => Ok(()),
                    None => Err(format!("Expected '{e}' but received '{a}'")),
                },
                (Some(e), None) => Err(format!("Expected value '{e}' at index {index} but was missing")),
                (None, Some(a)) => match (rule, expected_values.first()) {
                    (Some(list), Some(first)) if list.has_type_rule() => check_str_rules(list, first, a),
                    _ => Err(format!("Unexpected value '{a}' at index {index}")),
                },
                (None, None) => Ok(()),
            };
            if let Err(mismatch) = result {
                out.push(Mismatch::QueryMismatch {
                    parameter: name.clone(),
                    expected: expected_values.join(","),
                    actual: actual_values.join(","),
                    mismatch,
                });
            }
        }
    }

    if config.strict_query {
        for (name, actual_values) in actual {
            if !expected.contains_key(name) {
                out.push(Mismatch::QueryMismatch {
                    parameter: name.clone(),
                    expected: String::new(),
                    actual: actual_values.join(","),
                    mismatch: format!("Unexpected query parameter '{name}'"),
                });
            }
        }
    }
    out
}

fn match_headers(expected: &MultiValues, actual: &MultiValues, rules: &MatchingRules) -> Vec<Mismatch> {
    let mut out = Vec::new();
    for (name, expected_values) in expected {
        let Some((_, actual_values)) = find_header(actual, name) else {
            out.push(Mismatch::HeaderMismatch {
                key: name.clone(),
                expected: expected_values.join(", "),
                actual: String::new(),
                mismatch: format!("Expected header '{name}' but was missing"),
            });
            continue;
        };
        let joined = actual_values.join(", ");

        for (index, expected_value) in expected_values.iter().enumerate() {
            let result = if let Some(list) = rules.for_value(Category::Header, name, index) {
                let actual_value = if actual_values.len() > index && actual_values.len() == expected_values.len() {
                    &actual_values[index]
                } else {
                    &joined
                };
                check_str_rules(list, expected_value, actual_value)
            } else if name.eq_ignore_ascii_case("content-type") {
                compare_content_type_values(expected_value, actual_values.first().map_or("", String::as_str))
            } else {
                let tokens: Vec<&str> = actual_values
                    .iter()
                    .flat_map(|value| value.split(','))
                    .map(str::trim)
                    .collect();
                if expected_value
                    .split(',')
                    .map(str::trim)
                    .all(|token| tokens.contains(&token))
                {
                    Ok(())
                } else {
                    Err(format!("Expected '{expected_value}' but received '{joined}'"))
                }
            };
            if let Err(mismatch) = result {
                out.push(Mismatch::HeaderMismatch {
                    key: name.clone(),
                    expected: expected_value.clone(),
                    actual: joined.clone(),
                    mismatch,
                });
            }
        }
    }
    out
}

/// Media types must agree; expected parameters must be present in the actual value.
fn compare_content_type_values(expected: &str, actual: &str) -> Result<(), String> {
    let mismatch = || Err(format!("Expected content type '{expected}' but received '{actual}'"));
    let (Ok(e), Ok(a)) = (expected.parse::<ContentType>(), actual.parse::<ContentType>()) else {
        return if expected.trim() == actual.trim() { Ok(()) } else { mismatch() };
    };
    if !e.base_type().eq_ignore_ascii_case(&a.base_type()) {
        return mismatch();
    }
    let params_present = e.attributes.iter().all(|(key, value)| {
        a.attribute(key)
            .is_some_and(|actual_value| actual_value.trim_matches('"').eq_ignore_ascii_case(value.trim_matches('"')))
    });
    if params_present { Ok(()) } else { mismatch() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Body, HttpStatus, MatchingRule};
    use serde_json::json;

    fn request(method: &str, path: &str) -> HttpRequest {
        HttpRequest {
            method: method.into(),
            path: path.into(),
            ..HttpRequest::default()
        }
    }

    #[test]
    fn test_identical_requests_match() {
        let req = request("GET", "/data");
        assert!(match_request(&req, &req, MatchConfig::default()).is_empty());
    }

    #[test]
    fn test_method_and_path_mismatch() {
        let mismatches = match_request(&request("GET", "/data"), &request("post", "/wrong"), MatchConfig::default());
        let kinds: Vec<_> = mismatches.iter().map(Mismatch::kind).collect();
        assert_eq!(kinds, vec![MismatchKind::Method, MismatchKind::Path]);
    }

    #[test]
    fn test_method_is_case_insensitive() {
        assert!(match_request(&request("get", "/"), &request("GET", "/"), MatchConfig::default()).is_empty());
    }

    #[test]
    fn test_path_rule() {
        let mut expected = request("GET", "/items/1");
        expected
            .matching_rules
            .add_rule(Category::Path, "", MatchingRule::Regex(r"^/items/\d+$".into()));
        assert!(match_request(&expected, &request("GET", "/items/42"), MatchConfig::default()).is_empty());
        assert_eq!(
            match_request(&expected, &request("GET", "/items/x"), MatchConfig::default()).len(),
            1
        );
    }

    #[test]
    fn test_query_order_and_strictness() {
        let mut expected = request("GET", "/");
        expected.query.insert("id".into(), vec!["1".into(), "2".into()]);
        let mut actual = expected.clone();
        actual.query.insert("extra".into(), vec!["x".into()]);
        assert!(match_request(&expected, &actual, MatchConfig::default()).is_empty());
        assert_eq!(
            match_request(&expected, &actual, MatchConfig { strict_query: true }).len(),
            1
        );

        actual.query.insert("id".into(), vec!["2".into(), "1".into()]);
        assert_eq!(match_request(&expected, &actual, MatchConfig::default()).len(), 2);
    }

    #[test]
    fn test_query_rule_at_index() {
        let mut expected = request("GET", "/");
        expected.query.insert("id".into(), vec!["1".into(), "x".into()]);
        expected
            .matching_rules
            .add_rule(Category::Query, "id[0]", MatchingRule::Regex(r"^\d+$".into()));
        let mut actual = expected.clone();
        actual.query.insert("id".into(), vec!["77".into(), "x".into()]);
        assert!(match_request(&expected, &actual, MatchConfig::default()).is_empty());
    }

    #[test]
    fn test_headers_case_insensitive_and_extra_tolerated() {
        let mut expected = request("GET", "/");
        expected.headers.insert("Accept".into(), vec!["application/json".into()]);
        let mut actual = request("GET", "/");
        actual.headers.insert("accept".into(), vec!["text/html, application/json".into()]);
        actual.headers.insert("x-extra".into(), vec!["1".into()]);
        assert!(match_request(&expected, &actual, MatchConfig::default()).is_empty());

        actual.headers.remove("accept");
        let mismatches = match_request(&expected, &actual, MatchConfig::default());
        assert_eq!(mismatches[0].kind(), MismatchKind::Header);
    }

    #[test]
    fn test_content_type_parameters() {
        assert!(compare_content_type_values("application/json", "application/json; charset=UTF-8").is_ok());
        assert!(compare_content_type_values("application/json; charset=utf-8", "application/json; charset=UTF-8").is_ok());
        assert!(compare_content_type_values("application/json; charset=utf-8", "application/json").is_err());
        assert!(compare_content_type_values("application/json", "text/plain").is_err());
    }

    #[test]
    fn test_response_status_and_body() {
        let expected = HttpResponse {
            status: 200,
            body: Body::from_text(json!({"ok": true}).to_string(), Some(ContentType::json())),
            ..HttpResponse::default()
        };
        let mut actual = expected.clone();
        actual.body = Body::from_text(json!({"ok": true, "more": 1}).to_string(), Some(ContentType::json()));
        assert!(match_response(&expected, &actual).is_empty());

        actual.status = 404;
        let mismatches = match_response(&expected, &actual);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].kind(), MismatchKind::Status);
    }

    #[test]
    fn test_status_class_rule() {
        let mut expected = HttpResponse::default();
        expected
            .matching_rules
            .add_rule(Category::Status, "", MatchingRule::StatusCode(HttpStatus::Success));
        let actual = HttpResponse {
            status: 204,
            ..HttpResponse::default()
        };
        assert!(match_response(&expected, &actual).is_empty());
    }

    #[test]
    fn test_message_metadata() {
        let mut expected = MessageContents::default();
        expected.metadata.insert("topic".into(), json!("orders"));
        let mut actual = expected.clone();
        assert!(match_message_contents(&expected, &actual).is_empty());
        actual.metadata.insert("topic".into(), json!("refunds"));
        assert_eq!(match_message_contents(&expected, &actual)[0].kind(), MismatchKind::Metadata);
    }

    #[test]
    fn test_matching_does_not_mutate() {
        let mut expected = request("POST", "/a");
        expected.body = Body::from_text("{\"a\":1}", Some(ContentType::json()));
        let actual = request("POST", "/b");
        let before = (expected.clone(), actual.clone());
        let first = match_request(&expected, &actual, MatchConfig::default());
        let second = match_request(&expected, &actual, MatchConfig::default());
        assert_eq!(first, second);
        assert_eq!(before, (expected, actual));
    }

    #[test]
    fn test_mismatch_serializes_with_type_tag() {
        let value = serde_json::to_value(Mismatch::MethodMismatch {
            expected: "GET".into(),
            actual: "POST".into(),
        })
        .unwrap();
        assert_eq!(value["type"], "MethodMismatch");
    }
}
