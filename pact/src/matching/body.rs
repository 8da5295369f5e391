//! Body comparison.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde_json::{Map, Value};

use super::Mismatch;
use super::rules::{check_content_type, check_rules};
use crate::model::matchers::resolve_path_rules;
use crate::model::{Body, ContentType, DocPath, MatchingRule, RuleList, multipart};

/// Rule applied to descendants of a node governed by a type rule.
static CASCADED_TYPE: Lazy<RuleList> = Lazy::new(|| RuleList::single(MatchingRule::Type));

static NO_RULES: BTreeMap<String, RuleList> = BTreeMap::new();

/// Expected and actual sides of a body comparison.
pub(crate) struct BodyInput<'a> {
    pub body: &'a Body,
    pub content_type: Option<ContentType>,
}

struct Walker<'a> {
    rules: &'a BTreeMap<String, RuleList>,
    allow_unexpected_keys: bool,
}

/// Compare an expected body with an actual one.
///
/// A body type mismatch short-circuits structural comparison.
pub(crate) fn match_body(
    expected: &BodyInput<'_>,
    actual: &BodyInput<'_>,
    rules: Option<&BTreeMap<String, RuleList>>,
    allow_unexpected_keys: bool,
) -> Vec<Mismatch> {
    let rules = rules.unwrap_or(&NO_RULES);
    let root = DocPath::root();

    let (expected_bytes, actual_bytes) = match (expected.body, actual.body) {
        (Body::Missing, _) => return Vec::new(),
        (Body::Empty, Body::Missing | Body::Empty) => return Vec::new(),
        (Body::Empty, Body::Present { content, .. }) => {
            return vec![Mismatch::body(
                &root,
                None,
                Some(String::from_utf8_lossy(content).into_owned()),
                "Expected an empty body",
            )];
        }
        (Body::Present { content, .. }, Body::Missing | Body::Empty) => {
            return vec![Mismatch::body(
                &root,
                Some(String::from_utf8_lossy(content).into_owned()),
                None,
                "Expected a body but received none",
            )];
        }
        (Body::Present { content: e, .. }, Body::Present { content: a, .. }) => (e, a),
    };

    let expected_ct = expected
        .content_type
        .clone()
        .unwrap_or_else(|| ContentType::detect(expected_bytes));
    let actual_ct = actual
        .content_type
        .clone()
        .unwrap_or_else(|| ContentType::detect(actual_bytes));

    if let Some(list) = rules.get("$") {
        if let Some(MatchingRule::ContentType(ct)) = list
            .rules
            .iter()
            .find(|rule| matches!(rule, MatchingRule::ContentType(_)))
        {
            return check_content_type(ct, actual_bytes, Some(&actual_ct))
                .err()
                .map(|msg| {
                    vec![Mismatch::body(
                        &root,
                        Some(ct.clone()),
                        Some(actual_ct.base_type()),
                        msg,
                    )]
                })
                .unwrap_or_default();
        }
    }

    if !expected_ct.is_equivalent_to(&actual_ct) {
        return vec![Mismatch::body_type(&expected_ct, &actual_ct)];
    }

    if expected_ct.is_json() {
        let expected_json = serde_json::from_slice::<Value>(expected_bytes);
        let actual_json = serde_json::from_slice::<Value>(actual_bytes);
        return match (expected_json, actual_json) {
            (Ok(e), Ok(a)) => {
                let walker = Walker {
                    rules,
                    allow_unexpected_keys,
                };
                let mut out = Vec::new();
                walker.compare(&root, &e, &a, None, &mut out);
                out
            }
            (Ok(_), Err(err)) => vec![Mismatch::BodyTypeMismatch {
                expected: expected_ct.base_type(),
                actual: actual_ct.base_type(),
                mismatch: format!("Actual body is not valid JSON: {err}"),
            }],
            (Err(_), _) => compare_text(&root, expected_bytes, actual_bytes, rules.get("$")),
        };
    }

    if expected_ct.is_multipart() {
        return compare_multipart(&expected_ct, &actual_ct, expected_bytes, actual_bytes, rules);
    }

    compare_text(&root, expected_bytes, actual_bytes, resolve_path_rules(rules, &root))
}

fn compare_text(
    path: &DocPath,
    expected: &[u8],
    actual: &[u8],
    rules: Option<&RuleList>,
) -> Vec<Mismatch> {
    let expected_text = String::from_utf8_lossy(expected);
    let actual_text = String::from_utf8_lossy(actual);
    let result = match rules {
        Some(list) => check_rules(
            list,
            &Value::String(expected_text.to_string()),
            &Value::String(actual_text.to_string()),
        ),
        None if expected == actual => Ok(()),
        None => Err(if std::str::from_utf8(expected).is_ok() {
            format!("Expected body '{expected_text}' but received '{actual_text}'")
        } else {
            format!(
                "Expected binary body of {} byte(s) but received different content of {} byte(s)",
                expected.len(),
                actual.len()
            )
        }),
    };
    result
        .err()
        .map(|msg| {
            vec![Mismatch::body(
                path,
                Some(expected_text.into_owned()),
                Some(actual_text.into_owned()),
                msg,
            )]
        })
        .unwrap_or_default()
}

fn compare_multipart(
    expected_ct: &ContentType,
    actual_ct: &ContentType,
    expected: &[u8],
    actual: &[u8],
    rules: &BTreeMap<String, RuleList>,
) -> Vec<Mismatch> {
    let root = DocPath::root();
    let (Some(expected_boundary), Some(actual_boundary)) =
        (expected_ct.attribute("boundary"), actual_ct.attribute("boundary"))
    else {
        return compare_text(&root, expected, actual, None);
    };
    let Some(expected_parts) = multipart::parse(expected, expected_boundary) else {
        return compare_text(&root, expected, actual, None);
    };
    let Some(actual_parts) = multipart::parse(actual, actual_boundary) else {
        return vec![Mismatch::body(
            &root,
            None,
            None,
            "Actual body is not a valid multipart body",
        )];
    };

    let mut out = Vec::new();
    for expected_part in &expected_parts {
        let path = root.join(&expected_part.name);
        let Some(actual_part) = actual_parts.iter().find(|p| p.name == expected_part.name) else {
            out.push(Mismatch::body(
                &path,
                Some(expected_part.name.clone()),
                None,
                format!("Expected a multipart part named '{}'", expected_part.name),
            ));
            continue;
        };

        let content_rule = rules.get(&path.to_string()).and_then(|list| {
            list.rules.iter().find_map(|rule| match rule {
                MatchingRule::ContentType(ct) => Some(ct.clone()),
                _ => None,
            })
        });
        if let Some(ct) = content_rule {
            if let Err(msg) = check_content_type(&ct, &actual_part.body, actual_part.content_type.as_ref()) {
                out.push(Mismatch::body(&path, Some(ct), None, msg));
            }
            continue;
        }

        let part_ct = expected_part.content_type.clone();
        let is_json = part_ct.as_ref().is_some_and(ContentType::is_json);
        match (
            is_json,
            serde_json::from_slice::<Value>(&expected_part.body),
            serde_json::from_slice::<Value>(&actual_part.body),
        ) {
            (true, Ok(e), Ok(a)) => {
                let walker = Walker {
                    rules: &NO_RULES,
                    allow_unexpected_keys: true,
                };
                walker.compare(&path, &e, &a, None, &mut out);
            }
            _ => out.extend(compare_text(&path, &expected_part.body, &actual_part.body, None)),
        }
    }
    out
}

impl Walker<'_> {
    fn compare(
        &self,
        path: &DocPath,
        expected: &Value,
        actual: &Value,
        inherited: Option<&RuleList>,
        out: &mut Vec<Mismatch>,
    ) {
        let own = resolve_path_rules(self.rules, path);
        match own.or(inherited) {
            Some(list) => {
                if let Err(msg) = check_rules(list, expected, actual) {
                    out.push(Mismatch::body(
                        path,
                        Some(expected.to_string()),
                        Some(actual.to_string()),
                        msg,
                    ));
                    return;
                }
                let cascade = list.has_type_rule().then_some(&*CASCADED_TYPE);
                match (expected, actual) {
                    (Value::Object(e), Value::Object(a)) => self.compare_object(path, e, a, list, cascade, out),
                    (Value::Array(e), Value::Array(a)) => self.compare_array(path, e, a, list, cascade, out),
                    _ => {}
                }
            }
            None => match (expected, actual) {
                (Value::Object(e), Value::Object(a)) => {
                    self.compare_object(path, e, a, &RuleList::default(), None, out);
                }
                (Value::Array(e), Value::Array(a)) => {
                    self.compare_array(path, e, a, &RuleList::default(), None, out);
                }
                _ if expected == actual => {}
                _ => out.push(Mismatch::body(
                    path,
                    Some(expected.to_string()),
                    Some(actual.to_string()),
                    format!("Expected {expected} but received {actual}"),
                )),
            },
        }
    }

    fn compare_object(
        &self,
        path: &DocPath,
        expected: &Map<String, Value>,
        actual: &Map<String, Value>,
        list: &RuleList,
        inherited: Option<&RuleList>,
        out: &mut Vec<Mismatch>,
    ) {
        let mut structural = false;
        for rule in &list.rules {
            match rule {
                MatchingRule::EachKey(key_rules) => {
                    structural = true;
                    for key in actual.keys() {
                        if let Err(msg) = check_rules(key_rules, &Value::String(key.clone()), &Value::String(key.clone())) {
                            out.push(Mismatch::body(&path.join(key), None, Some(key.clone()), msg));
                        }
                    }
                }
                MatchingRule::EachValue(value_rules) => {
                    structural = true;
                    let template = expected.values().next();
                    for (key, value) in actual {
                        let child = path.join(key);
                        let reference = template.unwrap_or(value);
                        if let Err(msg) = check_rules(value_rules, reference, value) {
                            out.push(Mismatch::body(&child, template.map(Value::to_string), Some(value.to_string()), msg));
                        } else if let Some(template) = template {
                            self.compare(&child, template, value, Some(&CASCADED_TYPE), out);
                        }
                    }
                }
                _ => {}
            }
        }
        if structural {
            return;
        }

        for (key, expected_value) in expected {
            let child = path.join(key);
            match actual.get(key) {
                Some(actual_value) => self.compare(&child, expected_value, actual_value, inherited, out),
                None => out.push(Mismatch::body(
                    &child,
                    Some(expected_value.to_string()),
                    None,
                    format!("Expected key '{key}' but was missing"),
                )),
            }
        }
        if !self.allow_unexpected_keys {
            for (key, actual_value) in actual {
                if !expected.contains_key(key) {
                    out.push(Mismatch::body(
                        &path.join(key),
                        None,
                        Some(actual_value.to_string()),
                        format!("Did not expect key '{key}'"),
                    ));
                }
            }
        }
    }

    fn compare_array(
        &self,
        path: &DocPath,
        expected: &[Value],
        actual: &[Value],
        list: &RuleList,
        inherited: Option<&RuleList>,
        out: &mut Vec<Mismatch>,
    ) {
        if let Some(variants) = list.rules.iter().find_map(|rule| match rule {
            MatchingRule::ArrayContains(variants) => Some(variants),
            _ => None,
        }) {
            for variant in variants {
                let Some(example) = expected.get(variant.index) else {
                    continue;
                };
                let walker = Walker {
                    rules: &variant.rules,
                    allow_unexpected_keys: true,
                };
                let found = actual.iter().any(|candidate| {
                    let mut scratch = Vec::new();
                    walker.compare(&DocPath::root(), example, candidate, None, &mut scratch);
                    scratch.is_empty()
                });
                if !found {
                    out.push(Mismatch::body(
                        path,
                        Some(example.to_string()),
                        Some(Value::Array(actual.to_vec()).to_string()),
                        format!("Variant at index {} ({example}) was not found in the actual list", variant.index),
                    ));
                }
            }
            return;
        }

        if list.has_type_rule() {
            let Some(first) = expected.first() else {
                return;
            };
            for (index, actual_value) in actual.iter().enumerate() {
                let template = expected.get(index).unwrap_or(first);
                self.compare(&path.join_index(index), template, actual_value, inherited, out);
            }
            return;
        }

        if expected.len() != actual.len() {
            out.push(Mismatch::body(
                path,
                Some(Value::Array(expected.to_vec()).to_string()),
                Some(Value::Array(actual.to_vec()).to_string()),
                format!(
                    "Expected an array of length {} but received {} item(s)",
                    expected.len(),
                    actual.len()
                ),
            ));
        }
        for (index, (e, a)) in expected.iter().zip(actual).enumerate() {
            self.compare(&path.join_index(index), e, a, inherited, out);
        }
    }
}
