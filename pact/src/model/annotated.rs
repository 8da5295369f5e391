//! Matchers embedded in example values.
//!
//! Builders receive example JSON in which any node may be a matcher object
//! (`{"pact:matcher:type": "regex", "regex": "\\d+", "value": "12"}`). Such
//! nodes are parsed exactly once, when the example is stored, into an
//! [`Annotated`] value whose literal example and rules then travel apart.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::matchers::{ArrayVariant, DocPath, MatchingRule, RuleList, RuleLogic};
use crate::error::{PactError, Result};

/// Key marking a matcher object.
pub const MATCHER_KEY: &str = "pact:matcher:type";

/// A value that is either a literal or an example governed by rules.
#[derive(Debug, Clone, PartialEq)]
pub enum Annotated<T> {
    /// Compared by equality
    Literal(T),
    /// Compared with the attached rules
    Matched {
        /// Example used when a concrete value is needed
        example: T,
        /// Rules governing comparison
        rules: RuleList,
    },
}

impl<T> Annotated<T> {
    /// The literal value or the example.
    pub const fn example(&self) -> &T {
        match self {
            Self::Literal(value) | Self::Matched { example: value, .. } => value,
        }
    }

    /// Split into the example and optional rules.
    pub fn into_parts(self) -> (T, Option<RuleList>) {
        match self {
            Self::Literal(value) => (value, None),
            Self::Matched { example, rules } => (example, Some(rules)),
        }
    }
}

impl Annotated<Value> {
    /// Classify a single JSON node.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the node is a malformed matcher.
    pub fn parse(value: &Value) -> Result<Self> {
        let Some((map, kind)) = value
            .as_object()
            .and_then(|map| map.get(MATCHER_KEY).map(|kind| (map, kind)))
        else {
            return Ok(Self::Literal(value.clone()));
        };

        if kind.as_str() == Some("arrayContains") {
            return parse_array_contains(map);
        }

        let rules = match kind {
            Value::String(name) => RuleList::single(MatchingRule::from_attributes(name, map)?),
            Value::Array(matchers) => {
                let logic = match map.get("combine").and_then(Value::as_str) {
                    Some(c) if c.eq_ignore_ascii_case("or") => RuleLogic::Or,
                    _ => RuleLogic::And,
                };
                let rules = matchers
                    .iter()
                    .map(|m| {
                        let name = m.get(MATCHER_KEY).and_then(Value::as_str).ok_or_else(|| {
                            PactError::invalid_argument("Combined matcher entries need a matcher type")
                        })?;
                        let attrs = m.as_object().cloned().unwrap_or_default();
                        MatchingRule::from_attributes(name, &attrs)
                    })
                    .collect::<Result<Vec<_>>>()?;
                RuleList { rules, logic }
            }
            other => {
                return Err(PactError::invalid_argument(format!(
                    "Matcher type must be a string, got {other}"
                )));
            }
        };

        let example = map.get("value").cloned().unwrap_or(Value::Null);
        Ok(Self::Matched { example, rules })
    }
}

impl Annotated<String> {
    /// Classify a header, query or path value.
    ///
    /// Plain strings are literals; a JSON matcher object yields its example
    /// rendered as a string.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the value is a malformed matcher.
    pub fn parse_str(text: &str) -> Result<Self> {
        if !text.trim_start().starts_with('{') {
            return Ok(Self::Literal(text.to_string()));
        }
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return Ok(Self::Literal(text.to_string()));
        };
        match Annotated::<Value>::parse(&value)? {
            Annotated::Literal(_) => Ok(Self::Literal(text.to_string())),
            Annotated::Matched { example, rules } => {
                let (example, nested) = extract(&example)?;
                if !nested.is_empty() {
                    return Err(PactError::invalid_argument(
                        "Matchers may not be nested inside a header, query or path matcher",
                    ));
                }
                Ok(Self::Matched {
                    example: value_to_string(&example),
                    rules,
                })
            }
        }
    }

    /// Classify one element of a JSON array of values.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the element is a malformed matcher.
    pub fn from_value(value: &Value) -> Result<Self> {
        match Annotated::<Value>::parse(value)? {
            Annotated::Literal(literal) => Ok(Self::Literal(value_to_string(&literal))),
            Annotated::Matched { example, rules } => Ok(Self::Matched {
                example: value_to_string(&example),
                rules,
            }),
        }
    }
}

/// Render a scalar example as a header/query string.
#[must_use]
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_array_contains(map: &Map<String, Value>) -> Result<Annotated<Value>> {
    let variants = map
        .get("variants")
        .and_then(Value::as_array)
        .ok_or_else(|| PactError::invalid_argument("arrayContains matcher requires 'variants'"))?;

    let mut examples = Vec::with_capacity(variants.len());
    let mut rule_variants = Vec::with_capacity(variants.len());
    for (index, variant) in variants.iter().enumerate() {
        let (example, rules) = extract(variant)?;
        examples.push(example);
        rule_variants.push(ArrayVariant { index, rules });
    }

    Ok(Annotated::Matched {
        example: Value::Array(examples),
        rules: RuleList::single(MatchingRule::ArrayContains(rule_variants)),
    })
}

/// Strip matchers from an example, returning the literal document and the
/// rules keyed by body path.
///
/// # Errors
///
/// Returns `InvalidArgument` when a matcher is malformed.
pub fn extract(value: &Value) -> Result<(Value, BTreeMap<String, RuleList>)> {
    let mut rules = BTreeMap::new();
    let literal = walk(value, &DocPath::root(), &mut rules)?;
    Ok((literal, rules))
}

/// Literal example with every matcher removed.
///
/// # Errors
///
/// Returns `InvalidArgument` when a matcher is malformed.
pub fn reify(value: &Value) -> Result<Value> {
    extract(value).map(|(literal, _)| literal)
}

/// Whether any node of the document is a matcher object.
#[must_use]
pub fn contains_matchers(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.contains_key(MATCHER_KEY) || map.values().any(contains_matchers),
        Value::Array(items) => items.iter().any(contains_matchers),
        _ => false,
    }
}

fn walk(value: &Value, path: &DocPath, rules: &mut BTreeMap<String, RuleList>) -> Result<Value> {
    match Annotated::<Value>::parse(value)? {
        Annotated::Literal(literal) => walk_children(&literal, path, rules, false),
        Annotated::Matched { example, rules: list } => {
            let array_contains = list
                .rules
                .iter()
                .any(|rule| matches!(rule, MatchingRule::ArrayContains(_)));
            let wildcard = list.has_type_rule();
            rules
                .entry(path.to_string())
                .and_modify(|existing| existing.merge(&list))
                .or_insert(list);
            if array_contains {
                Ok(example)
            } else {
                walk_children(&example, path, rules, wildcard)
            }
        }
    }
}

fn walk_children(
    value: &Value,
    path: &DocPath,
    rules: &mut BTreeMap<String, RuleList>,
    wildcard: bool,
) -> Result<Value> {
    match value {
        Value::Object(map) => {
            let each_value = wildcard
                && rules
                    .get(&path.to_string())
                    .is_some_and(|list| list.rules.iter().any(|r| matches!(r, MatchingRule::EachValue(_))));
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                let child_path = if each_value { path.join_star() } else { path.join(key) };
                out.insert(key.clone(), walk(child, &child_path, rules)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, child)| {
                let child_path = if wildcard {
                    path.join_star()
                } else {
                    path.join_index(index)
                };
                walk(child, &child_path, rules)
            })
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_literal_and_matched() {
        let literal = Annotated::<Value>::parse(&json!("plain")).unwrap();
        assert_eq!(literal, Annotated::Literal(json!("plain")));

        let matched = Annotated::<Value>::parse(&json!({
            "pact:matcher:type": "regex",
            "regex": "\\d+",
            "value": "42"
        }))
        .unwrap();
        let (example, rules) = matched.into_parts();
        assert_eq!(example, json!("42"));
        assert_eq!(rules.unwrap().rules, vec![MatchingRule::Regex("\\d+".into())]);
    }

    #[test]
    fn test_extract_nested_each_like() {
        let body = json!({
            "items": {
                "pact:matcher:type": "type",
                "min": 1,
                "value": [{
                    "id": {"pact:matcher:type": "integer", "value": 10},
                    "name": "widget"
                }]
            },
            "total": {"pact:matcher:type": "number", "value": 1}
        });
        let (literal, rules) = extract(&body).unwrap();
        assert_eq!(literal, json!({"items": [{"id": 10, "name": "widget"}], "total": 1}));
        assert_eq!(rules["$.items"].rules, vec![MatchingRule::MinType(1)]);
        assert_eq!(rules["$.items.*.id"].rules, vec![MatchingRule::Integer]);
        assert_eq!(rules["$.total"].rules, vec![MatchingRule::Number]);
    }

    #[test]
    fn test_array_contains_variants() {
        let body = json!({
            "pact:matcher:type": "arrayContains",
            "variants": [
                {"kind": "a", "id": {"pact:matcher:type": "integer", "value": 1}},
                {"kind": "b"}
            ]
        });
        let (literal, rules) = extract(&body).unwrap();
        assert_eq!(literal, json!([{"kind": "a", "id": 1}, {"kind": "b"}]));
        let MatchingRule::ArrayContains(variants) = &rules["$"].rules[0] else {
            panic!("expected arrayContains");
        };
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0].rules["$.id"].rules, vec![MatchingRule::Integer]);
        assert!(variants[1].rules.is_empty());
    }

    #[test]
    fn test_parse_str() {
        assert_eq!(
            Annotated::<String>::parse_str("text/plain").unwrap(),
            Annotated::Literal("text/plain".into())
        );
        let matched = Annotated::<String>::parse_str(
            r#"{"pact:matcher:type":"regex","regex":"\\d+","value":"7"}"#,
        )
        .unwrap();
        assert_eq!(matched.example(), "7");
        assert!(Annotated::<String>::parse_str(r#"{"pact:matcher:type":"bogus"}"#).is_err());
        assert_eq!(
            Annotated::<String>::parse_str("{not json").unwrap(),
            Annotated::Literal("{not json".into())
        );
    }

    #[test]
    fn test_contains_matchers_and_reify() {
        let plain = json!({"ok": true, "list": [1, 2]});
        assert!(!contains_matchers(&plain));
        assert_eq!(reify(&plain).unwrap(), plain);

        let with = json!({"ok": {"pact:matcher:type": "boolean", "value": true}});
        assert!(contains_matchers(&with));
        assert_eq!(reify(&with).unwrap(), json!({"ok": true}));
    }
}
