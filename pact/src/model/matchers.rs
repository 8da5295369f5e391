//! Matching rules and the document paths they are attached to.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value, json};

use crate::error::{PactError, Result};

/// Class of HTTP status codes accepted by a status rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpStatus {
    /// 1xx
    Information,
    /// 2xx
    Success,
    /// 3xx
    Redirect,
    /// 4xx
    ClientError,
    /// 5xx
    ServerError,
    /// Anything below 400
    NonError,
    /// 400 and above
    Error,
    /// Explicit list of codes
    StatusCodes(Vec<u16>),
}

impl HttpStatus {
    /// Check whether `status` belongs to this class.
    #[must_use]
    pub fn contains(&self, status: u16) -> bool {
        match self {
            Self::Information => (100..200).contains(&status),
            Self::Success => (200..300).contains(&status),
            Self::Redirect => (300..400).contains(&status),
            Self::ClientError => (400..500).contains(&status),
            Self::ServerError => (500..600).contains(&status),
            Self::NonError => status < 400,
            Self::Error => status >= 400,
            Self::StatusCodes(codes) => codes.contains(&status),
        }
    }

    fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::String(name) => match name.as_str() {
                "info" | "information" => Ok(Self::Information),
                "success" => Ok(Self::Success),
                "redirect" => Ok(Self::Redirect),
                "clientError" => Ok(Self::ClientError),
                "serverError" => Ok(Self::ServerError),
                "nonError" => Ok(Self::NonError),
                "error" => Ok(Self::Error),
                other => Err(PactError::invalid_argument(format!(
                    "'{other}' is not a known status class"
                ))),
            },
            Value::Array(codes) => codes
                .iter()
                .map(|code| {
                    code.as_u64()
                        .and_then(|c| u16::try_from(c).ok())
                        .ok_or_else(|| PactError::invalid_argument("Status codes must be integers"))
                })
                .collect::<Result<Vec<_>>>()
                .map(Self::StatusCodes),
            _ => Err(PactError::invalid_argument("Status rule needs a class name or a list of codes")),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Information => json!("info"),
            Self::Success => json!("success"),
            Self::Redirect => json!("redirect"),
            Self::ClientError => json!("clientError"),
            Self::ServerError => json!("serverError"),
            Self::NonError => json!("nonError"),
            Self::Error => json!("error"),
            Self::StatusCodes(codes) => json!(codes),
        }
    }
}

/// One variant of an `arrayContains` rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayVariant {
    /// Index of the example element in the expected array
    pub index: usize,
    /// Rules relative to the element (`$` is the element itself)
    pub rules: BTreeMap<String, RuleList>,
}

/// A non-literal comparison strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchingRule {
    /// Deep equality (the default)
    Equality,
    /// String form of the value matches a regular expression
    Regex(String),
    /// Same JSON type as the example
    Type,
    /// Same type and at least `n` elements
    MinType(usize),
    /// Same type and at most `n` elements
    MaxType(usize),
    /// Same type with an element count in range
    MinMaxType(usize, usize),
    /// String contains the value
    Include(String),
    /// Integer number
    Integer,
    /// Number with a fractional part
    Decimal,
    /// Any number
    Number,
    /// Boolean
    Boolean,
    /// Null
    Null,
    /// Non-empty value of the same type
    NotEmpty,
    /// Date in a Java style format (`yyyy-MM-dd`)
    Date(String),
    /// Time in a Java style format (`HH:mm:ss`)
    Time(String),
    /// Date and time in a Java style format
    Timestamp(String),
    /// Body sniffs as the given media type
    ContentType(String),
    /// Every key of an object satisfies the rules
    EachKey(RuleList),
    /// Every value of an object or array satisfies the rules
    EachValue(RuleList),
    /// Each variant matches at least one element
    ArrayContains(Vec<ArrayVariant>),
    /// Status code belongs to a class
    StatusCode(HttpStatus),
}

impl MatchingRule {
    /// Rules that compare the shape rather than the value.
    ///
    /// These cascade to descendants that have no rule of their own.
    #[must_use]
    pub const fn is_type_family(&self) -> bool {
        matches!(
            self,
            Self::Type | Self::MinType(_) | Self::MaxType(_) | Self::MinMaxType(..) | Self::EachValue(_)
        )
    }

    /// Rule name as written in pact files.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Equality => "equality",
            Self::Regex(_) => "regex",
            Self::Type | Self::MinType(_) | Self::MaxType(_) | Self::MinMaxType(..) => "type",
            Self::Include(_) => "include",
            Self::Integer => "integer",
            Self::Decimal => "decimal",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Null => "null",
            Self::NotEmpty => "notEmpty",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::Timestamp(_) => "timestamp",
            Self::ContentType(_) => "contentType",
            Self::EachKey(_) => "eachKey",
            Self::EachValue(_) => "eachValue",
            Self::ArrayContains(_) => "arrayContains",
            Self::StatusCode(_) => "statusCode",
        }
    }

    /// Pact file representation (`{"match": ...}`).
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("match".into(), json!(self.name()));
        match self {
            Self::Regex(regex) => {
                map.insert("regex".into(), json!(regex));
            }
            Self::MinType(min) => {
                map.insert("min".into(), json!(min));
            }
            Self::MaxType(max) => {
                map.insert("max".into(), json!(max));
            }
            Self::MinMaxType(min, max) => {
                map.insert("min".into(), json!(min));
                map.insert("max".into(), json!(max));
            }
            Self::Include(value) | Self::ContentType(value) => {
                map.insert("value".into(), json!(value));
            }
            Self::Date(format) | Self::Time(format) | Self::Timestamp(format) => {
                map.insert("format".into(), json!(format));
            }
            Self::EachKey(rules) | Self::EachValue(rules) => {
                map.insert(
                    "rules".into(),
                    Value::Array(rules.rules.iter().map(Self::to_json).collect()),
                );
            }
            Self::ArrayContains(variants) => {
                let variants = variants
                    .iter()
                    .map(|variant| {
                        json!({
                            "index": variant.index,
                            "rules": rule_map_to_json(&variant.rules),
                        })
                    })
                    .collect();
                map.insert("variants".into(), Value::Array(variants));
            }
            Self::StatusCode(status) => {
                map.insert("status".into(), status.to_json());
            }
            Self::Equality
            | Self::Type
            | Self::Integer
            | Self::Decimal
            | Self::Number
            | Self::Boolean
            | Self::Null
            | Self::NotEmpty => {}
        }
        Value::Object(map)
    }

    /// Parse a rule from its pact file representation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for unknown rule names or missing attributes.
    pub fn from_json(value: &Value) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| PactError::invalid_argument(format!("Matching rule must be an object: {value}")))?;
        let name = map
            .get("match")
            .and_then(Value::as_str)
            .ok_or_else(|| PactError::invalid_argument(format!("Matching rule has no 'match' attribute: {value}")))?;
        Self::from_attributes(name, map)
    }

    /// Build a rule from its name and attribute map.
    ///
    /// Shared by pact file parsing and by matchers embedded in example JSON.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for unknown rule names or missing attributes.
    pub fn from_attributes(name: &str, map: &Map<String, Value>) -> Result<Self> {
        let string_attr = |key: &str| -> Result<String> {
            map.get(key)
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .ok_or_else(|| PactError::invalid_argument(format!("'{name}' rule requires a '{key}' attribute")))
        };
        let count_attr = |key: &str| -> Option<usize> {
            map.get(key).and_then(Value::as_u64).and_then(|n| usize::try_from(n).ok())
        };
        let format_attr = |default: &str| -> String {
            map.get("format")
                .or_else(|| map.get(name))
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };

        let rule = match name {
            "equality" => Self::Equality,
            "regex" => Self::Regex(string_attr("regex")?),
            "type" | "min" | "max" => match (count_attr("min"), count_attr("max")) {
                (Some(min), Some(max)) => Self::MinMaxType(min, max),
                (Some(min), None) => Self::MinType(min),
                (None, Some(max)) => Self::MaxType(max),
                (None, None) => Self::Type,
            },
            "include" => Self::Include(string_attr("value")?),
            "integer" => Self::Integer,
            "decimal" => Self::Decimal,
            "number" => Self::Number,
            "boolean" => Self::Boolean,
            "null" => Self::Null,
            "notEmpty" => Self::NotEmpty,
            "date" => Self::Date(format_attr("yyyy-MM-dd")),
            "time" => Self::Time(format_attr("HH:mm:ss")),
            "timestamp" | "datetime" => Self::Timestamp(format_attr("yyyy-MM-dd'T'HH:mm:ssXXX")),
            "contentType" | "content-type" => Self::ContentType(string_attr("value")?),
            "semver" => Self::Regex(SEMVER_PATTERN.to_string()),
            "values" => Self::EachValue(RuleList::single(Self::Type)),
            "eachKey" | "eachValue" => {
                let rules = map
                    .get("rules")
                    .and_then(Value::as_array)
                    .map(|rules| rules.iter().map(parse_nested_rule).collect::<Result<Vec<_>>>())
                    .transpose()?
                    .unwrap_or_default();
                let list = RuleList {
                    rules,
                    logic: RuleLogic::And,
                };
                if name == "eachKey" {
                    Self::EachKey(list)
                } else {
                    Self::EachValue(list)
                }
            }
            "arrayContains" => {
                let variants = map
                    .get("variants")
                    .and_then(Value::as_array)
                    .ok_or_else(|| PactError::invalid_argument("'arrayContains' rule requires 'variants'"))?;
                variants
                    .iter()
                    .enumerate()
                    .map(|(position, variant)| {
                        let index = variant
                            .get("index")
                            .and_then(Value::as_u64)
                            .and_then(|i| usize::try_from(i).ok())
                            .unwrap_or(position);
                        let rules = variant
                            .get("rules")
                            .map(rule_map_from_json)
                            .transpose()?
                            .unwrap_or_default();
                        Ok(ArrayVariant { index, rules })
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(Self::ArrayContains)?
            }
            "statusCode" => Self::StatusCode(HttpStatus::from_json(
                map.get("status").unwrap_or(&Value::Null),
            )?),
            other => {
                return Err(PactError::invalid_argument(format!(
                    "'{other}' is not a known matching rule"
                )));
            }
        };
        Ok(rule)
    }
}

const SEMVER_PATTERN: &str = r"^\d+\.\d+\.\d+(-[0-9A-Za-z.-]+)?(\+[0-9A-Za-z.-]+)?$";

/// Nested rules use either `{"match": ..}` or the embedded `pact:matcher:type` form.
fn parse_nested_rule(value: &Value) -> Result<MatchingRule> {
    match value.get("pact:matcher:type").and_then(Value::as_str) {
        Some(name) => value
            .as_object()
            .map_or_else(
                || Err(PactError::invalid_argument("Nested rule must be an object")),
                |map| MatchingRule::from_attributes(name, map),
            ),
        None => MatchingRule::from_json(value),
    }
}

/// How the rules of a list are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleLogic {
    /// Every rule must pass
    #[default]
    And,
    /// At least one rule must pass
    Or,
}

impl RuleLogic {
    const fn as_str(self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

/// Rules attached to one location.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuleList {
    /// Rules in declaration order
    pub rules: Vec<MatchingRule>,
    /// Combination logic
    pub logic: RuleLogic,
}

impl RuleList {
    /// A list holding a single rule.
    #[must_use]
    pub fn single(rule: MatchingRule) -> Self {
        Self {
            rules: vec![rule],
            logic: RuleLogic::And,
        }
    }

    /// No rules attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether any rule cascades to descendants.
    #[must_use]
    pub fn has_type_rule(&self) -> bool {
        self.rules.iter().any(MatchingRule::is_type_family)
    }

    /// Append rules, skipping exact duplicates.
    pub fn merge(&mut self, other: &Self) {
        for rule in &other.rules {
            if !self.rules.contains(rule) {
                self.rules.push(rule.clone());
            }
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "combine": self.logic.as_str(),
            "matchers": self.rules.iter().map(MatchingRule::to_json).collect::<Vec<_>>(),
        })
    }

    fn from_json(value: &Value) -> Result<Self> {
        // Single rule written without a wrapper
        if value.get("match").is_some() {
            return Ok(Self::single(MatchingRule::from_json(value)?));
        }
        let logic = match value.get("combine").and_then(Value::as_str) {
            Some(c) if c.eq_ignore_ascii_case("or") => RuleLogic::Or,
            _ => RuleLogic::And,
        };
        let rules = value
            .get("matchers")
            .and_then(Value::as_array)
            .map(|rules| rules.iter().map(MatchingRule::from_json).collect::<Result<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        Ok(Self { rules, logic })
    }
}

/// Segment of a document path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathToken {
    /// Object field
    Field(String),
    /// Array index
    Index(usize),
    /// Any field or index
    Star,
}

/// Location inside a body (`$.items[0].id`, `$.*`, `$['a b']`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DocPath {
    tokens: Vec<PathToken>,
}

impl DocPath {
    /// The document root, `$`.
    #[must_use]
    pub const fn root() -> Self {
        Self { tokens: Vec::new() }
    }

    /// Child path for an object field.
    #[must_use]
    pub fn join(&self, field: &str) -> Self {
        self.with(PathToken::Field(field.to_string()))
    }

    /// Child path for an array index.
    #[must_use]
    pub fn join_index(&self, index: usize) -> Self {
        self.with(PathToken::Index(index))
    }

    /// Child path matching any element.
    #[must_use]
    pub fn join_star(&self) -> Self {
        self.with(PathToken::Star)
    }

    fn with(&self, token: PathToken) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.push(token);
        Self { tokens }
    }

    /// Segments after the root.
    #[must_use]
    pub fn tokens(&self) -> &[PathToken] {
        &self.tokens
    }

    /// Whether this path is `$`.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Weight of this (rule) path against a concrete path, `None` if it does
    /// not apply. Exact segments weigh more than wildcards.
    #[must_use]
    pub fn match_weight(&self, concrete: &Self) -> Option<usize> {
        if self.tokens.len() != concrete.tokens.len() {
            return None;
        }
        self.tokens
            .iter()
            .zip(&concrete.tokens)
            .try_fold(1, |weight, (rule, actual)| match (rule, actual) {
                (PathToken::Star, _) => Some(weight + 1),
                (PathToken::Field(a), PathToken::Field(b)) if a == b => Some(weight + 2),
                (PathToken::Index(a), PathToken::Index(b)) if a == b => Some(weight + 2),
                _ => None,
            })
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("$")?;
        for token in &self.tokens {
            match token {
                PathToken::Field(name)
                    if !name.is_empty()
                        && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') =>
                {
                    write!(f, ".{name}")?;
                }
                PathToken::Field(name) => write!(f, "['{}']", name.replace('\'', "\\'"))?,
                PathToken::Index(index) => write!(f, "[{index}]")?,
                PathToken::Star => f.write_str(".*")?,
            }
        }
        Ok(())
    }
}

impl FromStr for DocPath {
    type Err = PactError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| PactError::invalid_argument(format!("Invalid path '{s}': {reason}"));
        let rest = s.strip_prefix('$').ok_or_else(|| invalid("must start with '$'"))?;
        let chars: Vec<char> = rest.chars().collect();
        let mut tokens = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '.' => {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
                        end += 1;
                    }
                    let name: String = chars[start..end].iter().collect();
                    if name.is_empty() {
                        return Err(invalid("empty field name"));
                    }
                    tokens.push(if name == "*" {
                        PathToken::Star
                    } else {
                        PathToken::Field(name)
                    });
                    i = end;
                }
                '[' => {
                    let close = chars[i..]
                        .iter()
                        .position(|c| *c == ']')
                        .map(|offset| i + offset)
                        .ok_or_else(|| invalid("unterminated '['"))?;
                    let inner: String = chars[i + 1..close].iter().collect();
                    let inner = inner.trim();
                    if inner == "*" {
                        tokens.push(PathToken::Star);
                    } else if let Some(quoted) = inner
                        .strip_prefix('\'')
                        .and_then(|q| q.strip_suffix('\''))
                    {
                        tokens.push(PathToken::Field(quoted.replace("\\'", "'")));
                    } else {
                        let index = inner.parse::<usize>().map_err(|_| invalid("bad index"))?;
                        tokens.push(PathToken::Index(index));
                    }
                    i = close + 1;
                }
                _ => return Err(invalid("unexpected character")),
            }
        }
        Ok(Self { tokens })
    }
}

/// Part of an interaction a rule category applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    /// Request path
    Path,
    /// Query parameters, keyed by name
    Query,
    /// Headers, keyed by name
    Header,
    /// Body, keyed by document path
    Body,
    /// Response status
    Status,
    /// Message metadata, keyed by name
    Metadata,
}

impl Category {
    const ALL: [Self; 6] = [
        Self::Path,
        Self::Query,
        Self::Header,
        Self::Body,
        Self::Status,
        Self::Metadata,
    ];

    /// Name as written in pact files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Query => "query",
            Self::Header => "header",
            Self::Body => "body",
            Self::Status => "status",
            Self::Metadata => "metadata",
        }
    }

    /// Categories with one rule list rather than a keyed map.
    const fn is_single(self) -> bool {
        matches!(self, Self::Path | Self::Status)
    }
}

/// Rules of one interaction part, grouped by category.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatchingRules {
    categories: BTreeMap<Category, BTreeMap<String, RuleList>>,
}

/// Key under which single-list categories store their rules.
const SINGLE_KEY: &str = "";

impl MatchingRules {
    /// No rules in any category.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.categories.values().all(|rules| rules.values().all(RuleList::is_empty))
    }

    /// Add one rule at a location, combined with AND.
    pub fn add_rule(&mut self, category: Category, key: impl Into<String>, rule: MatchingRule) {
        self.add_rules(category, key, &RuleList::single(rule));
    }

    /// Merge a rule list into a location.
    pub fn add_rules(&mut self, category: Category, key: impl Into<String>, rules: &RuleList) {
        let key = if category.is_single() {
            SINGLE_KEY.to_string()
        } else {
            key.into()
        };
        self.categories
            .entry(category)
            .or_default()
            .entry(key)
            .and_modify(|existing| existing.merge(rules))
            .or_insert_with(|| rules.clone());
    }

    /// Replace every rule of a category.
    pub fn set_category(&mut self, category: Category, rules: BTreeMap<String, RuleList>) {
        self.categories.insert(category, rules);
    }

    /// Remove the rules stored at a key.
    pub fn remove(&mut self, category: Category, key: &str) {
        if let Some(rules) = self.categories.get_mut(&category) {
            rules.retain(|k, _| !k.eq_ignore_ascii_case(key) && !is_indexed_key_of(k, key));
        }
    }

    /// All rules of a category.
    #[must_use]
    pub fn category(&self, category: Category) -> Option<&BTreeMap<String, RuleList>> {
        self.categories.get(&category)
    }

    /// Rules of a single-list category (path, status).
    #[must_use]
    pub fn single(&self, category: Category) -> Option<&RuleList> {
        self.categories
            .get(&category)
            .and_then(|rules| rules.get(SINGLE_KEY))
            .filter(|list| !list.is_empty())
    }

    /// Rules for a named value at a position.
    ///
    /// Looks for `name[index]` first, then `name`. Names compare
    /// case-insensitively for headers and exactly otherwise.
    #[must_use]
    pub fn for_value(&self, category: Category, name: &str, index: usize) -> Option<&RuleList> {
        let rules = self.categories.get(&category)?;
        let eq = |a: &str, b: &str| {
            if category == Category::Header {
                a.eq_ignore_ascii_case(b)
            } else {
                a == b
            }
        };
        let indexed = format!("{name}[{index}]");
        rules
            .iter()
            .find(|(key, _)| eq(key, &indexed))
            .or_else(|| rules.iter().find(|(key, _)| eq(key, name)))
            .map(|(_, list)| list)
            .filter(|list| !list.is_empty())
    }

    /// Pact file representation.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (category, rules) in &self.categories {
            if rules.values().all(RuleList::is_empty) {
                continue;
            }
            let value = if category.is_single() {
                rules.get(SINGLE_KEY).map_or(Value::Null, RuleList::to_json)
            } else {
                rule_map_to_json(rules)
            };
            map.insert(category.as_str().to_string(), value);
        }
        Value::Object(map)
    }

    /// Parse rules from a pact file.
    ///
    /// Understands the nested layout (`{"body": {"$.a": {...}}}`) and the
    /// flat layout of older files (`{"$.body.a": {...}}`).
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when a rule cannot be parsed.
    pub fn from_json(value: &Value) -> Result<Self> {
        let mut rules = Self::default();
        let Some(map) = value.as_object() else {
            return Ok(rules);
        };

        for (key, value) in map {
            if let Some(category) = Category::ALL.iter().find(|c| c.as_str() == key) {
                if category.is_single() {
                    rules.add_rules(*category, SINGLE_KEY, &RuleList::from_json(value)?);
                } else {
                    for (path, list) in rule_map_from_json(value)? {
                        let path = if *category == Category::Body {
                            path
                        } else {
                            path.trim_start_matches("$.").to_string()
                        };
                        rules.add_rules(*category, path, &list);
                    }
                }
            } else if let Some((category, path)) = split_flat_key(key) {
                rules.add_rules(category, path, &RuleList::from_json(value)?);
            }
        }
        Ok(rules)
    }
}

fn is_indexed_key_of(key: &str, name: &str) -> bool {
    key.get(..name.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(name))
        && key[name.len()..].starts_with('[')
}

/// `$.body.a` style keys from older files.
fn split_flat_key(key: &str) -> Option<(Category, String)> {
    let rest = key.strip_prefix("$.")?;
    let (head, tail) = rest.split_once('.').map_or((rest, ""), |(h, t)| (h, t));
    match head {
        "body" => Some((Category::Body, format!("${}", rest.strip_prefix("body").unwrap_or_default()))),
        "path" => Some((Category::Path, SINGLE_KEY.to_string())),
        "headers" | "header" => Some((Category::Header, tail.to_string())),
        "query" => Some((Category::Query, tail.to_string())),
        "metadata" => Some((Category::Metadata, tail.to_string())),
        _ => None,
    }
}

fn rule_map_to_json(rules: &BTreeMap<String, RuleList>) -> Value {
    Value::Object(
        rules
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(key, list)| (key.clone(), list.to_json()))
            .collect(),
    )
}

pub(crate) fn rule_map_from_json(value: &Value) -> Result<BTreeMap<String, RuleList>> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(key, list)| Ok((key.clone(), RuleList::from_json(list)?)))
                .collect::<Result<BTreeMap<_, _>>>()
        })
        .transpose()
        .map(Option::unwrap_or_default)
}

/// Most specific rule list for a concrete body path.
#[must_use]
pub fn resolve_path_rules<'a>(
    rules: &'a BTreeMap<String, RuleList>,
    path: &DocPath,
) -> Option<&'a RuleList> {
    rules
        .iter()
        .filter(|(_, list)| !list.is_empty())
        .filter_map(|(key, list)| {
            let rule_path = key.parse::<DocPath>().ok()?;
            rule_path.match_weight(path).map(|weight| (weight, list))
        })
        .max_by_key(|(weight, _)| *weight)
        .map(|(_, list)| list)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_path_round_trip() {
        for path in ["$", "$.a", "$.a[0].b", "$.items.*", "$['a b'].c", "$.a[*]"] {
            let parsed: DocPath = path.parse().unwrap();
            let expected = path.replace("[*]", ".*");
            assert_eq!(parsed.to_string(), expected);
        }
        assert!("a.b".parse::<DocPath>().is_err());
        assert!("$[x".parse::<DocPath>().is_err());
    }

    #[test]
    fn test_most_specific_rule_wins() {
        let mut rules = BTreeMap::new();
        rules.insert("$.items[*].id".to_string(), RuleList::single(MatchingRule::Integer));
        rules.insert("$.items[1].id".to_string(), RuleList::single(MatchingRule::Regex("x".into())));
        rules.insert("$.*".to_string(), RuleList::single(MatchingRule::Type));

        let first = DocPath::root().join("items").join_index(0).join("id");
        let second = DocPath::root().join("items").join_index(1).join("id");
        let top = DocPath::root().join("anything");

        assert_eq!(resolve_path_rules(&rules, &first).unwrap().rules, vec![MatchingRule::Integer]);
        assert_eq!(
            resolve_path_rules(&rules, &second).unwrap().rules,
            vec![MatchingRule::Regex("x".into())]
        );
        assert_eq!(resolve_path_rules(&rules, &top).unwrap().rules, vec![MatchingRule::Type]);
        assert!(resolve_path_rules(&rules, &DocPath::root()).is_none());
    }

    #[test]
    fn test_rule_json_round_trip() {
        let rules = [
            MatchingRule::Regex(r"\d+".into()),
            MatchingRule::MinType(1),
            MatchingRule::MinMaxType(1, 3),
            MatchingRule::Timestamp("yyyy-MM-dd HH:mm".into()),
            MatchingRule::ContentType("image/png".into()),
            MatchingRule::EachKey(RuleList::single(MatchingRule::Regex("[a-z]+".into()))),
            MatchingRule::StatusCode(HttpStatus::Success),
        ];
        for rule in rules {
            assert_eq!(MatchingRule::from_json(&rule.to_json()).unwrap(), rule);
        }
    }

    #[test]
    fn test_unknown_rule_rejected() {
        assert!(MatchingRule::from_json(&json!({"match": "telepathy"})).is_err());
        assert!(MatchingRule::from_json(&json!({"match": "regex"})).is_err());
    }

    #[test]
    fn test_value_lookup_prefers_index() {
        let mut rules = MatchingRules::default();
        rules.add_rule(Category::Header, "X-Id", MatchingRule::Type);
        rules.add_rule(Category::Header, "X-Id[1]", MatchingRule::Integer);

        assert_eq!(
            rules.for_value(Category::Header, "x-id", 1).unwrap().rules,
            vec![MatchingRule::Integer]
        );
        assert_eq!(
            rules.for_value(Category::Header, "x-id", 0).unwrap().rules,
            vec![MatchingRule::Type]
        );
        assert!(rules.for_value(Category::Query, "x-id", 0).is_none());
    }

    #[test]
    fn test_rules_json_layouts() {
        let mut rules = MatchingRules::default();
        rules.add_rule(Category::Path, "ignored", MatchingRule::Regex("/data/\\d+".into()));
        rules.add_rule(Category::Body, "$.id", MatchingRule::Integer);
        rules.add_rule(Category::Query, "page", MatchingRule::Regex("\\d+".into()));

        let json = rules.to_json();
        assert_eq!(json["path"]["matchers"][0]["match"], "regex");
        assert_eq!(json["body"]["$.id"]["combine"], "AND");
        assert_eq!(MatchingRules::from_json(&json).unwrap(), rules);

        let flat = json!({
            "$.body.id": {"match": "integer"},
            "$.headers.Accept": {"match": "regex", "regex": "json"}
        });
        let parsed = MatchingRules::from_json(&flat).unwrap();
        assert!(parsed.category(Category::Body).unwrap().contains_key("$.id"));
        assert!(parsed.for_value(Category::Header, "accept", 0).is_some());
    }
}
