//! Media type parsing and content sniffing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PactError;

/// A parsed media type such as `application/vnd.api+json; charset=utf-8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    /// Top level type (`application`)
    pub main_type: String,
    /// Sub type without suffix (`vnd.api`)
    pub sub_type: String,
    /// Structured syntax suffix (`json`)
    pub suffix: Option<String>,
    /// Parameters in declaration order
    pub attributes: Vec<(String, String)>,
}

impl ContentType {
    /// `application/json`
    #[must_use]
    pub fn json() -> Self {
        Self::simple("application", "json")
    }

    /// `text/plain`
    #[must_use]
    pub fn text() -> Self {
        Self::simple("text", "plain")
    }

    /// `application/octet-stream`
    #[must_use]
    pub fn octet_stream() -> Self {
        Self::simple("application", "octet-stream")
    }

    fn simple(main: &str, sub: &str) -> Self {
        Self {
            main_type: main.to_string(),
            sub_type: sub.to_string(),
            suffix: None,
            attributes: Vec::new(),
        }
    }

    /// The `type/subtype` part without parameters.
    #[must_use]
    pub fn base_type(&self) -> String {
        match &self.suffix {
            Some(suffix) => format!("{}/{}+{}", self.main_type, self.sub_type, suffix),
            None => format!("{}/{}", self.main_type, self.sub_type),
        }
    }

    /// Parameter value by case-insensitive name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// JSON or a `+json` structured type.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.sub_type == "json"
            || self.suffix.as_deref() == Some("json")
            || (self.main_type == "application" && self.sub_type.ends_with("-json"))
    }

    /// XML or a `+xml` structured type.
    #[must_use]
    pub fn is_xml(&self) -> bool {
        self.sub_type == "xml" || self.suffix.as_deref() == Some("xml")
    }

    /// Content that is stored and compared as text.
    #[must_use]
    pub fn is_text(&self) -> bool {
        self.main_type == "text"
            || self.is_json()
            || self.is_xml()
            || (self.main_type == "application"
                && matches!(
                    self.sub_type.as_str(),
                    "x-www-form-urlencoded" | "javascript" | "graphql" | "yaml" | "x-yaml"
                ))
    }

    /// `multipart/*`
    #[must_use]
    pub fn is_multipart(&self) -> bool {
        self.main_type == "multipart"
    }

    /// Whether two types denote the same kind of content.
    ///
    /// Parameters are ignored and every JSON flavour is considered equal.
    #[must_use]
    pub fn is_equivalent_to(&self, other: &Self) -> bool {
        (self.is_json() && other.is_json()) || self.base_type() == other.base_type()
    }

    /// Sniff the type of a body from its leading bytes.
    #[must_use]
    pub fn detect(bytes: &[u8]) -> Self {
        const MAGIC: &[(&[u8], &str, &str)] = &[
            (b"\x89PNG\r\n\x1a\n", "image", "png"),
            (b"\xff\xd8\xff", "image", "jpeg"),
            (b"GIF87a", "image", "gif"),
            (b"GIF89a", "image", "gif"),
            (b"%PDF-", "application", "pdf"),
            (b"PK\x03\x04", "application", "zip"),
            (b"\x1f\x8b", "application", "gzip"),
        ];

        if let Some((_, main, sub)) = MAGIC.iter().find(|(magic, _, _)| bytes.starts_with(magic)) {
            return Self::simple(main, sub);
        }

        match std::str::from_utf8(bytes) {
            Ok(text) => {
                let trimmed = text.trim_start();
                if trimmed.starts_with("<?xml") {
                    Self::simple("application", "xml")
                } else if (trimmed.starts_with('{') || trimmed.starts_with('['))
                    && serde_json::from_str::<serde_json::Value>(text).is_ok()
                {
                    Self::json()
                } else if trimmed.starts_with("<html") || trimmed.starts_with("<!DOCTYPE html") {
                    Self::simple("text", "html")
                } else {
                    Self::text()
                }
            }
            Err(_) => Self::octet_stream(),
        }
    }
}

impl FromStr for ContentType {
    type Err = PactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(';');
        let essence = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let (main_type, rest) = essence
            .split_once('/')
            .ok_or_else(|| PactError::invalid_argument(format!("'{s}' is not a valid content type")))?;
        if main_type.is_empty() || rest.is_empty() || rest.contains(char::is_whitespace) {
            return Err(PactError::invalid_argument(format!(
                "'{s}' is not a valid content type"
            )));
        }
        let (sub_type, suffix) = match rest.rsplit_once('+') {
            Some((sub, suffix)) => (sub.to_string(), Some(suffix.to_string())),
            None => (rest.to_string(), None),
        };

        let attributes = parts
            .filter_map(|param| {
                let (key, value) = param.split_once('=')?;
                Some((
                    key.trim().to_ascii_lowercase(),
                    value.trim().trim_matches('"').to_string(),
                ))
            })
            .collect();

        Ok(Self {
            main_type: main_type.to_string(),
            sub_type,
            suffix,
            attributes,
        })
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_type())?;
        for (key, value) in &self.attributes {
            write!(f, ";{key}={value}")?;
        }
        Ok(())
    }
}

impl Serialize for ContentType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
