//! Interaction bodies.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde_json::{Value, json};

use super::content_type::ContentType;
use crate::error::{PactError, Result};

/// Body of a request, response or message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Body {
    /// No expectation about the body
    #[default]
    Missing,
    /// Body expected to be empty
    Empty,
    /// Body bytes with the type they were declared with
    Present {
        /// Raw content
        content: Bytes,
        /// Declared content type
        content_type: Option<ContentType>,
    },
}

impl Body {
    /// Body from text with a declared content type.
    #[must_use]
    pub fn from_text(text: impl Into<String>, content_type: Option<ContentType>) -> Self {
        Self::Present {
            content: Bytes::from(text.into()),
            content_type,
        }
    }

    /// Body from raw bytes.
    #[must_use]
    pub fn from_bytes(content: impl Into<Bytes>, content_type: Option<ContentType>) -> Self {
        let content = content.into();
        if content.is_empty() {
            Self::Empty
        } else {
            Self::Present {
                content,
                content_type,
            }
        }
    }

    /// Raw bytes, empty for a missing or empty body.
    #[must_use]
    pub fn bytes(&self) -> Bytes {
        match self {
            Self::Present { content, .. } => content.clone(),
            Self::Missing | Self::Empty => Bytes::new(),
        }
    }

    /// Declared content type, if any.
    #[must_use]
    pub const fn content_type(&self) -> Option<&ContentType> {
        match self {
            Self::Present { content_type, .. } => content_type.as_ref(),
            Self::Missing | Self::Empty => None,
        }
    }

    /// Declared content type, falling back to sniffing the content.
    #[must_use]
    pub fn effective_content_type(&self) -> Option<ContentType> {
        match self {
            Self::Present {
                content,
                content_type,
            } => Some(
                content_type
                    .clone()
                    .unwrap_or_else(|| ContentType::detect(content)),
            ),
            Self::Missing | Self::Empty => None,
        }
    }

    /// Body is present and non-empty.
    #[must_use]
    pub const fn is_present(&self) -> bool {
        matches!(self, Self::Present { .. })
    }

    /// Content as UTF-8 text, if it is valid UTF-8.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Present { content, .. } => std::str::from_utf8(content).ok(),
            Self::Missing | Self::Empty => None,
        }
    }

    /// Serialise into the `{content, contentType, encoded}` pact file form.
    #[must_use]
    pub fn to_json(&self) -> Option<Value> {
        match self {
            Self::Missing => None,
            Self::Empty => Some(json!({ "content": "" })),
            Self::Present {
                content,
                content_type,
            } => {
                let ct = self.effective_content_type().unwrap_or_else(ContentType::octet_stream);
                let mut body = serde_json::Map::new();
                let parsed_json = ct
                    .is_json()
                    .then(|| serde_json::from_slice::<Value>(content).ok())
                    .flatten();
                match (parsed_json, std::str::from_utf8(content)) {
                    (Some(value), _) => {
                        body.insert("content".into(), value);
                        body.insert("encoded".into(), Value::Bool(false));
                    }
                    (None, Ok(text)) if ct.is_text() || ct.is_multipart() => {
                        body.insert("content".into(), Value::String(text.to_string()));
                        body.insert("encoded".into(), Value::Bool(false));
                    }
                    _ => {
                        body.insert("content".into(), Value::String(BASE64.encode(content)));
                        body.insert("encoded".into(), Value::String("base64".into()));
                    }
                }
                let declared = content_type.as_ref().unwrap_or(&ct);
                body.insert("contentType".into(), Value::String(declared.to_string()));
                Some(Value::Object(body))
            }
        }
    }

    /// Parse a body from a pact file.
    ///
    /// Accepts the `{content, contentType, encoded}` form as well as a bare
    /// JSON value as written by older specification versions.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when an encoded body is not valid base64.
    pub fn from_json(value: Option<&Value>, header_content_type: Option<&str>) -> Result<Self> {
        let header_ct = header_content_type.and_then(|ct| ct.parse::<ContentType>().ok());
        let Some(value) = value else {
            return Ok(Self::Missing);
        };

        if let Value::Object(map) = value {
            if map.contains_key("content")
                && (map.contains_key("contentType") || map.contains_key("encoded") || map.len() == 1)
            {
                let content_type = map
                    .get("contentType")
                    .and_then(Value::as_str)
                    .and_then(|ct| ct.parse::<ContentType>().ok())
                    .or(header_ct);
                let encoded = match map.get("encoded") {
                    Some(Value::String(enc)) => enc.eq_ignore_ascii_case("base64"),
                    Some(Value::Bool(flag)) => *flag,
                    _ => false,
                };
                let content = match map.get("content") {
                    Some(Value::String(s)) if encoded => BASE64
                        .decode(s)
                        .map_err(|e| PactError::invalid_argument(format!("Invalid base64 body: {e}")))?,
                    Some(Value::String(s)) => s.clone().into_bytes(),
                    Some(Value::Null) | None => Vec::new(),
                    Some(other) => serde_json::to_vec(other)?,
                };
                return Ok(Self::from_bytes(content, content_type));
            }
        }

        Ok(match value {
            Value::Null => Self::Empty,
            Value::String(s) => {
                let is_json = header_ct.as_ref().is_some_and(ContentType::is_json);
                let content = if is_json {
                    serde_json::to_vec(value)?
                } else {
                    s.clone().into_bytes()
                };
                Self::from_bytes(content, header_ct)
            }
            other => Self::from_bytes(
                serde_json::to_vec(other)?,
                header_ct.or_else(|| Some(ContentType::json())),
            ),
        })
    }
}
