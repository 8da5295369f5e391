//! Builder operations for pacts, interactions and messages.
//!
//! Every operation resolves its handle first, refuses to touch a frozen
//! pact, then applies the change. Values for paths, query parameters,
//! headers, metadata and bodies may embed matchers; those are split into
//! an example value and matching rules here, once, at build time.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::error::{PactError, Result};
use crate::model::annotated::{self, Annotated};
use crate::model::interaction::{find_header, set_positional};
use crate::model::{
    AsyncMessage, Body, Category, ContentType, HttpInteraction, InteractionPart, MatchingRule, MatchingRules,
    MessageContents, MultiValues, Pact, PactInteraction, ProviderState, RuleList, SpecificationVersion,
    SyncMessage, multipart,
};
use crate::registry::{InteractionHandle, MessageHandle, PactHandle, Registry};

const MULTIPART_HEADER_PATTERN: &str = r"multipart/form-data;(\s*charset=[^;]*;)?\s*boundary=.*";

/// Either half of an HTTP interaction, borrowed mutably.
struct PartMut<'a> {
    headers: &'a mut MultiValues,
    body: &'a mut Body,
    rules: &'a mut MatchingRules,
}

fn http_mut(pact: &mut Pact, index: usize) -> Result<&mut HttpInteraction> {
    match pact.interactions.get_mut(index) {
        Some(PactInteraction::Http(interaction)) => Ok(interaction),
        _ => Err(PactError::internal("interaction handle does not refer to an HTTP interaction")),
    }
}

fn part_mut(interaction: &mut HttpInteraction, part: InteractionPart) -> PartMut<'_> {
    match part {
        InteractionPart::Request => PartMut {
            headers: &mut interaction.request.headers,
            body: &mut interaction.request.body,
            rules: &mut interaction.request.matching_rules,
        },
        InteractionPart::Response => PartMut {
            headers: &mut interaction.response.headers,
            body: &mut interaction.response.body,
            rules: &mut interaction.response.matching_rules,
        },
    }
}

fn async_mut(pact: &mut Pact, index: usize, id: u32) -> Result<&mut AsyncMessage> {
    match pact.interactions.get_mut(index) {
        Some(PactInteraction::AsyncMessage(message)) => Ok(message),
        _ => Err(PactError::WrongInteractionKind(id, "asynchronous message")),
    }
}

fn sync_mut(pact: &mut Pact, index: usize, id: u32) -> Result<&mut SyncMessage> {
    match pact.interactions.get_mut(index) {
        Some(PactInteraction::SyncMessage(message)) => Ok(message),
        _ => Err(PactError::WrongInteractionKind(id, "synchronous message")),
    }
}

/// Contents a plain message operation writes to: the async contents, or
/// the request of a synchronous message.
fn primary_contents(pact: &mut Pact, index: usize) -> Result<&mut MessageContents> {
    match pact.interactions.get_mut(index) {
        Some(PactInteraction::AsyncMessage(message)) => Ok(&mut message.contents),
        Some(PactInteraction::SyncMessage(message)) => Ok(&mut message.request),
        _ => Err(PactError::internal("message handle does not refer to a message")),
    }
}

/// Parse a JSON value, or keep the text as a string.
fn json_or_string(value: &str) -> Value {
    serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

fn parse_content_type(content_type: Option<&str>) -> Result<Option<ContentType>> {
    content_type
        .map(str::trim)
        .filter(|ct| !ct.is_empty())
        .map(str::parse)
        .transpose()
}

/// Set a content type header unless one was already set.
fn default_content_type_header(headers: &mut MultiValues, content_type: &ContentType) {
    if find_header(headers, "content-type").is_none() {
        headers.insert("Content-Type".to_string(), vec![content_type.to_string()]);
    }
}

/// Store text contents, splitting embedded matchers into body rules.
fn set_text_body(body: &mut Body, rules: &mut MatchingRules, content_type: ContentType, text: &str) -> Result<()> {
    if content_type.is_json() {
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            if annotated::contains_matchers(&value) {
                let (literal, body_rules) = annotated::extract(&value)?;
                *body = Body::from_text(literal.to_string(), Some(content_type));
                rules.set_category(Category::Body, body_rules);
                return Ok(());
            }
        }
    }
    *body = Body::from_bytes(Bytes::copy_from_slice(text.as_bytes()), Some(content_type));
    rules.set_category(Category::Body, Default::default());
    Ok(())
}

fn set_binary_body(body: &mut Body, rules: &mut MatchingRules, content_type: ContentType, bytes: &[u8]) {
    let mut body_rules = std::collections::BTreeMap::new();
    body_rules.insert(
        "$".to_string(),
        RuleList::single(MatchingRule::ContentType(content_type.base_type())),
    );
    *body = Body::from_bytes(Bytes::copy_from_slice(bytes), Some(content_type));
    rules.set_category(Category::Body, body_rules);
}

/// Set one value of a multi-valued parameter or header.
///
/// A JSON array value replaces every value of the name; any other value is
/// written at `index`. Matchers produce rules keyed `name[index]`, so both
/// forms build the same state.
fn set_multi_value(
    values: &mut MultiValues,
    rules: &mut MatchingRules,
    category: Category,
    name: &str,
    index: usize,
    value: &str,
) -> Result<()> {
    let case_insensitive = category == Category::Header;
    if value.trim_start().starts_with('[') {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(value) {
            let parsed = items
                .iter()
                .map(Annotated::<String>::from_value)
                .collect::<Result<Vec<_>>>()?;
            values.retain(|key, _| if case_insensitive { !key.eq_ignore_ascii_case(name) } else { key != name });
            rules.remove(category, name);
            let mut examples = Vec::with_capacity(parsed.len());
            for (i, item) in parsed.into_iter().enumerate() {
                let (example, list) = item.into_parts();
                if let Some(list) = list {
                    rules.add_rules(category, format!("{name}[{i}]"), &list);
                }
                examples.push(example);
            }
            values.insert(name.to_string(), examples);
            return Ok(());
        }
    }

    let (example, list) = Annotated::<String>::parse_str(value)?.into_parts();
    let key = format!("{name}[{index}]");
    rules.remove(category, &key);
    if let Some(list) = list {
        rules.add_rules(category, key, &list);
    }
    set_positional(values, name, index, example, case_insensitive);
    Ok(())
}

fn add_state(states: &mut Vec<ProviderState>, state: ProviderState) {
    states.push(state);
}

/// Add a parameter to the most recent state with this name, or to a new one.
fn add_state_param(states: &mut Vec<ProviderState>, state: &str, name: &str, value: &str) {
    let value = json_or_string(value);
    match states.iter_mut().rev().find(|s| s.name == state) {
        Some(existing) => {
            existing.params.insert(name.to_string(), value);
        }
        None => {
            let mut new_state = ProviderState::new(state);
            new_state.params.insert(name.to_string(), value);
            states.push(new_state);
        }
    }
}

fn state_with_params(state: &str, params: &str) -> Result<ProviderState> {
    let params = match serde_json::from_str::<Value>(params) {
        Ok(Value::Object(map)) => map,
        Ok(Value::Null) => Map::new(),
        Ok(other) => {
            return Err(PactError::invalid_argument(format!(
                "Provider state parameters must be a JSON object, got {other}"
            )));
        }
        Err(e) => {
            return Err(PactError::invalid_argument(format!(
                "Provider state parameters are not valid JSON: {e}"
            )));
        }
    };
    Ok(ProviderState {
        name: state.to_string(),
        params,
    })
}

fn rename(pact: &mut Pact, index: usize, description: &str) -> Result<()> {
    if pact.description_taken(description, Some(index)) {
        return Err(PactError::DuplicateDescription(description.to_string()));
    }
    if let Some(interaction) = pact.interactions.get_mut(index) {
        *interaction.description_mut() = description.to_string();
    }
    Ok(())
}

fn set_message_text(contents: &mut MessageContents, content_type: Option<&str>, text: &str) -> Result<()> {
    let content_type = parse_content_type(content_type)?.unwrap_or_else(ContentType::text);
    contents
        .metadata
        .insert("contentType".to_string(), Value::String(content_type.to_string()));
    set_text_body(&mut contents.contents, &mut contents.matching_rules, content_type, text)
}

/// The first `len` bytes of `bytes`, with their content type.
fn binary_slice<'a>(content_type: Option<&str>, bytes: &'a [u8], len: usize) -> Result<(ContentType, &'a [u8])> {
    let data = bytes.get(..len).ok_or_else(|| {
        PactError::invalid_argument(format!("Length {len} exceeds the {} byte buffer", bytes.len()))
    })?;
    let content_type = parse_content_type(content_type)?.unwrap_or_else(|| ContentType::detect(data));
    Ok((content_type, data))
}

fn set_message_binary(contents: &mut MessageContents, content_type: ContentType, data: &[u8]) {
    contents
        .metadata
        .insert("contentType".to_string(), Value::String(content_type.to_string()));
    set_binary_body(&mut contents.contents, &mut contents.matching_rules, content_type, data);
}

/// Render message contents as they would be delivered: JSON embedded,
/// text as a string, anything else base64.
fn reified_contents(contents: &MessageContents) -> Value {
    match &contents.contents {
        Body::Missing | Body::Empty => Value::Null,
        Body::Present { content, .. } => {
            let content_type = crate::matching::message_content_type(contents);
            if content_type.as_ref().is_some_and(ContentType::is_json) {
                if let Ok(value) = serde_json::from_slice::<Value>(content) {
                    return value;
                }
            }
            match std::str::from_utf8(content) {
                Ok(text) => Value::String(text.to_string()),
                Err(_) => Value::String(BASE64.encode(content)),
            }
        }
    }
}

impl Registry {
    /// Create a pact between a consumer and a provider.
    pub fn new_pact(&self, consumer: &str, provider: &str) -> PactHandle {
        self.create_pact(Pact::new(consumer, provider))
    }

    /// Destroy a pact and every handle derived from it.
    ///
    /// Returns `false` when the handle was not live.
    pub fn free_pact_handle(&self, pact: PactHandle) -> bool {
        self.destroy_pact(pact)
    }

    /// Add an HTTP interaction.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen` or `DuplicateDescription`.
    pub fn new_interaction(&self, pact: PactHandle, description: &str) -> Result<InteractionHandle> {
        let id = self.add_interaction(pact, PactInteraction::Http(HttpInteraction::new(description)))?;
        debug!(pact = pact.id(), interaction = id, description, "Interaction added");
        Ok(InteractionHandle::new(id))
    }

    /// Set the interaction description.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen` or `DuplicateDescription`.
    pub fn upon_receiving(&self, interaction: InteractionHandle, description: &str) -> Result<()> {
        self.update_interaction(interaction, |pact, index| rename(pact, index, description))
    }

    /// Add a provider state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` or `Frozen`.
    pub fn given(&self, interaction: InteractionHandle, state: &str) -> Result<()> {
        self.update_interaction(interaction, |pact, index| {
            add_state(&mut http_mut(pact, index)?.provider_states, ProviderState::new(state));
            Ok(())
        })
    }

    /// Add a parameter to a provider state, creating the state if needed.
    ///
    /// The value is stored as JSON when it parses as JSON, else as a string.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` or `Frozen`.
    pub fn given_with_param(&self, interaction: InteractionHandle, state: &str, name: &str, value: &str) -> Result<()> {
        self.update_interaction(interaction, |pact, index| {
            add_state_param(&mut http_mut(pact, index)?.provider_states, state, name, value);
            Ok(())
        })
    }

    /// Add a provider state with a JSON object of parameters.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, or `InvalidArgument` when the
    /// parameters are not a JSON object.
    pub fn given_with_params(&self, interaction: InteractionHandle, state: &str, params: &str) -> Result<()> {
        let state = state_with_params(state, params)?;
        self.update_interaction(interaction, |pact, index| {
            add_state(&mut http_mut(pact, index)?.provider_states, state);
            Ok(())
        })
    }

    /// Set the request method and path. The path may be a matcher.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, or `InvalidArgument` for a
    /// malformed path matcher.
    pub fn with_request(&self, interaction: InteractionHandle, method: &str, path: &str) -> Result<()> {
        let (example, rules) = Annotated::<String>::parse_str(path)?.into_parts();
        self.update_interaction(interaction, |pact, index| {
            let request = &mut http_mut(pact, index)?.request;
            request.method = method.to_uppercase();
            request.path = example;
            request.matching_rules.remove(Category::Path, "");
            if let Some(rules) = rules {
                request.matching_rules.add_rules(Category::Path, "", &rules);
            }
            Ok(())
        })
    }

    /// Set a query parameter value at a position.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, or `InvalidArgument` for a
    /// malformed matcher.
    pub fn with_query_parameter(&self, interaction: InteractionHandle, name: &str, index: usize, value: &str) -> Result<()> {
        self.update_interaction(interaction, |pact, i| {
            let request = &mut http_mut(pact, i)?.request;
            set_multi_value(&mut request.query, &mut request.matching_rules, Category::Query, name, index, value)
        })
    }

    /// Set a header value at a position.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, or `InvalidArgument` for a
    /// malformed matcher.
    pub fn with_header(
        &self,
        interaction: InteractionHandle,
        part: InteractionPart,
        name: &str,
        index: usize,
        value: &str,
    ) -> Result<()> {
        self.update_interaction(interaction, |pact, i| {
            let target = part_mut(http_mut(pact, i)?, part);
            set_multi_value(target.headers, target.rules, Category::Header, name, index, value)
        })
    }

    /// Set a text body.
    ///
    /// Without a content type the body is treated as JSON when it parses
    /// as JSON and as plain text otherwise.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, or `InvalidArgument` for a bad
    /// content type or malformed matcher.
    pub fn with_body(
        &self,
        interaction: InteractionHandle,
        part: InteractionPart,
        content_type: Option<&str>,
        body: &str,
    ) -> Result<()> {
        let content_type = parse_content_type(content_type)?.unwrap_or_else(|| {
            if serde_json::from_str::<Value>(body).is_ok() {
                ContentType::json()
            } else {
                ContentType::text()
            }
        });
        self.update_interaction(interaction, |pact, i| {
            let target = part_mut(http_mut(pact, i)?, part);
            default_content_type_header(target.headers, &content_type);
            set_text_body(target.body, target.rules, content_type, body)
        })
    }

    /// Set a binary body, matched by content type.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, or `InvalidArgument` for a bad
    /// content type.
    pub fn with_binary_file(
        &self,
        interaction: InteractionHandle,
        part: InteractionPart,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<()> {
        let content_type = parse_content_type(content_type)?.unwrap_or_else(|| ContentType::detect(bytes));
        self.update_interaction(interaction, |pact, i| {
            let target = part_mut(http_mut(pact, i)?, part);
            default_content_type_header(target.headers, &content_type);
            set_binary_body(target.body, target.rules, content_type, bytes);
            Ok(())
        })
    }

    /// Set a `multipart/form-data` body holding one file.
    ///
    /// The boundary is random, so the content type header is matched by a
    /// regex and the part by its content type.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, `InvalidArgument`, or `Io` when the
    /// file cannot be read.
    pub fn with_multipart_file(
        &self,
        interaction: InteractionHandle,
        part: InteractionPart,
        content_type: &str,
        file: &Path,
        part_name: &str,
    ) -> Result<()> {
        let part_type: ContentType = content_type.parse()?;
        let contents = std::fs::read(file)?;
        let boundary = uuid::Uuid::new_v4().simple().to_string();
        let body = multipart::build(
            &multipart::Part {
                name: part_name.to_string(),
                filename: file.file_name().map(|f| f.to_string_lossy().into_owned()),
                content_type: Some(part_type.clone()),
                body: Bytes::from(contents),
            },
            &boundary,
        );
        let header = format!("multipart/form-data; boundary={boundary}");
        let body_type: ContentType = header.parse()?;

        self.update_interaction(interaction, |pact, i| {
            let target = part_mut(http_mut(pact, i)?, part);
            target.headers.retain(|key, _| !key.eq_ignore_ascii_case("content-type"));
            target.headers.insert("Content-Type".to_string(), vec![header.clone()]);
            target.rules.remove(Category::Header, "Content-Type");
            target.rules.add_rule(
                Category::Header,
                "Content-Type",
                MatchingRule::Regex(MULTIPART_HEADER_PATTERN.to_string()),
            );
            *target.body = Body::from_bytes(body, Some(body_type));
            let mut body_rules = std::collections::BTreeMap::new();
            body_rules.insert(
                crate::model::DocPath::root().join(part_name).to_string(),
                RuleList::single(MatchingRule::ContentType(part_type.base_type())),
            );
            target.rules.set_category(Category::Body, body_rules);
            Ok(())
        })
    }

    /// Set the response status.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` or `Frozen`.
    pub fn response_status(&self, interaction: InteractionHandle, status: u16) -> Result<()> {
        self.update_interaction(interaction, |pact, index| {
            let response = &mut http_mut(pact, index)?.response;
            response.status = status;
            response.matching_rules.remove(Category::Status, "");
            Ok(())
        })
    }

    /// Set the response status from a number or a status matcher.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, or `InvalidArgument` when the
    /// value is neither a status code nor a matcher with an example code.
    pub fn response_status_v2(&self, interaction: InteractionHandle, status: &str) -> Result<()> {
        let (example, rules) = Annotated::<String>::parse_str(status)?.into_parts();
        let code = example
            .trim()
            .parse::<u16>()
            .map_err(|_| PactError::invalid_argument(format!("'{status}' is not a valid status")))?;
        self.update_interaction(interaction, |pact, index| {
            let response = &mut http_mut(pact, index)?.response;
            response.status = code;
            response.matching_rules.remove(Category::Status, "");
            if let Some(rules) = rules {
                response.matching_rules.add_rules(Category::Status, "", &rules);
            }
            Ok(())
        })
    }

    /// Set the specification version from its code (0 = Unknown .. 5 = V4).
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, or `InvalidArgument` for an
    /// unknown code.
    pub fn with_specification(&self, pact: PactHandle, version: i32) -> Result<()> {
        let version = SpecificationVersion::from_code(version)?;
        self.update_pact(pact, |p| {
            p.specification = version;
            Ok(())
        })
    }

    /// Add a metadata value under a namespace.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` or `Frozen`.
    pub fn with_pact_metadata(&self, pact: PactHandle, namespace: &str, name: &str, value: &str) -> Result<()> {
        self.update_pact(pact, |p| {
            p.metadata
                .entry(namespace.to_string())
                .or_default()
                .insert(name.to_string(), json_or_string(value));
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Add an asynchronous message.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen` or `DuplicateDescription`.
    pub fn new_async_message(&self, pact: PactHandle, description: &str) -> Result<MessageHandle> {
        let message = AsyncMessage {
            description: description.to_string(),
            ..AsyncMessage::default()
        };
        let id = self.add_interaction(pact, PactInteraction::AsyncMessage(message))?;
        debug!(pact = pact.id(), message = id, description, "Asynchronous message added");
        Ok(MessageHandle::new(id))
    }

    /// Add a synchronous request/response message.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen` or `DuplicateDescription`.
    pub fn new_sync_message_interaction(&self, pact: PactHandle, description: &str) -> Result<MessageHandle> {
        let message = SyncMessage {
            description: description.to_string(),
            ..SyncMessage::default()
        };
        let id = self.add_interaction(pact, PactInteraction::SyncMessage(message))?;
        debug!(pact = pact.id(), message = id, description, "Synchronous message added");
        Ok(MessageHandle::new(id))
    }

    /// Add a provider state to a message.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` or `Frozen`.
    pub fn message_given(&self, message: MessageHandle, state: &str) -> Result<()> {
        self.update_message(message, |pact, index| {
            if let Some(interaction) = pact.interactions.get_mut(index) {
                add_state(interaction.provider_states_mut(), ProviderState::new(state));
            }
            Ok(())
        })
    }

    /// Add a provider state parameter to a message.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` or `Frozen`.
    pub fn message_given_with_param(&self, message: MessageHandle, state: &str, name: &str, value: &str) -> Result<()> {
        self.update_message(message, |pact, index| {
            if let Some(interaction) = pact.interactions.get_mut(index) {
                add_state_param(interaction.provider_states_mut(), state, name, value);
            }
            Ok(())
        })
    }

    /// Add a provider state with a JSON object of parameters to a message.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, or `InvalidArgument` when the
    /// parameters are not a JSON object.
    pub fn message_given_with_params(&self, message: MessageHandle, state: &str, params: &str) -> Result<()> {
        let state = state_with_params(state, params)?;
        self.update_message(message, |pact, index| {
            if let Some(interaction) = pact.interactions.get_mut(index) {
                add_state(interaction.provider_states_mut(), state);
            }
            Ok(())
        })
    }

    /// Set the message description.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen` or `DuplicateDescription`.
    pub fn message_expects_to_receive(&self, message: MessageHandle, description: &str) -> Result<()> {
        self.update_message(message, |pact, index| rename(pact, index, description))
    }

    /// Set the message contents (the request of a synchronous message).
    ///
    /// The content type defaults to `text/plain`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, or `InvalidArgument` for a bad
    /// content type or matcher.
    pub fn message_with_contents(&self, message: MessageHandle, content_type: Option<&str>, body: &str) -> Result<()> {
        self.update_message(message, |pact, index| {
            set_message_text(primary_contents(pact, index)?, content_type, body)
        })
    }

    /// Set binary message contents from the first `len` bytes of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, or `InvalidArgument` when `len`
    /// exceeds the buffer or the content type is invalid.
    pub fn message_with_binary_contents(
        &self,
        message: MessageHandle,
        content_type: Option<&str>,
        bytes: &[u8],
        len: usize,
    ) -> Result<()> {
        let (content_type, data) = binary_slice(content_type, bytes, len)?;
        self.update_message(message, |pact, index| {
            set_message_binary(primary_contents(pact, index)?, content_type, data);
            Ok(())
        })
    }

    /// Set a metadata value. The value may be a matcher.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, or `InvalidArgument` for a
    /// malformed matcher.
    pub fn message_with_metadata(&self, message: MessageHandle, key: &str, value: &str) -> Result<()> {
        let parsed = match serde_json::from_str::<Value>(value) {
            Ok(json @ Value::Object(_)) => Annotated::<Value>::parse(&json)?,
            _ => Annotated::Literal(Value::String(value.to_string())),
        };
        let (example, rules) = parsed.into_parts();
        self.update_message(message, |pact, index| {
            let contents = primary_contents(pact, index)?;
            contents.metadata.insert(key.to_string(), example);
            contents.matching_rules.remove(Category::Metadata, key);
            if let Some(rules) = rules {
                contents.matching_rules.add_rules(Category::Metadata, key, &rules);
            }
            Ok(())
        })
    }

    /// Set the contents of the response at `index` of a synchronous message.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, `WrongInteractionKind`, or
    /// `InvalidArgument` for a bad content type or matcher.
    pub fn sync_message_set_response_contents(
        &self,
        message: MessageHandle,
        index: usize,
        content_type: Option<&str>,
        body: &str,
    ) -> Result<()> {
        self.update_message(message, |pact, i| {
            let sync = sync_mut(pact, i, message.id())?;
            set_message_text(sync.response_mut(index), content_type, body)
        })
    }

    /// Set binary request contents of a synchronous message from the first
    /// `len` bytes of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, `WrongInteractionKind`, or
    /// `InvalidArgument` when `len` exceeds the buffer or the content type
    /// is invalid.
    pub fn sync_message_set_request_contents_bin(
        &self,
        message: MessageHandle,
        content_type: Option<&str>,
        bytes: &[u8],
        len: usize,
    ) -> Result<()> {
        let (content_type, data) = binary_slice(content_type, bytes, len)?;
        self.update_message(message, |pact, i| {
            let sync = sync_mut(pact, i, message.id())?;
            set_message_binary(&mut sync.request, content_type, data);
            Ok(())
        })
    }

    /// Set binary contents of the response at `index` of a synchronous
    /// message from the first `len` bytes of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, `WrongInteractionKind`, or
    /// `InvalidArgument` when `len` exceeds the buffer or the content type
    /// is invalid.
    pub fn sync_message_set_response_contents_bin(
        &self,
        message: MessageHandle,
        index: usize,
        content_type: Option<&str>,
        bytes: &[u8],
        len: usize,
    ) -> Result<()> {
        let (content_type, data) = binary_slice(content_type, bytes, len)?;
        self.update_message(message, |pact, i| {
            let sync = sync_mut(pact, i, message.id())?;
            set_message_binary(sync.response_mut(index), content_type, data);
            Ok(())
        })
    }

    /// Message as it would be delivered: contents without matchers, as JSON.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the handle does not resolve.
    pub fn message_reify(&self, message: MessageHandle) -> Result<String> {
        self.read_message(message, |pact, index| {
            let Some(interaction) = pact.interactions.get(index) else {
                return Value::Null;
            };
            let mut doc = Map::new();
            doc.insert("description".into(), json!(interaction.description()));
            if !interaction.provider_states().is_empty() {
                doc.insert("providerStates".into(), json!(interaction.provider_states()));
            }
            match interaction {
                PactInteraction::AsyncMessage(m) => {
                    doc.insert("contents".into(), reified_contents(&m.contents));
                    doc.insert("metadata".into(), json!(m.contents.metadata));
                }
                PactInteraction::SyncMessage(m) => {
                    doc.insert(
                        "request".into(),
                        json!({ "contents": reified_contents(&m.request), "metadata": m.request.metadata }),
                    );
                    doc.insert(
                        "response".into(),
                        Value::Array(
                            m.responses
                                .iter()
                                .map(|r| json!({ "contents": reified_contents(r), "metadata": r.metadata }))
                                .collect(),
                        ),
                    );
                }
                PactInteraction::Http(_) => {}
            }
            Value::Object(doc)
        })
        .map(|doc| doc.to_string())
    }

    /// Contents of an asynchronous message.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` or `WrongInteractionKind`.
    pub fn async_message_contents(&self, message: MessageHandle) -> Result<MessageContents> {
        self.read_message(message, |pact, index| match pact.interactions.get(index) {
            Some(PactInteraction::AsyncMessage(m)) => Ok(m.contents.clone()),
            _ => Err(PactError::WrongInteractionKind(message.id(), "asynchronous message")),
        })?
    }

    /// Request contents of a synchronous message.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` or `WrongInteractionKind`.
    pub fn sync_message_request_contents(&self, message: MessageHandle) -> Result<MessageContents> {
        self.read_message(message, |pact, index| match pact.interactions.get(index) {
            Some(PactInteraction::SyncMessage(m)) => Ok(m.request.clone()),
            _ => Err(PactError::WrongInteractionKind(message.id(), "synchronous message")),
        })?
    }

    /// Response contents at `index` of a synchronous message.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `WrongInteractionKind`, or `InvalidArgument`
    /// when there is no response at `index`.
    pub fn sync_message_response_contents(&self, message: MessageHandle, index: usize) -> Result<MessageContents> {
        self.read_message(message, |pact, i| match pact.interactions.get(i) {
            Some(PactInteraction::SyncMessage(m)) => m
                .responses
                .get(index)
                .cloned()
                .ok_or_else(|| PactError::invalid_argument(format!("No response at index {index}"))),
            _ => Err(PactError::WrongInteractionKind(message.id(), "synchronous message")),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Registry, PactHandle, InteractionHandle) {
        let registry = Registry::new();
        let pact = registry.new_pact("C", "P");
        let interaction = registry.new_interaction(pact, "a request").unwrap();
        (registry, pact, interaction)
    }

    fn http(registry: &Registry, interaction: InteractionHandle) -> HttpInteraction {
        registry
            .read_interaction(interaction, |pact, index| pact.interactions[index].as_http().cloned())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_query_index_and_array_forms_agree() {
        let (registry, _, by_index) = setup();
        registry.with_query_parameter(by_index, "id", 0, "1").unwrap();
        registry
            .with_query_parameter(by_index, "id", 1, r#"{"pact:matcher:type":"regex","regex":"\\d+","value":"2"}"#)
            .unwrap();

        let pact = registry.new_pact("C", "P2");
        let by_array = registry.new_interaction(pact, "a request").unwrap();
        registry
            .with_query_parameter(
                by_array,
                "id",
                0,
                r#"["1", {"pact:matcher:type":"regex","regex":"\\d+","value":"2"}]"#,
            )
            .unwrap();

        let a = http(&registry, by_index).request;
        let b = http(&registry, by_array).request;
        assert_eq!(a.query, b.query);
        assert_eq!(a.matching_rules, b.matching_rules);
        assert_eq!(a.query["id"], vec!["1", "2"]);
    }

    #[test]
    fn test_body_sets_content_type_header_once() {
        let (registry, _, interaction) = setup();
        registry
            .with_header(interaction, InteractionPart::Request, "content-type", 0, "application/vnd.x+json")
            .unwrap();
        registry
            .with_body(interaction, InteractionPart::Request, Some("application/json"), "{}")
            .unwrap();
        registry
            .with_body(interaction, InteractionPart::Response, Some("application/json"), "{\"ok\":true}")
            .unwrap();
        let i = http(&registry, interaction);
        assert_eq!(i.request.headers["content-type"], vec!["application/vnd.x+json"]);
        assert_eq!(i.response.headers["Content-Type"], vec!["application/json"]);
    }

    #[test]
    fn test_body_matchers_are_extracted() {
        let (registry, _, interaction) = setup();
        registry
            .with_body(
                interaction,
                InteractionPart::Response,
                Some("application/json"),
                r#"{"id": {"pact:matcher:type": "integer", "value": 10}}"#,
            )
            .unwrap();
        let response = http(&registry, interaction).response;
        assert_eq!(response.body.as_text(), Some("{\"id\":10}"));
        assert!(response.matching_rules.category(Category::Body).unwrap().contains_key("$.id"));
    }

    #[test]
    fn test_plain_json_body_kept_verbatim() {
        let (registry, _, interaction) = setup();
        let text = "{ \"b\": 1,   \"a\": 2 }";
        registry
            .with_body(interaction, InteractionPart::Request, None, text)
            .unwrap();
        assert_eq!(http(&registry, interaction).request.body.as_text(), Some(text));
    }

    #[test]
    fn test_path_matcher() {
        let (registry, _, interaction) = setup();
        registry
            .with_request(
                interaction,
                "get",
                r#"{"pact:matcher:type":"regex","regex":"^/items/\\d+$","value":"/items/1"}"#,
            )
            .unwrap();
        let request = http(&registry, interaction).request;
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/items/1");
        assert!(request.matching_rules.single(Category::Path).is_some());
    }

    #[test]
    fn test_upon_receiving_uniqueness() {
        let (registry, pact, interaction) = setup();
        let other = registry.new_interaction(pact, "other").unwrap();
        assert!(registry.upon_receiving(interaction, "a request").is_ok());
        assert!(matches!(
            registry.upon_receiving(other, "a request"),
            Err(PactError::DuplicateDescription(_))
        ));
    }

    #[test]
    fn test_given_with_param_accumulates() {
        let (registry, _, interaction) = setup();
        registry.given_with_param(interaction, "user exists", "id", "7").unwrap();
        registry.given_with_param(interaction, "user exists", "name", "bob").unwrap();
        let states = http(&registry, interaction).provider_states;
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].params["id"], json!(7));
        assert_eq!(states[0].params["name"], json!("bob"));
        assert!(registry.given_with_params(interaction, "x", "[1]").is_err());
    }

    #[test]
    fn test_specification_codes() {
        let (registry, pact, _) = setup();
        registry.with_specification(pact, 5).unwrap();
        assert_eq!(registry.pact(pact).unwrap().specification, SpecificationVersion::V4);
        assert!(matches!(
            registry.with_specification(pact, 9),
            Err(PactError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_frozen_pact_rejects_builders() {
        let (registry, pact, interaction) = setup();
        registry.freeze(pact).unwrap();
        assert!(registry.given(interaction, "x").unwrap_err().is_frozen());
        assert!(registry.with_pact_metadata(pact, "ns", "k", "v").unwrap_err().is_frozen());
    }

    #[test]
    fn test_multipart_file() {
        let (registry, _, interaction) = setup();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("note.txt");
        std::fs::write(&file, "hello").unwrap();
        registry
            .with_multipart_file(interaction, InteractionPart::Request, "text/plain", &file, "upload")
            .unwrap();
        let request = http(&registry, interaction).request;
        let content_type = request.content_type().unwrap();
        assert!(content_type.is_multipart());
        let boundary = content_type.attribute("boundary").unwrap();
        let parts = multipart::parse(&request.body.bytes(), boundary).unwrap();
        assert_eq!(parts[0].name, "upload");
        assert_eq!(parts[0].filename.as_deref(), Some("note.txt"));
        assert!(request.matching_rules.category(Category::Body).unwrap().contains_key("$.upload"));
    }

    #[test]
    fn test_message_contents_and_reify() {
        let registry = Registry::new();
        let pact = registry.new_pact("C", "P");
        let message = registry.new_async_message(pact, "an event").unwrap();
        registry
            .message_with_contents(
                message,
                Some("application/json"),
                r#"{"id": {"pact:matcher:type": "type", "value": 1}}"#,
            )
            .unwrap();
        registry.message_with_metadata(message, "topic", "orders").unwrap();
        let reified: Value = serde_json::from_str(&registry.message_reify(message).unwrap()).unwrap();
        assert_eq!(reified["contents"], json!({"id": 1}));
        assert_eq!(reified["metadata"]["topic"], json!("orders"));

        let text = registry.new_async_message(pact, "text").unwrap();
        registry.message_with_contents(text, None, "hi").unwrap();
        let contents = registry.async_message_contents(text).unwrap();
        assert_eq!(contents.metadata["contentType"], json!("text/plain"));
    }

    #[test]
    fn test_binary_message_length_checked() {
        let registry = Registry::new();
        let pact = registry.new_pact("C", "P");
        let message = registry.new_async_message(pact, "bin").unwrap();
        assert!(registry.message_with_binary_contents(message, None, &[1, 2], 3).is_err());
        registry
            .message_with_binary_contents(message, Some("application/octet-stream"), &[1, 2, 3], 2)
            .unwrap();
        assert_eq!(&registry.async_message_contents(message).unwrap().contents.bytes()[..], &[1, 2]);
    }

    #[test]
    fn test_sync_message_responses() {
        let registry = Registry::new();
        let pact = registry.new_pact("C", "P");
        let message = registry.new_sync_message_interaction(pact, "rpc").unwrap();
        registry.message_with_contents(message, None, "ping").unwrap();
        registry
            .sync_message_set_response_contents(message, 1, Some("text/plain"), "pong")
            .unwrap();
        assert_eq!(
            registry.sync_message_request_contents(message).unwrap().contents.as_text(),
            Some("ping")
        );
        assert_eq!(
            registry.sync_message_response_contents(message, 1).unwrap().contents.as_text(),
            Some("pong")
        );
        assert!(registry.async_message_contents(message).is_err());
    }

    #[test]
    fn test_literal_json_message_keeps_key_order() {
        let registry = Registry::new();
        let pact = registry.new_pact("C", "P");
        let message = registry.new_async_message(pact, "an event").unwrap();
        registry
            .message_with_contents(message, Some("application/json"), r#"{"b":1,"a":2}"#)
            .unwrap();
        let reified: Value = serde_json::from_str(&registry.message_reify(message).unwrap()).unwrap();
        assert_eq!(reified["contents"].to_string(), r#"{"b":1,"a":2}"#);
    }

    #[test]
    fn test_message_content_type_follows_latest_contents() {
        let registry = Registry::new();
        let pact = registry.new_pact("C", "P");
        let message = registry.new_async_message(pact, "an event").unwrap();
        registry.message_with_contents(message, Some("text/plain"), "x").unwrap();
        registry
            .message_with_contents(message, Some("application/json"), r#"{"a":1}"#)
            .unwrap();
        let contents = registry.async_message_contents(message).unwrap();
        assert_eq!(contents.metadata["contentType"], json!("application/json"));
        let reified: Value = serde_json::from_str(&registry.message_reify(message).unwrap()).unwrap();
        assert_eq!(reified["contents"], json!({"a": 1}));

        registry
            .message_with_binary_contents(message, Some("application/octet-stream"), &[9], 1)
            .unwrap();
        registry.message_with_contents(message, None, "back to text").unwrap();
        let contents = registry.async_message_contents(message).unwrap();
        assert_eq!(contents.metadata["contentType"], json!("text/plain"));
    }

    #[test]
    fn test_message_given_with_params() {
        let registry = Registry::new();
        let pact = registry.new_pact("C", "P");
        let message = registry.new_async_message(pact, "an event").unwrap();
        registry
            .message_given_with_params(message, "a user exists", r#"{"id":1}"#)
            .unwrap();
        assert!(matches!(
            registry.message_given_with_params(message, "bad", "[1]"),
            Err(PactError::InvalidArgument(_))
        ));
        let reified: Value = serde_json::from_str(&registry.message_reify(message).unwrap()).unwrap();
        assert_eq!(
            reified["providerStates"],
            json!([{"name": "a user exists", "params": {"id": 1}}])
        );
    }

    #[test]
    fn test_sync_message_binary_contents() {
        let registry = Registry::new();
        let pact = registry.new_pact("C", "P");
        let message = registry.new_sync_message_interaction(pact, "rpc").unwrap();
        registry
            .sync_message_set_request_contents_bin(message, Some("application/octet-stream"), &[1, 2, 3], 3)
            .unwrap();
        registry
            .sync_message_set_response_contents_bin(message, 0, Some("application/octet-stream"), &[4, 5, 6], 2)
            .unwrap();
        assert!(
            registry
                .sync_message_set_response_contents_bin(message, 0, None, &[1], 2)
                .is_err()
        );

        let request = registry.sync_message_request_contents(message).unwrap();
        assert_eq!(&request.contents.bytes()[..], &[1, 2, 3]);
        let response = registry.sync_message_response_contents(message, 0).unwrap();
        assert_eq!(&response.contents.bytes()[..], &[4, 5]);
        assert_eq!(response.metadata["contentType"], json!("application/octet-stream"));
        assert!(response.matching_rules.category(Category::Body).unwrap().contains_key("$"));

        let event = registry.new_async_message(pact, "an event").unwrap();
        assert!(matches!(
            registry.sync_message_set_request_contents_bin(event, None, &[1], 1),
            Err(PactError::WrongInteractionKind(..))
        ));
    }
}
