//! Reading, merging and writing pact files.
//!
//! Files are written in the V4 layout, with the pact's own specification
//! version recorded in the metadata. Older layouts (V2 and V3, including
//! the V3 `messages` array) are accepted when reading.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{
    AsyncMessage, Body, HttpInteraction, HttpRequest, HttpResponse, MatchingRules, MessageContents, MultiValues,
    Pact, PactInteraction, PluginDependency, ProviderState, SpecificationVersion, SyncMessage,
};

/// Serialises read-merge-write cycles within the process.
static WRITE_LOCK: Mutex<()> = Mutex::new(());

const SPECIFICATION_KEYS: [&str; 2] = ["pactSpecification", "pact-specification"];
const ENGINE_KEY: &str = "pactEngine";

/// Errors raised while persisting pacts.
#[derive(Error, Debug)]
pub enum PactFileError {
    /// File system failure
    #[error("Pact file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid JSON
    #[error("Pact file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// File is JSON but not a pact
    #[error("Invalid pact file: {0}")]
    Invalid(String),

    /// Existing file belongs to a different consumer/provider pair
    #[error("Existing pact file is for {found}, cannot merge {expected}")]
    Conflict {
        /// Participants of the pact being written
        expected: String,
        /// Participants recorded in the existing file
        found: String,
    },
}

impl PactFileError {
    fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

type Result<T> = std::result::Result<T, PactFileError>;

/// Where pact files are kept.
pub trait PactStorage: Send + Sync {
    /// Contents of a file, or `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read.
    fn read(&self, name: &str) -> Result<Option<String>>;

    /// Replace a file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be written.
    fn write(&self, name: &str, contents: &str) -> Result<()>;

    /// Human readable location of a file, used in logs.
    fn location(&self, name: &str) -> String;
}

/// Pact files in a directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    dir: PathBuf,
}

impl FsStorage {
    /// Storage rooted at a directory, created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl PactStorage for FsStorage {
    fn read(&self, name: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.dir.join(name)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, name: &str, contents: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.dir.join(name), contents)?;
        Ok(())
    }

    fn location(&self, name: &str) -> String {
        self.dir.join(name).display().to_string()
    }
}

/// File name of a pact: `<consumer>-<provider>.json`.
#[must_use]
pub fn file_name(pact: &Pact) -> String {
    format!("{}-{}.json", pact.consumer, pact.provider)
}

/// Write a pact, merging with an existing file unless `overwrite` is set.
///
/// Returns the location written to.
///
/// # Errors
///
/// Fails when the existing file cannot be parsed, belongs to other
/// participants, or the storage rejects the write.
pub fn write_pact(pact: &Pact, storage: &dyn PactStorage, overwrite: bool) -> Result<String> {
    let name = file_name(pact);
    let _guard = WRITE_LOCK.lock();

    let to_write = match storage.read(&name)? {
        Some(existing) if !overwrite => {
            let existing = parse_pact(&serde_json::from_str(&existing)?)?;
            debug!(file = %name, "Merging with existing pact file");
            merge(existing, pact)?
        }
        _ => pact.clone(),
    };

    let contents = serde_json::to_string_pretty(&to_json(&to_write))?;
    storage.write(&name, &contents)?;
    let location = storage.location(&name);
    info!(
        file = %location,
        interactions = to_write.interactions.len(),
        "Pact file written"
    );
    Ok(location)
}

/// Merge a pact into a previously written one.
///
/// Interactions are keyed by description and provider states: matching
/// ones are replaced in place, new ones appended. Merging the same pact
/// twice yields the same result.
///
/// # Errors
///
/// Returns `Conflict` when the participants differ.
pub fn merge(mut existing: Pact, pact: &Pact) -> Result<Pact> {
    if existing.consumer != pact.consumer || existing.provider != pact.provider {
        return Err(PactFileError::Conflict {
            expected: pact.label(),
            found: existing.label(),
        });
    }

    for interaction in &pact.interactions {
        let key = interaction.merge_key();
        match existing.interactions.iter_mut().find(|i| i.merge_key() == key) {
            Some(slot) => *slot = interaction.clone(),
            None => existing.interactions.push(interaction.clone()),
        }
    }
    for (namespace, values) in &pact.metadata {
        existing
            .metadata
            .entry(namespace.clone())
            .or_default()
            .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    for plugin in &pact.plugins {
        existing.add_plugin(&plugin.name, plugin.version.as_deref());
    }
    existing.specification = existing.specification.max(pact.specification);
    Ok(existing)
}

/// Load a pact file from disk.
///
/// # Errors
///
/// Fails when the file cannot be read or is not a pact.
pub fn read_pact(path: &Path) -> Result<Pact> {
    let contents = fs::read_to_string(path)?;
    parse_pact(&serde_json::from_str(&contents)?)
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// V4 JSON document of a pact.
#[must_use]
pub fn to_json(pact: &Pact) -> Value {
    let mut metadata = Map::new();
    for (namespace, values) in &pact.metadata {
        metadata.insert(
            namespace.clone(),
            Value::Object(values.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        );
    }
    metadata.insert(
        SPECIFICATION_KEYS[0].to_string(),
        json!({ "version": written_version(pact.specification).version_str() }),
    );
    metadata.insert(ENGINE_KEY.to_string(), json!({ "version": env!("CARGO_PKG_VERSION") }));

    let mut doc = Map::new();
    doc.insert("consumer".into(), json!({ "name": pact.consumer }));
    doc.insert("provider".into(), json!({ "name": pact.provider }));
    doc.insert(
        "interactions".into(),
        Value::Array(pact.interactions.iter().map(interaction_to_json).collect()),
    );
    doc.insert("metadata".into(), Value::Object(metadata));
    if !pact.plugins.is_empty() {
        doc.insert("plugins".into(), json!(pact.plugins));
    }
    Value::Object(doc)
}

const fn written_version(version: SpecificationVersion) -> SpecificationVersion {
    match version {
        SpecificationVersion::Unknown => SpecificationVersion::V4,
        other => other,
    }
}

fn interaction_to_json(interaction: &PactInteraction) -> Value {
    let mut map = Map::new();
    map.insert("type".into(), json!(interaction.type_name()));
    map.insert("description".into(), json!(interaction.description()));
    if !interaction.provider_states().is_empty() {
        map.insert("providerStates".into(), json!(interaction.provider_states()));
    }

    let plugin_config = match interaction {
        PactInteraction::Http(http) => {
            map.insert("request".into(), request_to_json(&http.request));
            map.insert("response".into(), response_to_json(&http.response));
            if let Some(transport) = &http.transport {
                map.insert("transport".into(), json!(transport));
            }
            if http.pending {
                map.insert("pending".into(), Value::Bool(true));
            }
            &http.plugin_config
        }
        PactInteraction::AsyncMessage(message) => {
            insert_contents(&mut map, &message.contents);
            &message.plugin_config
        }
        PactInteraction::SyncMessage(message) => {
            map.insert("request".into(), contents_to_json(&message.request));
            map.insert(
                "response".into(),
                Value::Array(message.responses.iter().map(contents_to_json).collect()),
            );
            &message.plugin_config
        }
    };
    if !plugin_config.is_empty() {
        map.insert("pluginConfiguration".into(), json!(plugin_config));
    }
    Value::Object(map)
}

fn insert_common(map: &mut Map<String, Value>, headers: &MultiValues, body: &Body, rules: &MatchingRules) {
    if !headers.is_empty() {
        map.insert("headers".into(), json!(headers));
    }
    if let Some(body) = body.to_json() {
        map.insert("body".into(), body);
    }
    if !rules.is_empty() {
        map.insert("matchingRules".into(), rules.to_json());
    }
}

pub(crate) fn request_to_json(request: &HttpRequest) -> Value {
    let mut map = Map::new();
    map.insert("method".into(), json!(request.method.to_uppercase()));
    map.insert("path".into(), json!(request.path));
    if !request.query.is_empty() {
        map.insert("query".into(), json!(request.query));
    }
    insert_common(&mut map, &request.headers, &request.body, &request.matching_rules);
    Value::Object(map)
}

fn response_to_json(response: &HttpResponse) -> Value {
    let mut map = Map::new();
    map.insert("status".into(), json!(response.status));
    insert_common(&mut map, &response.headers, &response.body, &response.matching_rules);
    Value::Object(map)
}

fn insert_contents(map: &mut Map<String, Value>, contents: &MessageContents) {
    if let Some(body) = contents.contents.to_json() {
        map.insert("contents".into(), body);
    }
    if !contents.metadata.is_empty() {
        map.insert("metadata".into(), json!(contents.metadata));
    }
    if !contents.matching_rules.is_empty() {
        map.insert("matchingRules".into(), contents.matching_rules.to_json());
    }
}

fn contents_to_json(contents: &MessageContents) -> Value {
    let mut map = Map::new();
    insert_contents(&mut map, contents);
    Value::Object(map)
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Parse a pact document of any supported layout.
///
/// # Errors
///
/// Returns `Invalid` when participants are missing or an interaction is
/// malformed.
pub fn parse_pact(doc: &Value) -> Result<Pact> {
    let participant = |key: &str| {
        doc.get(key)
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| PactFileError::invalid(format!("missing {key} name")))
    };
    let mut pact = Pact::new(participant("consumer")?, participant("provider")?);

    let metadata = doc.get("metadata").and_then(Value::as_object);
    pact.specification = metadata
        .and_then(|m| SPECIFICATION_KEYS.iter().find_map(|key| m.get(*key)))
        .and_then(|s| s.get("version"))
        .and_then(Value::as_str)
        .map_or(SpecificationVersion::Unknown, SpecificationVersion::parse);
    if let Some(metadata) = metadata {
        for (namespace, values) in metadata {
            if SPECIFICATION_KEYS.contains(&namespace.as_str()) || namespace == ENGINE_KEY {
                continue;
            }
            if let Some(values) = values.as_object() {
                pact.metadata.insert(
                    namespace.clone(),
                    values.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                );
            }
        }
    }

    if let Some(plugins) = doc.get("plugins") {
        pact.plugins = serde_json::from_value::<Vec<PluginDependency>>(plugins.clone())?;
    }

    for (index, item) in doc
        .get("interactions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .enumerate()
    {
        let interaction = parse_interaction(item)
            .map_err(|e| PactFileError::invalid(format!("interaction {index}: {e}")))?;
        pact.interactions.push(interaction);
    }
    for item in doc.get("messages").and_then(Value::as_array).into_iter().flatten() {
        pact.interactions
            .push(PactInteraction::AsyncMessage(parse_async_message(item)?));
    }
    Ok(pact)
}

fn parse_interaction(item: &Value) -> Result<PactInteraction> {
    match item.get("type").and_then(Value::as_str) {
        Some("Asynchronous/Messages") => Ok(PactInteraction::AsyncMessage(parse_async_message(item)?)),
        Some("Synchronous/Messages") => Ok(PactInteraction::SyncMessage(parse_sync_message(item)?)),
        Some("Synchronous/HTTP") | None => Ok(PactInteraction::Http(parse_http(item)?)),
        Some(other) => Err(PactFileError::invalid(format!("unknown interaction type '{other}'"))),
    }
}

fn description(item: &Value) -> Result<String> {
    item.get("description")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| PactFileError::invalid("missing description"))
}

fn provider_states(item: &Value) -> Result<Vec<ProviderState>> {
    if let Some(states) = item.get("providerStates") {
        return Ok(serde_json::from_value(states.clone())?);
    }
    Ok(item
        .get("providerState")
        .and_then(Value::as_str)
        .map(|state| vec![ProviderState::new(state)])
        .unwrap_or_default())
}

fn plugin_config(item: &Value) -> BTreeMap<String, Value> {
    item.get("pluginConfiguration")
        .and_then(Value::as_object)
        .map(|config| config.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

fn multi_values(value: Option<&Value>) -> MultiValues {
    let mut out = MultiValues::new();
    match value {
        Some(Value::Object(map)) => {
            for (key, value) in map {
                let values = match value {
                    Value::Array(items) => items.iter().map(crate::model::annotated::value_to_string).collect(),
                    other => vec![crate::model::annotated::value_to_string(other)],
                };
                out.insert(key.clone(), values);
            }
        }
        // V2 query strings
        Some(Value::String(query)) => {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                out.entry(key.into_owned()).or_default().push(value.into_owned());
            }
        }
        _ => {}
    }
    out
}

fn header_content_type(headers: &MultiValues) -> Option<String> {
    crate::model::interaction::find_header(headers, "content-type")
        .and_then(|(_, values)| values.first().cloned())
}

fn rules(item: &Value) -> Result<MatchingRules> {
    item.get("matchingRules")
        .map_or_else(|| Ok(MatchingRules::default()), MatchingRules::from_json)
        .map_err(|e| PactFileError::invalid(e.to_string()))
}

fn body(value: Option<&Value>, content_type: Option<&str>) -> Result<Body> {
    Body::from_json(value, content_type).map_err(|e| PactFileError::invalid(e.to_string()))
}

fn parse_http(item: &Value) -> Result<HttpInteraction> {
    let request = item.get("request").unwrap_or(&Value::Null);
    let response = item.get("response").unwrap_or(&Value::Null);

    let req_headers = multi_values(request.get("headers"));
    let res_headers = multi_values(response.get("headers"));
    let req_ct = header_content_type(&req_headers);
    let res_ct = header_content_type(&res_headers);

    let status = response
        .get("status")
        .and_then(Value::as_u64)
        .map_or(Ok(200), u16::try_from)
        .map_err(|_| PactFileError::invalid("response status out of range"))?;

    Ok(HttpInteraction {
        description: description(item)?,
        provider_states: provider_states(item)?,
        request: HttpRequest {
            method: request
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or("GET")
                .to_uppercase(),
            path: request.get("path").and_then(Value::as_str).unwrap_or("/").to_string(),
            query: multi_values(request.get("query")),
            body: body(request.get("body"), req_ct.as_deref())?,
            headers: req_headers,
            matching_rules: rules(request)?,
        },
        response: HttpResponse {
            status,
            body: body(response.get("body"), res_ct.as_deref())?,
            headers: res_headers,
            matching_rules: rules(response)?,
        },
        transport: item.get("transport").and_then(Value::as_str).map(ToString::to_string),
        pending: item.get("pending").and_then(Value::as_bool).unwrap_or(false),
        plugin_config: plugin_config(item),
    })
}

fn parse_contents(item: &Value, contents_key: &str) -> Result<MessageContents> {
    let metadata: BTreeMap<String, Value> = item
        .get("metadata")
        .and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    let content_type = metadata
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("contentType") || key.eq_ignore_ascii_case("content-type"))
        .and_then(|(_, value)| value.as_str())
        .map(ToString::to_string);
    Ok(MessageContents {
        contents: body(item.get(contents_key), content_type.as_deref())?,
        metadata,
        matching_rules: rules(item)?,
    })
}

fn parse_async_message(item: &Value) -> Result<AsyncMessage> {
    Ok(AsyncMessage {
        description: description(item)?,
        provider_states: provider_states(item)?,
        contents: parse_contents(item, "contents")?,
        plugin_config: plugin_config(item),
    })
}

fn parse_sync_message(item: &Value) -> Result<SyncMessage> {
    let request = item.get("request").unwrap_or(&Value::Null);
    let responses = match item.get("response") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|r| parse_contents(r, "contents"))
            .collect::<Result<Vec<_>>>()?,
        Some(single) => vec![parse_contents(single, "contents")?],
        None => Vec::new(),
    };
    Ok(SyncMessage {
        description: description(item)?,
        provider_states: provider_states(item)?,
        request: parse_contents(request, "contents")?,
        responses,
        plugin_config: plugin_config(item),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, ContentType, MatchingRule};

    fn sample() -> Pact {
        let mut pact = Pact::new("C", "P");
        let mut interaction = HttpInteraction::new("a request for data");
        interaction.request.path = "/data".into();
        interaction.request.query.insert("id".into(), vec!["1".into(), "2".into()]);
        interaction.response.body = Body::from_text("{\"ok\":true}", Some(ContentType::json()));
        interaction
            .response
            .matching_rules
            .add_rule(Category::Body, "$.ok", MatchingRule::Boolean);
        pact.interactions.push(PactInteraction::Http(interaction));

        let mut message = AsyncMessage {
            description: "an event".into(),
            ..AsyncMessage::default()
        };
        message.contents.contents = Body::from_bytes(vec![0_u8, 1, 2, 255], Some(ContentType::octet_stream()));
        message.contents.metadata.insert("topic".into(), json!("events"));
        pact.interactions.push(PactInteraction::AsyncMessage(message));
        pact
    }

    #[test]
    fn test_write_then_read_preserves_interactions() {
        let pact = sample();
        let parsed = parse_pact(&to_json(&pact)).unwrap();
        assert_eq!(parsed.consumer, "C");
        assert_eq!(parsed.interactions, pact.interactions);
        assert_eq!(parsed.specification, SpecificationVersion::V3);
    }

    #[test]
    fn test_written_specification_version() {
        let mut pact = sample();
        pact.specification = SpecificationVersion::V2;
        let doc = to_json(&pact);
        assert_eq!(doc["metadata"]["pactSpecification"]["version"], json!("2.0.0"));
        assert_eq!(parse_pact(&doc).unwrap().specification, SpecificationVersion::V2);

        pact.specification = SpecificationVersion::Unknown;
        assert_eq!(to_json(&pact)["metadata"]["pactSpecification"]["version"], json!("4.0"));
    }

    #[test]
    fn test_merge_replaces_and_appends() {
        let existing = sample();
        let mut update = Pact::new("C", "P");
        let mut changed = HttpInteraction::new("a request for data");
        changed.response.status = 201;
        update.interactions.push(PactInteraction::Http(changed.clone()));
        update
            .interactions
            .push(PactInteraction::Http(HttpInteraction::new("another")));

        let merged = merge(existing, &update).unwrap();
        assert_eq!(merged.interactions.len(), 3);
        assert_eq!(merged.interactions[0], PactInteraction::Http(changed));
        assert_eq!(merged.interactions[2].description(), "another");

        let again = merge(merged.clone(), &update).unwrap();
        assert_eq!(again, merged);
    }

    #[test]
    fn test_merge_conflict() {
        let other = Pact::new("C", "Q");
        assert!(matches!(merge(sample(), &other), Err(PactFileError::Conflict { .. })));
    }

    #[test]
    fn test_parse_v2_document() {
        let doc = json!({
            "consumer": {"name": "C"},
            "provider": {"name": "P"},
            "interactions": [{
                "description": "legacy",
                "providerState": "a user exists",
                "request": {"method": "get", "path": "/u", "query": "a=1&a=2&b=x"},
                "response": {"status": 200, "headers": {"Content-Type": "application/json"}, "body": {"id": 1}}
            }],
            "metadata": {"pactSpecification": {"version": "2.0.0"}}
        });
        let pact = parse_pact(&doc).unwrap();
        assert_eq!(pact.specification, SpecificationVersion::V2);
        let http = pact.interactions[0].as_http().unwrap();
        assert_eq!(http.request.method, "GET");
        assert_eq!(http.request.query["a"], vec!["1", "2"]);
        assert_eq!(http.provider_states[0].name, "a user exists");
        assert_eq!(http.response.body.as_text(), Some("{\"id\":1}"));
    }

    #[test]
    fn test_parse_v3_messages() {
        let doc = json!({
            "consumer": {"name": "C"},
            "provider": {"name": "P"},
            "messages": [{
                "description": "an event",
                "contents": {"id": 1},
                "metadata": {"contentType": "application/json"}
            }],
            "metadata": {"pactSpecification": {"version": "3.0.0"}}
        });
        let pact = parse_pact(&doc).unwrap();
        assert_eq!(pact.interactions.len(), 1);
        assert_eq!(pact.interactions[0].type_name(), "Asynchronous/Messages");
    }

    #[test]
    fn test_missing_participant_is_invalid() {
        assert!(matches!(
            parse_pact(&json!({"consumer": {"name": "C"}})),
            Err(PactFileError::Invalid(_))
        ));
    }

    #[test]
    fn test_fs_storage_overwrite_and_merge() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path().join("pacts"));
        let pact = sample();
        write_pact(&pact, &storage, false).unwrap();
        write_pact(&pact, &storage, false).unwrap();
        let written = read_pact(&dir.path().join("pacts").join("C-P.json")).unwrap();
        assert_eq!(written.interactions.len(), 2);

        let mut single = Pact::new("C", "P");
        single.interactions.push(PactInteraction::Http(HttpInteraction::new("only")));
        write_pact(&single, &storage, true).unwrap();
        let written = read_pact(&dir.path().join("pacts").join("C-P.json")).unwrap();
        assert_eq!(written.interactions.len(), 1);
    }
}
