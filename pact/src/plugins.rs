//! Plugin content negotiation.
//!
//! A pact declares the plugins it uses; each distinct `(name, version)` is
//! started once and shared by every pact that declared it. The reference
//! count of a plugin is the number of pacts holding it, and the plugin is
//! shut down when the last one lets go.
//!
//! When an interaction body is declared with a content type that a loaded
//! plugin handles, the plugin turns the consumer's definition into concrete
//! contents, matching rules and configuration, which are merged into the
//! interaction.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{PactError, Result};
use crate::mock_server::MockServerManager;
use crate::model::matchers::rule_map_from_json;
use crate::model::{
    Body, Category, ContentType, HttpInteraction, InteractionPart, MessageContents, MultiValues, PactInteraction,
    RuleList,
};
use crate::model::interaction::find_header;
use crate::registry::{InteractionHandle, MessageHandle, PactHandle, Registry};

/// Name of the manifest inside a plugin directory.
pub const MANIFEST_FILE: &str = "pact-plugin.json";

/// One part of the contents produced by a plugin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginContents {
    /// `request`, `response`, or empty when the plugin does not say
    pub part_name: String,
    /// Generated body
    pub body: Body,
    /// Body matching rules keyed by document path
    pub rules: BTreeMap<String, RuleList>,
    /// Configuration the plugin needs to match this part later
    pub plugin_config: Map<String, Value>,
}

/// Everything a plugin returned for one interaction definition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InteractionContents {
    /// Generated parts in the order the plugin listed them
    pub parts: Vec<PluginContents>,
    /// Configuration that applies to the whole interaction
    pub plugin_config: Map<String, Value>,
}

impl InteractionContents {
    /// Part with the given name, else the first unnamed part.
    #[must_use]
    pub fn part(&self, name: &str) -> Option<&PluginContents> {
        self.parts
            .iter()
            .find(|p| p.part_name.eq_ignore_ascii_case(name))
            .or_else(|| self.parts.iter().find(|p| p.part_name.is_empty()))
    }
}

/// A started plugin.
pub trait PluginInstance: Send + Sync + fmt::Debug {
    /// Plugin name.
    fn name(&self) -> &str;

    /// Resolved plugin version.
    fn version(&self) -> &str;

    /// Content types the plugin generates and matches.
    fn content_types(&self) -> &[String];

    /// Turn a consumer definition into interaction contents.
    ///
    /// # Errors
    ///
    /// Returns `PluginReported` when the plugin rejects the definition and
    /// `PluginProtocol` when its answer is unusable.
    fn configure_interaction(&self, content_type: &ContentType, definition: &Value) -> Result<InteractionContents>;

    /// Stop the plugin. Called once, when the last reference goes away.
    fn shutdown(&self);
}

/// Starts plugins by name and optional version.
pub trait PluginDriver: Send + Sync {
    /// Start a plugin; `None` picks the newest installed version.
    ///
    /// # Errors
    ///
    /// Returns `PluginLoad` when the plugin cannot be found or started.
    fn start(&self, name: &str, version: Option<&str>) -> Result<Arc<dyn PluginInstance>>;
}

/// Whether a plugin handles a content type.
fn handles(plugin: &dyn PluginInstance, content_type: &ContentType) -> bool {
    plugin
        .content_types()
        .iter()
        .filter_map(|ct| ct.parse::<ContentType>().ok())
        .any(|ct| ct.is_equivalent_to(content_type))
}

struct Loaded {
    instance: Arc<dyn PluginInstance>,
    owners: BTreeSet<PactHandle>,
}

/// Reference-counted set of running plugins.
pub struct PluginManager {
    driver: Arc<dyn PluginDriver>,
    loaded: Mutex<BTreeMap<(String, String), Loaded>>,
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("loaded", &self.loaded.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    /// Create a manager that starts plugins through `driver`.
    #[must_use]
    pub fn new(driver: Arc<dyn PluginDriver>) -> Self {
        Self {
            driver,
            loaded: Mutex::new(BTreeMap::new()),
        }
    }

    /// Declare that a pact uses a plugin, starting it if needed.
    ///
    /// A pact holds at most one reference per plugin, so repeated calls are
    /// harmless.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` for an unknown pact and `PluginLoad` when
    /// the plugin cannot be started.
    pub fn using_plugin(&self, registry: &Registry, pact: PactHandle, name: &str, version: Option<&str>) -> Result<()> {
        registry.with_pact(pact, |_| ())?;
        let version = version.map(str::trim).filter(|v| !v.is_empty());

        let existing = {
            let mut loaded = self.loaded.lock();
            loaded
                .iter_mut()
                .find(|((n, v), _)| n == name && version.is_none_or(|wanted| wanted == v))
                .map(|((_, v), plugin)| {
                    plugin.owners.insert(pact);
                    v.clone()
                })
        };
        let resolved = match existing {
            Some(resolved) => resolved,
            None => self.start(name, version, pact)?,
        };

        registry.update_pact_unchecked(pact, |p| p.add_plugin(name, Some(&resolved)))
    }

    /// Start a plugin. The plugin table is not locked while the driver runs;
    /// when two pacts start the same plugin at once, the first to register
    /// wins and the other instance is stopped.
    fn start(&self, name: &str, version: Option<&str>, pact: PactHandle) -> Result<String> {
        let instance = self.driver.start(name, version)?;
        let resolved = instance.version().to_string();
        let mut loaded = self.loaded.lock();
        if let Some(plugin) = loaded.get_mut(&(name.to_string(), resolved.clone())) {
            plugin.owners.insert(pact);
            drop(loaded);
            debug!(plugin = name, version = %resolved, "Plugin already started, stopping duplicate");
            instance.shutdown();
            return Ok(resolved);
        }
        info!(plugin = name, version = %resolved, pact = pact.id(), "Plugin started");
        loaded.insert(
            (name.to_string(), resolved.clone()),
            Loaded {
                instance,
                owners: BTreeSet::from([pact]),
            },
        );
        Ok(resolved)
    }

    /// Drop every plugin reference held by a pact, shutting down plugins
    /// nobody else uses.
    pub fn cleanup_plugins(&self, pact: PactHandle) {
        let released: Vec<Arc<dyn PluginInstance>> = {
            let mut loaded = self.loaded.lock();
            for plugin in loaded.values_mut() {
                plugin.owners.remove(&pact);
            }
            let idle: Vec<_> = loaded
                .iter()
                .filter(|(_, plugin)| plugin.owners.is_empty())
                .map(|(key, _)| key.clone())
                .collect();
            idle.into_iter()
                .filter_map(|key| loaded.remove(&key))
                .map(|plugin| plugin.instance)
                .collect()
        };
        for instance in released {
            info!(plugin = instance.name(), version = instance.version(), "Plugin shut down");
            instance.shutdown();
        }
    }

    /// Number of pacts holding a plugin.
    pub fn reference_count(&self, name: &str, version: &str) -> usize {
        self.loaded
            .lock()
            .get(&(name.to_string(), version.to_string()))
            .map_or(0, |plugin| plugin.owners.len())
    }

    /// Shut down every plugin regardless of references.
    pub fn shutdown_all(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.loaded.lock()).into_values().collect();
        for plugin in drained {
            plugin.instance.shutdown();
        }
    }

    fn plugin_for(&self, pact: PactHandle, content_type: &ContentType) -> Result<Arc<dyn PluginInstance>> {
        self.loaded
            .lock()
            .values()
            .find(|plugin| plugin.owners.contains(&pact) && handles(plugin.instance.as_ref(), content_type))
            .map(|plugin| plugin.instance.clone())
            .ok_or_else(|| PactError::PluginLoad {
                name: content_type.base_type(),
                reason: "no plugin loaded for this pact handles the content type".to_string(),
            })
    }

    /// Ask the plugin to build one part of an HTTP interaction.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen` (also while a mock server serves
    /// the pact), `InvalidArgument` for a bad content type, `Json` for a
    /// malformed definition, or a plugin error.
    pub fn interaction_contents(
        &self,
        registry: &Registry,
        mock_servers: &MockServerManager,
        interaction: InteractionHandle,
        part: InteractionPart,
        content_type: &str,
        definition: &str,
    ) -> Result<()> {
        let owner = registry.interaction_owner(interaction)?;
        if mock_servers.serves(owner) {
            return Err(PactError::Frozen(format!("Interaction {interaction} (mock server running)")));
        }
        let content_type: ContentType = content_type.parse()?;
        let definition: Value = serde_json::from_str(definition)?;
        let plugin = self.plugin_for(owner, &content_type)?;
        let contents = plugin.configure_interaction(&content_type, &definition)?;
        let part_name = match part {
            InteractionPart::Request => "request",
            InteractionPart::Response => "response",
        };
        let generated = contents.part(part_name).ok_or_else(|| {
            PactError::PluginProtocol(format!("{} returned no contents for the {part_name}", plugin.name()))
        })?;
        debug!(plugin = plugin.name(), interaction = interaction.id(), part = part_name, "Applying plugin contents");

        registry.update_interaction(interaction, |pact, index| {
            let Some(PactInteraction::Http(http)) = pact.interactions.get_mut(index) else {
                return Err(PactError::internal("interaction handle does not refer to an HTTP interaction"));
            };
            apply_http(http, part, generated, &content_type);
            merge_config(&mut http.plugin_config, plugin.name(), &contents.plugin_config, &generated.plugin_config);
            Ok(())
        })
    }

    /// Ask the plugin to build the contents of a message.
    ///
    /// An asynchronous message takes the first part; a synchronous message
    /// takes its request from the `request` part and one response per
    /// `response` part.
    ///
    /// # Errors
    ///
    /// As [`Self::interaction_contents`].
    pub fn message_contents(
        &self,
        registry: &Registry,
        mock_servers: &MockServerManager,
        message: MessageHandle,
        content_type: &str,
        definition: &str,
    ) -> Result<()> {
        let owner = registry.message_owner(message)?;
        if mock_servers.serves(owner) {
            return Err(PactError::Frozen(format!("Message {message} (mock server running)")));
        }
        let content_type: ContentType = content_type.parse()?;
        let definition: Value = serde_json::from_str(definition)?;
        let plugin = self.plugin_for(owner, &content_type)?;
        let contents = plugin.configure_interaction(&content_type, &definition)?;
        let first = contents
            .parts
            .first()
            .ok_or_else(|| PactError::PluginProtocol(format!("{} returned no contents", plugin.name())))?;

        registry.update_message(message, |pact, index| match pact.interactions.get_mut(index) {
            Some(PactInteraction::AsyncMessage(m)) => {
                apply_message(&mut m.contents, first, &content_type);
                merge_config(&mut m.plugin_config, plugin.name(), &contents.plugin_config, &first.plugin_config);
                Ok(())
            }
            Some(PactInteraction::SyncMessage(m)) => {
                let request = contents.part("request").unwrap_or(first);
                apply_message(&mut m.request, request, &content_type);
                let responses: Vec<_> = contents
                    .parts
                    .iter()
                    .filter(|p| p.part_name.eq_ignore_ascii_case("response"))
                    .collect();
                for (i, response) in responses.into_iter().enumerate() {
                    apply_message(m.response_mut(i), response, &content_type);
                }
                merge_config(&mut m.plugin_config, plugin.name(), &contents.plugin_config, &request.plugin_config);
                Ok(())
            }
            _ => Err(PactError::internal("message handle does not refer to a message")),
        })
    }
}

fn set_content_type_header(headers: &mut MultiValues, content_type: &ContentType) {
    if find_header(headers, "content-type").is_none() {
        headers.insert("Content-Type".to_string(), vec![content_type.to_string()]);
    }
}

fn apply_http(interaction: &mut HttpInteraction, part: InteractionPart, contents: &PluginContents, requested: &ContentType) {
    let (headers, body, rules) = match part {
        InteractionPart::Request => (
            &mut interaction.request.headers,
            &mut interaction.request.body,
            &mut interaction.request.matching_rules,
        ),
        InteractionPart::Response => (
            &mut interaction.response.headers,
            &mut interaction.response.body,
            &mut interaction.response.matching_rules,
        ),
    };
    let content_type = contents.body.content_type().cloned().unwrap_or_else(|| requested.clone());
    set_content_type_header(headers, &content_type);
    *body = with_content_type(&contents.body, content_type);
    rules.set_category(Category::Body, contents.rules.clone());
}

fn apply_message(target: &mut MessageContents, contents: &PluginContents, requested: &ContentType) {
    let content_type = contents.body.content_type().cloned().unwrap_or_else(|| requested.clone());
    target
        .metadata
        .insert("contentType".to_string(), Value::String(content_type.to_string()));
    target.contents = with_content_type(&contents.body, content_type);
    target.matching_rules.set_category(Category::Body, contents.rules.clone());
}

fn with_content_type(body: &Body, content_type: ContentType) -> Body {
    match body {
        Body::Present { content, .. } => Body::Present {
            content: content.clone(),
            content_type: Some(content_type),
        },
        other => other.clone(),
    }
}

/// Store interaction-wide and part configuration under the plugin's name,
/// part values taking precedence.
fn merge_config(
    target: &mut BTreeMap<String, Value>,
    plugin: &str,
    interaction: &Map<String, Value>,
    part: &Map<String, Value>,
) {
    let mut merged = match target.remove(plugin) {
        Some(Value::Object(existing)) => existing,
        _ => Map::new(),
    };
    merged.extend(interaction.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged.extend(part.iter().map(|(k, v)| (k.clone(), v.clone())));
    if !merged.is_empty() {
        target.insert(plugin.to_string(), Value::Object(merged));
    }
}

// ---------------------------------------------------------------------------
// Process driver
// ---------------------------------------------------------------------------

/// Plugin manifest (`pact-plugin.json`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Plugin name
    pub name: String,
    /// Plugin version
    pub version: String,
    /// Executable, relative to the plugin directory
    pub entry_point: String,
    /// Extra arguments for the executable
    #[serde(default)]
    pub args: Vec<String>,
    /// Free-form plugin configuration
    #[serde(default)]
    pub plugin_config: Map<String, Value>,
}

impl PluginManifest {
    /// Content types advertised by the manifest itself.
    #[must_use]
    pub fn content_types(&self) -> Vec<String> {
        self.plugin_config
            .get("contentTypes")
            .and_then(Value::as_array)
            .map(|types| types.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Requests sent to a plugin process, one JSON document per line.
#[derive(Debug, Serialize)]
#[serde(tag = "request", rename_all = "camelCase")]
enum PluginRequest<'a> {
    Init {
        implementation: &'static str,
        version: &'static str,
    },
    #[serde(rename_all = "camelCase")]
    ConfigureInteraction {
        content_type: String,
        definition: &'a Value,
    },
    Shutdown,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitResponse {
    #[serde(default)]
    content_types: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigureResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    contents: Vec<WirePart>,
    #[serde(default)]
    plugin_configuration: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(default)]
    part_name: String,
    #[serde(default)]
    contents: Option<Value>,
    #[serde(default)]
    rules: Value,
    #[serde(default)]
    plugin_configuration: Map<String, Value>,
}

impl WirePart {
    fn into_contents(self) -> Result<PluginContents> {
        Ok(PluginContents {
            part_name: self.part_name,
            body: Body::from_json(self.contents.as_ref(), None)
                .map_err(|e| PactError::PluginProtocol(e.to_string()))?,
            rules: rule_map_from_json(&self.rules).map_err(|e| PactError::PluginProtocol(e.to_string()))?,
            plugin_config: self.plugin_configuration,
        })
    }
}

/// Starts plugins as child processes found under a plugin directory laid
/// out as `<dir>/<name>-<version>/pact-plugin.json`.
#[derive(Debug, Clone)]
pub struct ProcessPluginDriver {
    plugin_dir: PathBuf,
}

/// Compare dotted versions numerically where possible.
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parts = |v: &str| -> Vec<u64> { v.split(['.', '-']).map(|p| p.parse().unwrap_or(0)).collect() };
    parts(a).cmp(&parts(b))
}

impl ProcessPluginDriver {
    /// Driver over a plugin directory.
    #[must_use]
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
        }
    }

    /// Find the manifest of a plugin; `None` picks the newest version.
    ///
    /// # Errors
    ///
    /// Returns `PluginLoad` when no matching manifest exists or it cannot
    /// be parsed.
    pub fn find_manifest(&self, name: &str, version: Option<&str>) -> Result<(PathBuf, PluginManifest)> {
        let load_error = |reason: String| PactError::PluginLoad {
            name: name.to_string(),
            reason,
        };
        let dir = match version {
            Some(version) => self.plugin_dir.join(format!("{name}-{version}")),
            None => {
                let prefix = format!("{name}-");
                let entries = std::fs::read_dir(&self.plugin_dir)
                    .map_err(|e| load_error(format!("cannot read {}: {e}", self.plugin_dir.display())))?;
                entries
                    .filter_map(std::result::Result::ok)
                    .filter_map(|entry| {
                        let file_name = entry.file_name().to_string_lossy().into_owned();
                        let version = file_name.strip_prefix(&prefix)?.to_string();
                        entry.path().join(MANIFEST_FILE).is_file().then(|| (version, entry.path()))
                    })
                    .max_by(|(a, _), (b, _)| compare_versions(a, b))
                    .map(|(_, path)| path)
                    .ok_or_else(|| load_error(format!("not installed in {}", self.plugin_dir.display())))?
            }
        };
        let manifest_path = dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&manifest_path)
            .map_err(|e| load_error(format!("cannot read {}: {e}", manifest_path.display())))?;
        let manifest: PluginManifest =
            serde_json::from_str(&text).map_err(|e| load_error(format!("invalid manifest: {e}")))?;
        Ok((dir, manifest))
    }
}

impl PluginDriver for ProcessPluginDriver {
    fn start(&self, name: &str, version: Option<&str>) -> Result<Arc<dyn PluginInstance>> {
        let (dir, manifest) = self.find_manifest(name, version)?;
        let plugin = ProcessPlugin::spawn(&dir, manifest)?;
        Ok(Arc::new(plugin))
    }
}

struct PluginProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl PluginProcess {
    fn exchange(&mut self, request: &PluginRequest<'_>) -> Result<Value> {
        let line = serde_json::to_string(request)?;
        writeln!(self.stdin, "{line}").map_err(|e| PactError::PluginProtocol(format!("write failed: {e}")))?;
        self.stdin
            .flush()
            .map_err(|e| PactError::PluginProtocol(format!("write failed: {e}")))?;

        let mut reply = String::new();
        let read = self
            .stdout
            .read_line(&mut reply)
            .map_err(|e| PactError::PluginProtocol(format!("read failed: {e}")))?;
        if read == 0 {
            return Err(PactError::PluginProtocol("plugin closed its output".to_string()));
        }
        serde_json::from_str(&reply).map_err(|e| PactError::PluginProtocol(format!("invalid reply: {e}")))
    }
}

/// A plugin running as a child process.
pub struct ProcessPlugin {
    name: String,
    version: String,
    content_types: Vec<String>,
    process: Mutex<Option<PluginProcess>>,
}

impl fmt::Debug for ProcessPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessPlugin")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("content_types", &self.content_types)
            .finish_non_exhaustive()
    }
}

impl ProcessPlugin {
    fn spawn(dir: &Path, manifest: PluginManifest) -> Result<Self> {
        let load_error = |reason: String| PactError::PluginLoad {
            name: manifest.name.clone(),
            reason,
        };
        let mut child = Command::new(dir.join(&manifest.entry_point))
            .args(&manifest.args)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| load_error(format!("cannot start {}: {e}", manifest.entry_point)))?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(load_error("plugin stdio unavailable".to_string()));
        };
        let mut process = PluginProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };

        let init = process
            .exchange(&PluginRequest::Init {
                implementation: "pact-engine",
                version: env!("CARGO_PKG_VERSION"),
            })
            .and_then(|reply| {
                serde_json::from_value::<InitResponse>(reply).map_err(|e| PactError::PluginProtocol(e.to_string()))
            });
        let init = match init {
            Ok(init) => init,
            Err(e) => {
                let _ = process.child.kill();
                let _ = process.child.wait();
                return Err(load_error(format!("initialisation failed: {e}")));
            }
        };
        let content_types = if init.content_types.is_empty() {
            manifest.content_types()
        } else {
            init.content_types
        };
        debug!(plugin = %manifest.name, version = %manifest.version, ?content_types, "Plugin process initialised");

        Ok(Self {
            name: manifest.name,
            version: manifest.version,
            content_types,
            process: Mutex::new(Some(process)),
        })
    }
}

impl PluginInstance for ProcessPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn content_types(&self) -> &[String] {
        &self.content_types
    }

    fn configure_interaction(&self, content_type: &ContentType, definition: &Value) -> Result<InteractionContents> {
        let reply = {
            let mut guard = self.process.lock();
            let process = guard
                .as_mut()
                .ok_or_else(|| PactError::PluginProtocol(format!("{} has been shut down", self.name)))?;
            process.exchange(&PluginRequest::ConfigureInteraction {
                content_type: content_type.to_string(),
                definition,
            })?
        };
        let reply: ConfigureResponse =
            serde_json::from_value(reply).map_err(|e| PactError::PluginProtocol(e.to_string()))?;
        if let Some(error) = reply.error {
            return Err(PactError::PluginReported(error));
        }
        Ok(InteractionContents {
            parts: reply
                .contents
                .into_iter()
                .map(WirePart::into_contents)
                .collect::<Result<_>>()?,
            plugin_config: reply.plugin_configuration,
        })
    }

    fn shutdown(&self) {
        let Some(mut process) = self.process.lock().take() else {
            return;
        };
        if let Ok(line) = serde_json::to_string(&PluginRequest::Shutdown) {
            let _ = writeln!(process.stdin, "{line}");
        }
        if let Err(e) = process.child.kill() {
            debug!(plugin = %self.name, error = %e, "Plugin already exited");
        }
        if let Err(e) = process.child.wait() {
            warn!(plugin = %self.name, error = %e, "Failed to reap plugin process");
        }
    }
}

impl Drop for ProcessPlugin {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct StaticPlugin {
        content_types: Vec<String>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl PluginInstance for StaticPlugin {
        fn name(&self) -> &str {
            "csv"
        }

        fn version(&self) -> &str {
            "1.0.0"
        }

        fn content_types(&self) -> &[String] {
            &self.content_types
        }

        fn configure_interaction(&self, _: &ContentType, definition: &Value) -> Result<InteractionContents> {
            if definition.get("fail").is_some() {
                return Err(PactError::PluginReported("bad definition".into()));
            }
            let mut rules = BTreeMap::new();
            rules.insert("column:1".to_string(), RuleList::single(crate::model::MatchingRule::Type));
            Ok(InteractionContents {
                parts: vec![PluginContents {
                    part_name: "response".into(),
                    body: Body::from_text("a,b\n", Some("text/csv".parse()?)),
                    rules,
                    plugin_config: Map::from_iter([("columns".to_string(), Value::from(2))]),
                }],
                plugin_config: Map::from_iter([("csvHeaders".to_string(), Value::Bool(false))]),
            })
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct StaticDriver {
        starts: AtomicUsize,
        shutdowns: Arc<AtomicUsize>,
    }

    impl PluginDriver for StaticDriver {
        fn start(&self, name: &str, _: Option<&str>) -> Result<Arc<dyn PluginInstance>> {
            if name != "csv" {
                return Err(PactError::PluginLoad {
                    name: name.into(),
                    reason: "unknown".into(),
                });
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StaticPlugin {
                content_types: vec!["text/csv".to_string()],
                shutdowns: self.shutdowns.clone(),
            }))
        }
    }

    fn setup() -> (Arc<StaticDriver>, PluginManager, Registry) {
        let driver = Arc::new(StaticDriver::default());
        let manager = PluginManager::new(driver.clone());
        (driver, manager, Registry::new())
    }

    #[test]
    fn test_reference_count_across_pacts() {
        let (driver, manager, registry) = setup();
        let a = registry.new_pact("A", "P");
        let b = registry.new_pact("B", "P");
        manager.using_plugin(&registry, a, "csv", Some("1.0.0")).unwrap();
        manager.using_plugin(&registry, a, "csv", Some("1.0.0")).unwrap();
        manager.using_plugin(&registry, b, "csv", None).unwrap();
        assert_eq!(driver.starts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.reference_count("csv", "1.0.0"), 2);

        manager.cleanup_plugins(a);
        assert_eq!(manager.reference_count("csv", "1.0.0"), 1);
        assert_eq!(driver.shutdowns.load(Ordering::SeqCst), 0);
        manager.cleanup_plugins(b);
        assert_eq!(manager.reference_count("csv", "1.0.0"), 0);
        assert_eq!(driver.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_using_plugin_records_dependency() {
        let (_, manager, registry) = setup();
        let pact = registry.new_pact("A", "P");
        manager.using_plugin(&registry, pact, "csv", None).unwrap();
        let plugins = registry.pact(pact).unwrap().plugins;
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn test_load_failure_and_invalid_pact() {
        let (_, manager, registry) = setup();
        let pact = registry.new_pact("A", "P");
        assert!(matches!(
            manager.using_plugin(&registry, pact, "nope", None),
            Err(PactError::PluginLoad { .. })
        ));
        assert!(matches!(
            manager.using_plugin(&registry, PactHandle::new(999), "csv", None),
            Err(PactError::InvalidHandle { .. })
        ));
    }

    #[test]
    fn test_interaction_contents_merged() {
        let (_, manager, registry) = setup();
        let servers = MockServerManager::new();
        let pact = registry.new_pact("A", "P");
        manager.using_plugin(&registry, pact, "csv", None).unwrap();
        let interaction = registry.new_interaction(pact, "csv report").unwrap();
        manager
            .interaction_contents(&registry, &servers, interaction, InteractionPart::Response, "text/csv", "{}")
            .unwrap();

        let http = registry
            .read_interaction(interaction, |p, i| p.interactions[i].as_http().cloned())
            .unwrap()
            .unwrap();
        assert_eq!(http.response.body.as_text(), Some("a,b\n"));
        assert_eq!(http.response.headers["Content-Type"], vec!["text/csv".to_string()]);
        assert!(http.response.matching_rules.category(Category::Body).unwrap().contains_key("column:1"));
        assert_eq!(http.plugin_config["csv"]["columns"], 2);
        assert_eq!(http.plugin_config["csv"]["csvHeaders"], false);
    }

    #[test]
    fn test_interaction_contents_errors() {
        let (_, manager, registry) = setup();
        let servers = MockServerManager::new();
        let pact = registry.new_pact("A", "P");
        let interaction = registry.new_interaction(pact, "x").unwrap();
        let call = |ct: &str, json: &str| {
            manager.interaction_contents(&registry, &servers, interaction, InteractionPart::Request, ct, json)
        };

        assert!(matches!(call("text/csv", "{}"), Err(PactError::PluginLoad { .. })));
        manager.using_plugin(&registry, pact, "csv", None).unwrap();
        assert!(matches!(call("not a type", "{}"), Err(PactError::InvalidArgument(_))));
        assert!(matches!(call("text/csv", "{"), Err(PactError::Json(_))));
        assert!(matches!(call("text/csv", r#"{"fail": true}"#), Err(PactError::PluginReported(_))));
        assert!(matches!(
            manager.interaction_contents(
                &registry,
                &servers,
                InteractionHandle::new(77),
                InteractionPart::Request,
                "text/csv",
                "{}"
            ),
            Err(PactError::InvalidHandle { .. })
        ));
    }

    #[test]
    fn test_message_contents() {
        let (_, manager, registry) = setup();
        let servers = MockServerManager::new();
        let pact = registry.new_pact("A", "P");
        manager.using_plugin(&registry, pact, "csv", None).unwrap();
        let message = registry.new_async_message(pact, "a csv event").unwrap();
        manager
            .message_contents(&registry, &servers, message, "text/csv", "{}")
            .unwrap();
        let contents = registry.async_message_contents(message).unwrap();
        assert_eq!(contents.contents.as_text(), Some("a,b\n"));
        assert_eq!(contents.metadata["contentType"], "text/csv");
    }

    #[test]
    fn test_manifest_lookup_picks_newest() {
        let dir = tempfile::tempdir().unwrap();
        for version in ["0.9.0", "0.10.1"] {
            let plugin_dir = dir.path().join(format!("csv-{version}"));
            std::fs::create_dir_all(&plugin_dir).unwrap();
            std::fs::write(
                plugin_dir.join(MANIFEST_FILE),
                format!(
                    r#"{{"name": "csv", "version": "{version}", "entryPoint": "run.sh",
                        "pluginConfig": {{"contentTypes": ["text/csv"]}}}}"#
                ),
            )
            .unwrap();
        }
        let driver = ProcessPluginDriver::new(dir.path());
        let (_, manifest) = driver.find_manifest("csv", None).unwrap();
        assert_eq!(manifest.version, "0.10.1");
        assert_eq!(manifest.content_types(), vec!["text/csv".to_string()]);
        assert!(matches!(
            driver.find_manifest("csv", Some("2.0.0")),
            Err(PactError::PluginLoad { .. })
        ));
    }

    #[test]
    fn test_wire_request_shape() {
        let definition = serde_json::json!({"a": 1});
        let value = serde_json::to_value(PluginRequest::ConfigureInteraction {
            content_type: "text/csv".into(),
            definition: &definition,
        })
        .unwrap();
        assert_eq!(value["request"], "configureInteraction");
        assert_eq!(value["contentType"], "text/csv");
    }

    struct GatedDriver {
        inner: StaticDriver,
        entered: Mutex<std::sync::mpsc::Sender<()>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl PluginDriver for GatedDriver {
        fn start(&self, name: &str, version: Option<&str>) -> Result<Arc<dyn PluginInstance>> {
            if name == "slow" {
                self.entered.lock().send(()).unwrap();
                self.release.lock().recv().unwrap();
                return Err(PactError::PluginLoad {
                    name: name.into(),
                    reason: "gave up".into(),
                });
            }
            self.inner.start(name, version)
        }
    }

    #[test]
    fn test_slow_start_does_not_block_other_plugins() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let manager = PluginManager::new(Arc::new(GatedDriver {
            inner: StaticDriver::default(),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        }));
        let registry = Registry::new();
        let slow = registry.new_pact("A", "P");
        let fast = registry.new_pact("B", "P");

        std::thread::scope(|scope| {
            let starting = scope.spawn(|| manager.using_plugin(&registry, slow, "slow", None));
            entered_rx.recv().unwrap();
            manager.using_plugin(&registry, fast, "csv", None).unwrap();
            assert_eq!(manager.reference_count("csv", "1.0.0"), 1);
            release_tx.send(()).unwrap();
            assert!(matches!(starting.join().unwrap(), Err(PactError::PluginLoad { .. })));
        });
    }
}
