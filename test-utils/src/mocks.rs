//! In-process plugins for testing.
//!
//! [`FakePluginDriver`] starts [`FakePlugin`]s without spawning processes
//! and counts every start and shutdown, so reference counting can be
//! observed from tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pact_engine::model::{Body, ContentType, MatchingRule, RuleList};
use pact_engine::plugins::{InteractionContents, PluginContents, PluginDriver, PluginInstance};
use pact_engine::{PactError, Result};
use serde_json::{Map, Value};

/// Plugin that echoes its definition back as a JSON body.
#[derive(Debug)]
pub struct FakePlugin {
    name: String,
    version: String,
    content_types: Vec<String>,
    shutdowns: Arc<AtomicUsize>,
}

impl PluginInstance for FakePlugin {
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
        if let Some(reason) = definition.get("reject").and_then(Value::as_str) {
            return Err(PactError::PluginReported(reason.to_string()));
        }
        let mut rules = BTreeMap::new();
        if let Some(fields) = definition.as_object() {
            for name in fields.keys() {
                rules.insert(format!("$.{name}"), RuleList::single(MatchingRule::Type));
            }
        }
        Ok(InteractionContents {
            parts: vec![PluginContents {
                part_name: String::new(),
                body: Body::from_text(definition.to_string(), Some(content_type.clone())),
                rules,
                plugin_config: Map::from_iter([("echo".to_string(), Value::Bool(true))]),
            }],
            plugin_config: Map::from_iter([("plugin".to_string(), Value::String(self.name.clone()))]),
        })
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Driver that knows one plugin name and counts its lifecycle.
#[derive(Debug)]
pub struct FakePluginDriver {
    name: String,
    content_type: String,
    starts: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
}

impl FakePluginDriver {
    /// Driver for a plugin handling one content type.
    #[must_use]
    pub fn new(name: &str, content_type: &str) -> Self {
        Self {
            name: name.to_string(),
            content_type: content_type.to_string(),
            starts: AtomicUsize::new(0),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of plugins started.
    #[must_use]
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of plugins shut down.
    #[must_use]
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl PluginDriver for FakePluginDriver {
    fn start(&self, name: &str, version: Option<&str>) -> Result<Arc<dyn PluginInstance>> {
        if name != self.name {
            return Err(PactError::PluginLoad {
                name: name.to_string(),
                reason: "not installed".to_string(),
            });
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakePlugin {
            name: self.name.clone(),
            version: version.unwrap_or("0.1.0").to_string(),
            content_types: vec![self.content_type.clone()],
            shutdowns: Arc::clone(&self.shutdowns),
        }))
    }
}
