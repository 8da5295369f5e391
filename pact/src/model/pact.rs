//! The pact: a consumer/provider contract.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::interaction::{HttpInteraction, ProviderState};
use super::message::{AsyncMessage, SyncMessage};
use crate::error::{PactError, Result};

/// Pact specification version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub enum SpecificationVersion {
    /// Not specified
    Unknown,
    /// 1.0.0
    V1,
    /// 1.1.0
    V1_1,
    /// 2.0.0
    V2,
    /// 3.0.0
    #[default]
    V3,
    /// 4.0
    V4,
}

impl SpecificationVersion {
    /// Version from its boundary code (0 = Unknown .. 5 = V4).
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for codes outside 0..=5.
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::V1),
            2 => Ok(Self::V1_1),
            3 => Ok(Self::V2),
            4 => Ok(Self::V3),
            5 => Ok(Self::V4),
            other => Err(PactError::invalid_argument(format!(
                "{other} is not a valid specification version"
            ))),
        }
    }

    /// Version string written to pact files.
    #[must_use]
    pub const fn version_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::V1 => "1.0.0",
            Self::V1_1 => "1.1.0",
            Self::V2 => "2.0.0",
            Self::V3 => "3.0.0",
            Self::V4 => "4.0",
        }
    }

    /// Parse a version string read from a pact file.
    #[must_use]
    pub fn parse(version: &str) -> Self {
        let mut parts = version.trim().split('.');
        match (parts.next(), parts.next()) {
            (Some("1"), Some("1")) => Self::V1_1,
            (Some("1"), _) => Self::V1,
            (Some("2"), _) => Self::V2,
            (Some("3"), _) => Self::V3,
            (Some("4"), _) => Self::V4,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for SpecificationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.version_str())
    }
}

/// Which half of an interaction an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionPart {
    /// The request
    Request,
    /// The response
    Response,
}

impl InteractionPart {
    /// Part from its boundary code (0 = request, 1 = response).
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for any other code.
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            other => Err(PactError::invalid_argument(format!(
                "{other} is not a valid interaction part"
            ))),
        }
    }
}

impl fmt::Display for InteractionPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Request => "request",
            Self::Response => "response",
        })
    }
}

/// Plugin a pact depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDependency {
    /// Plugin name
    pub name: String,
    /// Plugin version, if pinned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Any interaction kind stored in a pact.
#[derive(Debug, Clone, PartialEq)]
pub enum PactInteraction {
    /// HTTP request/response
    Http(HttpInteraction),
    /// Asynchronous message
    AsyncMessage(AsyncMessage),
    /// Synchronous request/response messages
    SyncMessage(SyncMessage),
}

impl PactInteraction {
    /// Interaction description.
    #[must_use]
    pub fn description(&self) -> &str {
        match self {
            Self::Http(i) => &i.description,
            Self::AsyncMessage(m) => &m.description,
            Self::SyncMessage(m) => &m.description,
        }
    }

    /// Mutable interaction description.
    pub fn description_mut(&mut self) -> &mut String {
        match self {
            Self::Http(i) => &mut i.description,
            Self::AsyncMessage(m) => &mut m.description,
            Self::SyncMessage(m) => &mut m.description,
        }
    }

    /// Provider states.
    #[must_use]
    pub fn provider_states(&self) -> &[ProviderState] {
        match self {
            Self::Http(i) => &i.provider_states,
            Self::AsyncMessage(m) => &m.provider_states,
            Self::SyncMessage(m) => &m.provider_states,
        }
    }

    /// Mutable provider states.
    pub fn provider_states_mut(&mut self) -> &mut Vec<ProviderState> {
        match self {
            Self::Http(i) => &mut i.provider_states,
            Self::AsyncMessage(m) => &mut m.provider_states,
            Self::SyncMessage(m) => &mut m.provider_states,
        }
    }

    /// Plugin configuration keyed by plugin name.
    pub fn plugin_config_mut(&mut self) -> &mut BTreeMap<String, Value> {
        match self {
            Self::Http(i) => &mut i.plugin_config,
            Self::AsyncMessage(m) => &mut m.plugin_config,
            Self::SyncMessage(m) => &mut m.plugin_config,
        }
    }

    /// Type tag used in pact files.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Http(_) => "Synchronous/HTTP",
            Self::AsyncMessage(_) => "Asynchronous/Messages",
            Self::SyncMessage(_) => "Synchronous/Messages",
        }
    }

    /// The HTTP interaction, if this is one.
    #[must_use]
    pub const fn as_http(&self) -> Option<&HttpInteraction> {
        match self {
            Self::Http(i) => Some(i),
            Self::AsyncMessage(_) | Self::SyncMessage(_) => None,
        }
    }

    /// Key identifying the interaction when merging pact files.
    #[must_use]
    pub fn merge_key(&self) -> (String, String) {
        let states = serde_json::to_string(self.provider_states()).unwrap_or_default();
        (self.description().to_string(), states)
    }
}

/// A consumer/provider contract.
#[derive(Debug, Clone, PartialEq)]
pub struct Pact {
    /// Consumer name
    pub consumer: String,
    /// Provider name
    pub provider: String,
    /// Specification version
    pub specification: SpecificationVersion,
    /// Interactions in registration order
    pub interactions: Vec<PactInteraction>,
    /// Metadata, namespace to name to value
    pub metadata: BTreeMap<String, BTreeMap<String, Value>>,
    /// Plugins the pact depends on
    pub plugins: Vec<PluginDependency>,
}

impl Pact {
    /// Empty pact between two participants.
    #[must_use]
    pub fn new(consumer: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            provider: provider.into(),
            specification: SpecificationVersion::default(),
            interactions: Vec::new(),
            metadata: BTreeMap::new(),
            plugins: Vec::new(),
        }
    }

    /// HTTP interactions in registration order.
    pub fn http_interactions(&self) -> impl Iterator<Item = &HttpInteraction> {
        self.interactions.iter().filter_map(PactInteraction::as_http)
    }

    /// Whether another interaction already uses the description.
    #[must_use]
    pub fn description_taken(&self, description: &str, except: Option<usize>) -> bool {
        self.interactions
            .iter()
            .enumerate()
            .any(|(i, interaction)| Some(i) != except && interaction.description() == description)
    }

    /// Record a plugin dependency once.
    pub fn add_plugin(&mut self, name: &str, version: Option<&str>) {
        let dependency = PluginDependency {
            name: name.to_string(),
            version: version.map(ToString::to_string),
        };
        if !self.plugins.contains(&dependency) {
            self.plugins.push(dependency);
        }
    }

    /// Short label for log and error messages.
    #[must_use]
    pub fn label(&self) -> String {
        format!("Pact {}/{}", self.consumer, self.provider)
    }
}
