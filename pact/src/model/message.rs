//! Message contracts.

use std::collections::BTreeMap;

use serde_json::Value;

use super::body::Body;
use super::interaction::ProviderState;
use super::matchers::MatchingRules;

/// Contents of a message: body, metadata and their rules.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageContents {
    /// Message payload
    pub contents: Body,
    /// Metadata key/values
    pub metadata: BTreeMap<String, Value>,
    /// Rules for body and metadata
    pub matching_rules: MatchingRules,
}

/// Asynchronous (fire and forget) message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AsyncMessage {
    /// Unique description within the pact
    pub description: String,
    /// Provider states, in order
    pub provider_states: Vec<ProviderState>,
    /// Message contents
    pub contents: MessageContents,
    /// Configuration returned by plugins, keyed by plugin name
    pub plugin_config: BTreeMap<String, Value>,
}

/// Request message with one or more response messages.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncMessage {
    /// Unique description within the pact
    pub description: String,
    /// Provider states, in order
    pub provider_states: Vec<ProviderState>,
    /// Request message
    pub request: MessageContents,
    /// Response messages, by index
    pub responses: Vec<MessageContents>,
    /// Configuration returned by plugins, keyed by plugin name
    pub plugin_config: BTreeMap<String, Value>,
}

impl SyncMessage {
    /// Response at `index`, created (with any gap filled) when absent.
    pub fn response_mut(&mut self, index: usize) -> &mut MessageContents {
        if self.responses.len() <= index {
            self.responses.resize_with(index + 1, MessageContents::default);
        }
        &mut self.responses[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_mut_fills_gaps() {
        let mut message = SyncMessage::default();
        message.response_mut(1).metadata.insert("k".into(), Value::Bool(true));
        assert_eq!(message.responses.len(), 2);
        assert_eq!(message.responses[0], MessageContents::default());
        assert!(message.responses[1].metadata["k"].as_bool().unwrap());
    }
}
