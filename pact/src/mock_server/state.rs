//! Per-server match bookkeeping.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::matching::Mismatch;

/// Outcome recorded for a request that did not match, or for an
/// interaction that was never requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MatchFailure {
    /// Request resembled an interaction but differed in detail
    RequestMismatch {
        /// Request method
        method: String,
        /// Request path
        path: String,
        /// Differences from the closest interaction
        mismatches: Vec<Mismatch>,
    },
    /// No interaction resembled the request
    RequestNotFound {
        /// Request method
        method: String,
        /// Request path
        path: String,
        /// The request as received
        request: Value,
    },
    /// An interaction was never requested
    MissingRequest {
        /// Expected method
        method: String,
        /// Expected path
        path: String,
        /// The expected request
        request: Value,
    },
}

/// Match counts per interaction plus the failure log.
#[derive(Debug, Default)]
pub(crate) struct MatchState {
    matched: Vec<usize>,
    failures: Vec<MatchFailure>,
}

impl MatchState {
    pub(crate) fn new(interactions: usize) -> Self {
        Self {
            matched: vec![0; interactions],
            failures: Vec::new(),
        }
    }

    pub(crate) fn record_match(&mut self, index: usize) {
        if let Some(count) = self.matched.get_mut(index) {
            *count += 1;
        }
    }

    pub(crate) fn record_failure(&mut self, failure: MatchFailure) {
        self.failures.push(failure);
    }

    /// Every interaction requested at least once and nothing failed.
    pub(crate) fn all_matched(&self) -> bool {
        self.failures.is_empty() && self.matched.iter().all(|count| *count > 0)
    }

    /// Indexes of interactions that were never requested.
    pub(crate) fn unmatched(&self) -> impl Iterator<Item = usize> + '_ {
        self.matched
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(index, _)| index)
    }

    pub(crate) fn failures(&self) -> &[MatchFailure] {
        &self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_matched_requires_every_interaction() {
        let mut state = MatchState::new(2);
        assert!(!state.all_matched());
        state.record_match(0);
        assert!(!state.all_matched());
        assert_eq!(state.unmatched().collect::<Vec<_>>(), vec![1]);
        state.record_match(1);
        assert!(state.all_matched());
    }

    #[test]
    fn test_failure_breaks_match() {
        let mut state = MatchState::new(0);
        assert!(state.all_matched());
        state.record_failure(MatchFailure::RequestNotFound {
            method: "GET".into(),
            path: "/".into(),
            request: Value::Null,
        });
        assert!(!state.all_matched());
    }

    #[test]
    fn test_failure_json_tag() {
        let value = serde_json::to_value(MatchFailure::RequestMismatch {
            method: "GET".into(),
            path: "/a".into(),
            mismatches: vec![],
        })
        .unwrap();
        assert_eq!(value["type"], "request-mismatch");
    }
}
