//! Verification results.

use serde::Serialize;

use crate::matching::{Mismatch, MismatchKind};

/// Outcome of one interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum InteractionOutcome {
    /// Provider answered as expected
    Passed,
    /// Provider answered, but differently
    Failed {
        /// Differences from the expected response
        mismatches: Vec<Mismatch>,
    },
    /// State setup or the request itself failed
    Error {
        /// What went wrong
        message: String,
    },
    /// Not run
    Skipped {
        /// Why it was not run
        reason: String,
    },
}

/// Result of one interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionResult {
    /// Consumer of the pact
    pub consumer: String,
    /// Interaction description
    pub description: String,
    /// Failures of pending pacts or interactions do not fail the run
    pub pending: bool,
    /// Outcome
    #[serde(flatten)]
    pub outcome: InteractionOutcome,
}

impl InteractionResult {
    /// Outcome counts against the run.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !self.pending && matches!(self.outcome, InteractionOutcome::Failed { .. } | InteractionOutcome::Error { .. })
    }
}

/// A source that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceError {
    /// Source label
    pub source: String,
    /// Failure description
    pub message: String,
}

/// Report of a verification run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    /// Per-interaction results in execution order
    pub results: Vec<InteractionResult>,
    /// Sources that failed to load
    pub source_errors: Vec<SourceError>,
    /// Interactions loaded before filtering
    pub interactions_loaded: usize,
    /// A run with nothing loaded fails
    pub fail_if_no_pacts_found: bool,
}

impl VerificationReport {
    /// The run passed: no failure outside pending pacts, every source
    /// loaded, and something was loaded when that is required.
    #[must_use]
    pub fn success(&self) -> bool {
        self.source_errors.is_empty()
            && !self.results.iter().any(InteractionResult::is_failure)
            && (!self.fail_if_no_pacts_found || self.interactions_loaded > 0)
    }

    /// Results that count against the run.
    pub fn failures(&self) -> impl Iterator<Item = &InteractionResult> {
        self.results.iter().filter(|r| r.is_failure())
    }

    /// Every mismatch recorded, pending or not.
    pub fn mismatches(&self) -> impl Iterator<Item = &Mismatch> {
        self.results
            .iter()
            .filter_map(|r| match &r.outcome {
                InteractionOutcome::Failed { mismatches } => Some(mismatches),
                _ => None,
            })
            .flatten()
    }

    /// Number of mismatches of one kind.
    #[must_use]
    pub fn count_of(&self, kind: MismatchKind) -> usize {
        self.mismatches().filter(|m| m.kind() == kind).count()
    }
}
