//! Consumer-driven contract testing core.
//!
//! Consumers describe the interactions they expect through handles held
//! in a [`Registry`], replay them against a local mock server, and write
//! the resulting pact files. Providers verify those pacts with a
//! [`verifier`] run against the real service.
//!
//! - [`consumer`]: builder operations over pact, interaction and message handles
//! - [`matching`]: comparison of expected and observed traffic
//! - [`mock_server`]: HTTP(S) servers replaying a pact
//! - [`plugins`]: plugin-provided content types
//! - [`verifier`]: provider verification and result publishing
//! - [`api`]: plain-value entry points with result codes for bindings

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod config;
pub mod consumer;
pub mod context;
pub mod error;
pub mod matching;
pub mod mock_server;
pub mod model;
pub mod pact_file;
pub mod plugins;
pub mod registry;
pub mod verifier;

pub use config::{Config, ConfigError};
pub use context::PactContext;
pub use error::{ErrorCategory, PactError, Result};
pub use matching::{MatchConfig, Mismatch, MismatchKind, match_request, match_response};
pub use mock_server::{MatchFailure, MockServerManager};
pub use model::{Body, ContentType, InteractionPart, Pact, PactInteraction, SpecificationVersion};
pub use pact_file::{FsStorage, PactFileError, PactStorage};
pub use plugins::{PluginDriver, PluginInstance, PluginManager};
pub use registry::{InteractionHandle, MessageHandle, PactHandle, Registry, VerifierHandle};
pub use verifier::{BrokerQuery, VerificationReport, VerificationTask, Verifier};
