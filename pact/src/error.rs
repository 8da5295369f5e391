//! Error taxonomy of the engine.
//!
//! Mismatches found while matching are data and never surface here. Only
//! setup-level misuse (bad handle, bad argument, unavailable resources) is
//! reported as a [`PactError`].

use pact_common::TransportError;
use thiserror::Error;

use crate::registry::HandleKind;

/// Result alias used across the crate.
pub type Result<T, E = PactError> = std::result::Result<T, E>;

/// Errors raised by the contract model, mock server, plugins and verifier.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PactError {
    /// Handle does not resolve (stale, destroyed or never created)
    #[error("Invalid {kind} handle {id}")]
    InvalidHandle {
        /// Kind of handle that was looked up
        kind: HandleKind,
        /// Raw handle value
        id: u32,
    },

    /// Mutation attempted after activation
    #[error("{0} can no longer be modified")]
    Frozen(String),

    /// Malformed input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Interaction description already used in the same pact
    #[error("An interaction with description '{0}' already exists in this pact")]
    DuplicateDescription(String),

    /// Message handle used with an operation for the other message kind
    #[error("Message handle {0} does not refer to a {1}")]
    WrongInteractionKind(u32, &'static str),

    /// Mock server address could not be parsed or resolved
    #[error("Invalid mock server address '{0}'")]
    AddressInvalid(String),

    /// Mock server listener could not be bound
    #[error("Could not bind mock server to {address}: {source}")]
    BindFailure {
        /// Requested address
        address: String,
        /// Underlying socket error
        source: std::io::Error,
    },

    /// Self-signed certificate or TLS acceptor could not be built
    #[error("TLS configuration failed: {0}")]
    TlsConfiguration(String),

    /// No mock server is registered on the port
    #[error("No mock server running on port {0}")]
    MockServerNotFound(u16),

    /// Plugin could not be found or started
    #[error("Failed to load plugin {name}: {reason}")]
    PluginLoad {
        /// Plugin name
        name: String,
        /// Failure description
        reason: String,
    },

    /// Plugin answered with content the engine cannot use
    #[error("Plugin protocol error: {0}")]
    PluginProtocol(String),

    /// Plugin reported an error for the request
    #[error("Plugin reported an error: {0}")]
    PluginReported(String),

    /// A verification run is already in flight for the handle
    #[error("Verification is already executing for verifier {0}")]
    AlreadyExecuting(u32),

    /// Remote fetch failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Pact file could not be read, merged or written
    #[error(transparent)]
    PactFile(#[from] crate::pact_file::PactFileError),

    /// File system error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error category used by the boundary to pick a result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Unknown, stale or destroyed handle
    InvalidHandle,
    /// Mutation after activation
    Frozen,
    /// Malformed input
    InvalidArgument,
    /// Listener could not be bound
    BindFailure,
    /// Address could not be parsed or resolved
    AddressInvalid,
    /// Plugin failed to load or reported an internal error
    PluginFailure,
    /// Plugin exchange carried unusable content
    PluginProtocolError,
    /// Remote or local I/O failure
    Io,
    /// Anything unexpected
    InternalFault,
}

impl ErrorCategory {
    /// Get the string representation of the category.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidHandle => "INVALID_HANDLE",
            Self::Frozen => "FROZEN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::BindFailure => "BIND_FAILURE",
            Self::AddressInvalid => "ADDRESS_INVALID",
            Self::PluginFailure => "PLUGIN_FAILURE",
            Self::PluginProtocolError => "PLUGIN_PROTOCOL_ERROR",
            Self::Io => "IO",
            Self::InternalFault => "INTERNAL_FAULT",
        }
    }
}

impl PactError {
    /// Category of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidHandle { .. } => ErrorCategory::InvalidHandle,
            Self::Frozen(_) => ErrorCategory::Frozen,
            Self::InvalidArgument(_)
            | Self::DuplicateDescription(_)
            | Self::WrongInteractionKind(..)
            | Self::AlreadyExecuting(_)
            | Self::Json(_) => ErrorCategory::InvalidArgument,
            Self::AddressInvalid(_) => ErrorCategory::AddressInvalid,
            Self::BindFailure { .. } | Self::TlsConfiguration(_) => ErrorCategory::BindFailure,
            Self::MockServerNotFound(_) => ErrorCategory::InvalidHandle,
            Self::PluginLoad { .. } | Self::PluginReported(_) => ErrorCategory::PluginFailure,
            Self::PluginProtocol(_) => ErrorCategory::PluginProtocolError,
            Self::Transport(_) | Self::Io(_) | Self::PactFile(_) => ErrorCategory::Io,
            Self::Internal(_) => ErrorCategory::InternalFault,
        }
    }

    /// Create an invalid argument error with the given message.
    #[must_use]
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an internal error with the given message.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error was raised because of a frozen pact.
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        matches!(self, Self::Frozen(_))
    }
}
