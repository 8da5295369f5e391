//! Transport errors shared by every component that talks HTTP.
//!
//! Errors are classified as retryable or not so that fetches of remote pact
//! sources can back off on transient failures only.

use thiserror::Error;

/// Failure talking to a provider, broker or pact host.
#[derive(Error, Debug)]
pub enum TransportError {
    /// No response was received
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status
    #[error("Request to {url} failed with status {status}")]
    Status {
        /// Status code returned by the endpoint
        status: u16,
        /// Requested URL
        url: String,
    },

    /// The endpoint rejected the credentials (401 or 403)
    #[error("Request to {url} was not authorised (status {status})")]
    Unauthorized {
        /// 401 or 403
        status: u16,
        /// Requested URL
        url: String,
    },

    /// The endpoint is temporarily unavailable
    #[error("Endpoint unavailable: {0}")]
    Unavailable(String),

    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidInput(String),
}

impl TransportError {
    /// Whether trying again may succeed.
    ///
    /// Connection failures, timeouts and 5xx/429 answers are transient;
    /// everything else is reported straight away.
    ///
    /// # Examples
    ///
    /// ```
    /// use pact_common::TransportError;
    ///
    /// assert!(TransportError::status(503, "http://broker").is_retryable());
    /// assert!(!TransportError::status(404, "http://broker").is_retryable());
    /// ```
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(err) => err.is_connect() || err.is_timeout(),
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Unavailable(_) => true,
            Self::Unauthorized { .. } | Self::InvalidInput(_) => false,
        }
    }

    /// Error for a non-success status code.
    #[must_use]
    pub fn status(status: u16, url: impl Into<String>) -> Self {
        let url = url.into();
        match status {
            401 | 403 => Self::Unauthorized { status, url },
            _ => Self::Status { status, url },
        }
    }

    /// Transient unavailability.
    #[must_use]
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Request that cannot be built.
    #[must_use]
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
