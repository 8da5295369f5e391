//! Shared library for cross-cutting concerns of the pact engine.
//!
//! This crate provides centralized implementations for:
//! - Transport error types with retryability classification
//! - HTTP client configuration and building
//! - Retry policies with exponential backoff
//! - Tracing subscriber initialisation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod http;
pub mod retry;
pub mod tracing_config;

pub use error::TransportError;
pub use http::{HttpConfig, build_http_client};
pub use retry::{Backoff, RetryPolicy};
pub use tracing_config::{LogFormat, TracingConfig, init_tracing};
