//! Shared test utilities for the pact engine.
//!
//! This crate provides:
//! - Proptest generators for contract values
//! - A counting in-process plugin driver
//! - Pact fixtures on disk and in a registry

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod mocks;

pub use generators::*;
