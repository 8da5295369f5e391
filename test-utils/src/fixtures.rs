//! Pact fixtures.
//!
//! Ready-made interactions registered through the consumer operations, and
//! pact documents written to temporary directories for the verifier.

use std::path::{Path, PathBuf};

use pact_engine::{InteractionHandle, InteractionPart, PactHandle, Registry, Result};
use serde_json::{Value, json};
use tempfile::TempDir;

/// Register `GET /data` answered by `200 {"ok":true}`.
///
/// # Errors
///
/// Returns the registry error when the pact is unknown or frozen.
pub fn data_interaction(registry: &Registry, pact: PactHandle) -> Result<InteractionHandle> {
    let interaction = registry.new_interaction(pact, "a request for data")?;
    registry.with_request(interaction, "GET", "/data")?;
    registry.response_status(interaction, 200)?;
    registry.with_body(interaction, InteractionPart::Response, Some("application/json"), r#"{"ok":true}"#)?;
    Ok(interaction)
}

/// Register `POST /users` with a JSON body, answered by `201`.
///
/// # Errors
///
/// Returns the registry error when the pact is unknown or frozen.
pub fn create_user_interaction(registry: &Registry, pact: PactHandle) -> Result<InteractionHandle> {
    let interaction = registry.new_interaction(pact, "a request to create a user")?;
    registry.given(interaction, "no users exist")?;
    registry.with_request(interaction, "POST", "/users")?;
    registry.with_header(interaction, InteractionPart::Request, "X-Request-Id", 0, "42")?;
    registry.with_body(
        interaction,
        InteractionPart::Request,
        Some("application/json"),
        r#"{"name":"Mary"}"#,
    )?;
    registry.response_status(interaction, 201)?;
    Ok(interaction)
}

/// V3 pact document with HTTP interactions.
#[must_use]
pub fn pact_document(consumer: &str, provider: &str, interactions: &[Value]) -> Value {
    json!({
        "consumer": {"name": consumer},
        "provider": {"name": provider},
        "interactions": interactions,
        "metadata": {"pactSpecification": {"version": "3.0.0"}}
    })
}

/// Interaction document for `GET {path}` answered by `status` with a JSON body.
#[must_use]
pub fn get_interaction(description: &str, path: &str, status: u16, body: &Value) -> Value {
    json!({
        "description": description,
        "request": {"method": "GET", "path": path},
        "response": {
            "status": status,
            "headers": {"Content-Type": "application/json"},
            "body": body
        }
    })
}

/// Temporary directory holding pact files.
#[derive(Debug)]
pub struct PactDir {
    dir: TempDir,
}

impl PactDir {
    /// Create an empty directory.
    ///
    /// # Errors
    ///
    /// Returns the I/O error when the directory cannot be created.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self { dir: tempfile::tempdir()? })
    }

    /// Directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a document as `{name}.json` and return its path.
    ///
    /// # Errors
    ///
    /// Returns the I/O error when the file cannot be written.
    pub fn write(&self, name: &str, document: &Value) -> std::io::Result<PathBuf> {
        let path = self.dir.path().join(format!("{name}.json"));
        std::fs::write(&path, document.to_string())?;
        Ok(path)
    }
}
