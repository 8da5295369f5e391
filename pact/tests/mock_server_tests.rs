//! Consumer flow tests: build a pact, drive its mock server over HTTP, and
//! write the pact file.

use std::sync::Arc;

use pact_engine::mock_server::MatchFailure;
use pact_engine::pact_file::read_pact;
use pact_engine::{Config, MatchConfig, MismatchKind, PactContext, PactError};
use pact_test_utils::fixtures::{create_user_interaction, data_interaction};
use pact_test_utils::mocks::FakePluginDriver;
use serde_json::{Value, json};

fn context() -> PactContext {
    PactContext::with_driver(Config::default(), Arc::new(FakePluginDriver::new("echo", "application/x-echo")))
        .unwrap()
}

fn start(context: &PactContext, pact: pact_engine::PactHandle, tls: bool) -> (u16, String) {
    let port = context
        .create_mock_server(pact, "127.0.0.1:0", tls, MatchConfig::default())
        .unwrap();
    let url = context.mock_servers.url(port).unwrap();
    (port, url)
}

#[tokio::test]
async fn test_matched_request_and_pact_file() {
    let context = context();
    let dir = tempfile::tempdir().unwrap();
    let pact = context.registry.new_pact("Web", "Data API");
    data_interaction(&context.registry, pact).unwrap();
    let (port, url) = start(&context, pact, false);

    let response = reqwest::get(format!("{url}/data")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.json::<Value>().await.unwrap(), json!({"ok": true}));
    assert!(context.mock_servers.matched(port));
    assert_eq!(context.mock_servers.mismatches_json(port), Some(json!([])));

    let location = context.write_mock_server_pact(port, dir.path(), true).unwrap();
    let written = read_pact(std::path::Path::new(&location)).unwrap();
    assert_eq!(written.consumer, "Web");
    assert_eq!(written.interactions.len(), 1);

    // Writing again with overwrite replaces rather than appends.
    context.write_mock_server_pact(port, dir.path(), true).unwrap();
    assert_eq!(read_pact(std::path::Path::new(&location)).unwrap().interactions.len(), 1);
    assert!(context.mock_servers.cleanup(port));
}

#[tokio::test]
async fn test_unexpected_request_is_reported() {
    let context = context();
    let pact = context.registry.new_pact("Web", "Data API");
    data_interaction(&context.registry, pact).unwrap();
    let (port, url) = start(&context, pact, false);

    let response = reqwest::get(format!("{url}/wrong")).await.unwrap();
    assert_eq!(response.status(), 500);
    assert!(!context.mock_servers.matched(port));

    let failures = context.mock_servers.mismatches(port).unwrap();
    assert_eq!(failures.len(), 2);
    assert!(matches!(&failures[0], MatchFailure::RequestNotFound { path, .. } if path == "/wrong"));
    assert!(matches!(&failures[1], MatchFailure::MissingRequest { path, .. } if path == "/data"));
}

#[tokio::test]
async fn test_partial_match_lists_missing_interactions() {
    let context = context();
    let pact = context.registry.new_pact("Web", "Data API");
    data_interaction(&context.registry, pact).unwrap();
    create_user_interaction(&context.registry, pact).unwrap();
    let (port, url) = start(&context, pact, false);

    reqwest::get(format!("{url}/data")).await.unwrap();
    assert!(!context.mock_servers.matched(port));
    let failures = context.mock_servers.mismatches(port).unwrap();
    assert_eq!(failures.len(), 1);
    assert!(matches!(&failures[0], MatchFailure::MissingRequest { method, path, .. } if method == "POST" && path == "/users"));
}

#[tokio::test]
async fn test_body_difference_is_a_request_mismatch() {
    let context = context();
    let pact = context.registry.new_pact("Web", "Users API");
    create_user_interaction(&context.registry, pact).unwrap();
    let (port, url) = start(&context, pact, false);

    let response = reqwest::Client::new()
        .post(format!("{url}/users"))
        .header("X-Request-Id", "42")
        .json(&json!({"name": "Bob"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);

    let failures = context.mock_servers.mismatches(port).unwrap();
    let MatchFailure::RequestMismatch { mismatches, .. } = &failures[0] else {
        panic!("expected a request mismatch, got {failures:?}");
    };
    assert!(mismatches.iter().any(|m| m.kind() == MismatchKind::Body));
}

#[tokio::test]
async fn test_tls_mock_server() {
    let context = context();
    let pact = context.registry.new_pact("Web", "Data API");
    data_interaction(&context.registry, pact).unwrap();
    let (port, url) = start(&context, pact, true);

    assert!(url.starts_with("https://"));
    let certificate = context.mock_servers.tls_certificate(port).unwrap();
    assert!(certificate.contains("BEGIN CERTIFICATE"));

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let response = client.get(format!("{url}/data")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(context.mock_servers.matched(port));
}

#[tokio::test]
async fn test_started_pact_is_frozen() {
    let context = context();
    let pact = context.registry.new_pact("Web", "Data API");
    let interaction = data_interaction(&context.registry, pact).unwrap();
    start(&context, pact, false);

    assert!(matches!(
        context.registry.with_request(interaction, "GET", "/other"),
        Err(PactError::Frozen(_))
    ));
    assert!(matches!(
        context.registry.new_interaction(pact, "another"),
        Err(PactError::Frozen(_))
    ));
}

#[tokio::test]
async fn test_port_in_use_is_a_bind_failure() {
    let context = context();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let pact = context.registry.new_pact("Web", "Data API");

    let result = context.create_mock_server(pact, &address, false, MatchConfig::default());
    assert!(matches!(result, Err(PactError::BindFailure { .. })));
    assert!(!context.registry.is_frozen(pact).unwrap());
}
