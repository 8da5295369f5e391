//! Provider verification against wiremock providers and brokers.

use pact_engine::verifier::InteractionOutcome;
use pact_engine::{BrokerQuery, Config, MismatchKind, Registry, VerifierHandle};
use pact_test_utils::fixtures::{PactDir, get_interaction, pact_document};
use serde_json::json;
use tokio::runtime::Handle;
use wiremock::matchers::{basic_auth, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn verifier_for(registry: &Registry, provider: &str, server: &MockServer) -> VerifierHandle {
    let handle = registry.verifier_new_for_application(&Config::default(), "verifier-tests", "0.1.0");
    let address = server.address();
    registry
        .verifier_set_provider_info(handle, provider, "http", &address.ip().to_string(), Some(address.port()), "")
        .unwrap();
    handle
}

async fn data_provider() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_directory_source_aggregates_results() {
    let provider = data_provider().await;
    let dir = PactDir::new().unwrap();
    let ok = get_interaction("a request for data", "/data", 200, &json!({"ok": true}));
    let missing = get_interaction("a request for something missing", "/missing", 200, &json!({}));
    dir.write("web-data", &pact_document("Web", "data-api", &[ok.clone()])).unwrap();
    dir.write("mobile-data", &pact_document("Mobile", "data-api", &[missing])).unwrap();
    dir.write("web-other", &pact_document("Web", "other-api", &[ok])).unwrap();

    let registry = Registry::new();
    let handle = verifier_for(&registry, "data-api", &provider);
    registry
        .verifier_add_directory_source(handle, &dir.path().to_string_lossy())
        .unwrap();

    let report = registry.verifier_execute(handle, &Handle::current()).unwrap().await.unwrap();
    assert_eq!(report.results.len(), 2, "the other provider's pact is ignored");
    assert!(!report.success());
    assert_eq!(report.count_of(MismatchKind::Status), 1);
    assert_eq!(report.failures().count(), 1);
    assert_eq!(report.failures().next().unwrap().consumer, "Mobile");
    assert_eq!(registry.verifier_last_report(handle).unwrap(), Some(report));
}

#[tokio::test]
async fn test_consumer_filter_limits_pacts() {
    let provider = data_provider().await;
    let dir = PactDir::new().unwrap();
    let ok = get_interaction("a request for data", "/data", 200, &json!({"ok": true}));
    let missing = get_interaction("a request for something missing", "/missing", 200, &json!({}));
    dir.write("web-data", &pact_document("Web", "data-api", &[ok])).unwrap();
    dir.write("mobile-data", &pact_document("Mobile", "data-api", &[missing])).unwrap();

    let registry = Registry::new();
    let handle = verifier_for(&registry, "data-api", &provider);
    registry
        .verifier_add_directory_source(handle, &dir.path().to_string_lossy())
        .unwrap();
    registry.verifier_set_consumer_filters(handle, &["Web"]).unwrap();

    let report = registry.verifier_execute(handle, &Handle::current()).unwrap().await.unwrap();
    assert!(report.success());
    assert_eq!(report.results.len(), 1);
    assert!(matches!(report.results[0].outcome, InteractionOutcome::Passed));
}

#[tokio::test]
async fn test_url_source_with_basic_auth() {
    let provider = data_provider().await;
    let host = MockServer::start().await;
    let document = pact_document(
        "Web",
        "data-api",
        &[get_interaction("a request for data", "/data", 200, &json!({"ok": true}))],
    );
    Mock::given(method("GET"))
        .and(path("/pacts/web"))
        .and(basic_auth("user", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(document))
        .expect(1)
        .mount(&host)
        .await;

    let registry = Registry::new();
    let handle = verifier_for(&registry, "data-api", &provider);
    registry
        .verifier_url_source(handle, &format!("{}/pacts/web", host.uri()), Some("user"), Some("secret"), None)
        .unwrap();

    let report = registry.verifier_execute(handle, &Handle::current()).unwrap().await.unwrap();
    assert!(report.success(), "{report:?}");
}

#[tokio::test]
async fn test_unreachable_url_is_a_source_error() {
    let provider = data_provider().await;
    let host = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&host)
        .await;

    let registry = Registry::new();
    let handle = verifier_for(&registry, "data-api", &provider);
    registry
        .verifier_url_source(handle, &format!("{}/pacts/none", host.uri()), None, None, None)
        .unwrap();

    let report = registry.verifier_execute(handle, &Handle::current()).unwrap().await.unwrap();
    assert!(!report.success());
    assert_eq!(report.source_errors.len(), 1);
    assert!(report.results.is_empty());
}

#[tokio::test]
async fn test_broker_source_pending_and_publishing() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&provider)
        .await;

    let broker = MockServer::start().await;
    let base = broker.uri();
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_links": {
                "pb:provider-pacts-for-verification": {
                    "href": format!("{base}/pacts/provider/{{provider}}/for-verification"),
                    "templated": true
                }
            }
        })))
        .mount(&broker)
        .await;
    Mock::given(method("POST"))
        .and(path("/pacts/provider/data-api/for-verification"))
        .and(body_partial_json(json!({
            "consumerVersionSelectors": [{"tag": "main", "latest": true}],
            "includePendingStatus": true
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_embedded": {
                "pacts": [{
                    "_links": {"self": {"href": format!("{base}/pacts/1")}},
                    "verificationProperties": {"pending": true}
                }]
            }
        })))
        .expect(1)
        .mount(&broker)
        .await;
    let mut document = pact_document(
        "Web",
        "data-api",
        &[get_interaction("a request for data", "/data", 200, &json!({"ok": true}))],
    );
    document["_links"] = json!({
        "pb:publish-verification-results": {"href": format!("{base}/pacts/1/verification-results")}
    });
    Mock::given(method("GET"))
        .and(path("/pacts/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(document))
        .mount(&broker)
        .await;
    Mock::given(method("PUT"))
        .and(path("/pacticipants/data-api/versions/1.2.3/tags/main"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&broker)
        .await;
    Mock::given(method("POST"))
        .and(path("/pacts/1/verification-results"))
        .and(body_partial_json(json!({
            "success": false,
            "providerApplicationVersion": "1.2.3",
            "verifiedBy": {"implementation": "verifier-tests"}
        })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&broker)
        .await;

    let registry = Registry::new();
    let handle = verifier_for(&registry, "data-api", &provider);
    let tags = vec!["main".to_string()];
    registry
        .verifier_broker_source_with_selectors(
            handle,
            BrokerQuery {
                url: &base,
                enable_pending: true,
                consumer_version_tags: &tags,
                ..BrokerQuery::default()
            },
        )
        .unwrap();
    registry
        .verifier_set_publish_options(handle, "1.2.3", None, &["main"], None)
        .unwrap();

    let report = registry.verifier_execute(handle, &Handle::current()).unwrap().await.unwrap();
    assert!(report.results[0].pending);
    assert_eq!(report.count_of(MismatchKind::Status), 1);
    assert!(report.success(), "a pending failure does not fail the run");
}
