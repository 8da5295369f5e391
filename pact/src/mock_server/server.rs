//! Accept loop and request handling of one mock server.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::state::{MatchFailure, MatchState};
use crate::matching::{MatchConfig, MismatchKind, match_request};
use crate::model::{Body, HttpInteraction, HttpRequest, HttpResponse, MultiValues};
use crate::pact_file::request_to_json;

/// State shared by every connection of a server.
pub(crate) struct Shared {
    pub port: u16,
    pub interactions: Vec<HttpInteraction>,
    pub state: Mutex<MatchState>,
    pub config: MatchConfig,
}

/// Serve connections until the shutdown signal fires.
pub(crate) async fn run(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!(port = shared.port, "Mock server accept loop stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(port = shared.port, error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let shared = shared.clone();
                match tls.clone() {
                    Some(acceptor) => {
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => serve(tls_stream, peer, shared).await,
                                Err(e) => warn!(peer = %peer, error = %e, "TLS handshake failed"),
                            }
                        });
                    }
                    None => {
                        tokio::spawn(serve(stream, peer, shared));
                    }
                }
            }
        }
    }
}

async fn serve<S>(stream: S, peer: SocketAddr, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |request| handle(request, shared.clone()));
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(peer = %peer, error = %e, "Mock server connection closed with error");
    }
}

async fn handle(request: Request<Incoming>, shared: Arc<Shared>) -> Result<Response<Full<Bytes>>, Infallible> {
    let actual = match into_pact_request(request).await {
        Ok(actual) => actual,
        Err(e) => {
            warn!(port = shared.port, error = %e, "Failed to read request body");
            return Ok(error_response(StatusCode::BAD_REQUEST, &json!({ "error": e.to_string() })));
        }
    };
    Ok(respond(&shared, &actual))
}

/// Match a request and build the reply, recording the outcome.
pub(crate) fn respond(shared: &Shared, actual: &HttpRequest) -> Response<Full<Bytes>> {
    let mut best: Option<(usize, Vec<crate::matching::Mismatch>)> = None;

    for (index, interaction) in shared.interactions.iter().enumerate() {
        let mismatches = match_request(&interaction.request, actual, shared.config);
        if mismatches.is_empty() {
            shared.state.lock().record_match(index);
            info!(
                port = shared.port,
                method = %actual.method,
                path = %actual.path,
                interaction = %interaction.description,
                "Request matched"
            );
            return success_response(&interaction.response);
        }
        let same_endpoint = !mismatches
            .iter()
            .any(|m| matches!(m.kind(), MismatchKind::Method | MismatchKind::Path));
        let better = best.as_ref().is_none_or(|(_, current)| mismatches.len() < current.len());
        if same_endpoint && better {
            best = Some((index, mismatches));
        }
    }

    let failure = match best {
        Some((index, mismatches)) => {
            warn!(
                port = shared.port,
                method = %actual.method,
                path = %actual.path,
                closest = %shared.interactions[index].description,
                mismatches = mismatches.len(),
                "Request did not match"
            );
            MatchFailure::RequestMismatch {
                method: actual.method.clone(),
                path: actual.path.clone(),
                mismatches,
            }
        }
        None => {
            warn!(
                port = shared.port,
                method = %actual.method,
                path = %actual.path,
                "Unexpected request"
            );
            MatchFailure::RequestNotFound {
                method: actual.method.clone(),
                path: actual.path.clone(),
                request: request_to_json(actual),
            }
        }
    };

    let body = match &failure {
        MatchFailure::RequestMismatch { mismatches, .. } => json!({
            "error": format!("Request-Mismatch: {} {}", actual.method, actual.path),
            "mismatches": mismatches,
        }),
        _ => json!({
            "error": format!("Unexpected-Request: {} {}", actual.method, actual.path),
            "mismatches": [],
        }),
    };
    shared.state.lock().record_failure(failure);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, &body)
}

fn error_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
        .headers_mut()
        .insert(HeaderName::from_static("x-pact"), HeaderValue::from_static("mismatch"));
    response
}

fn success_response(expected: &HttpResponse) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(expected.body.bytes()));
    *response.status_mut() = StatusCode::from_u16(expected.status).unwrap_or(StatusCode::OK);

    let headers = response.headers_mut();
    for (name, values) in &expected.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(header = %name, "Skipping invalid response header name");
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    if !headers.contains_key(CONTENT_TYPE) {
        if let Some(content_type) = expected.body.effective_content_type() {
            if let Ok(value) = HeaderValue::from_str(&content_type.to_string()) {
                headers.insert(CONTENT_TYPE, value);
            }
        }
    }
    response
}

async fn into_pact_request(request: Request<Incoming>) -> Result<HttpRequest, hyper::Error> {
    let (parts, body) = request.into_parts();
    let bytes = body.collect().await?.to_bytes();

    let mut headers = MultiValues::new();
    for (name, value) in &parts.headers {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let mut query = MultiValues::new();
    if let Some(q) = parts.uri.query() {
        for (key, value) in url::form_urlencoded::parse(q.as_bytes()) {
            query.entry(key.into_owned()).or_default().push(value.into_owned());
        }
    }

    let content_type = headers
        .get("content-type")
        .and_then(|values| values.first())
        .and_then(|value| value.parse().ok());

    Ok(HttpRequest {
        method: parts.method.as_str().to_uppercase(),
        path: percent_decode(parts.uri.path()),
        query,
        headers,
        body: Body::from_bytes(bytes, content_type),
        matching_rules: crate::model::MatchingRules::default(),
    })
}

/// Decode `%XX` escapes; invalid escapes are kept as written.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(byte) = hex {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(interactions: Vec<HttpInteraction>) -> Shared {
        Shared {
            port: 0,
            state: Mutex::new(MatchState::new(interactions.len())),
            interactions,
            config: MatchConfig::default(),
        }
    }

    fn get(path: &str) -> HttpRequest {
        HttpRequest {
            path: path.into(),
            ..HttpRequest::default()
        }
    }

    fn interaction(description: &str, path: &str, status: u16) -> HttpInteraction {
        let mut interaction = HttpInteraction::new(description);
        interaction.request.path = path.into();
        interaction.response.status = status;
        interaction
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("/a%20b/%zz"), "/a b/%zz");
        assert_eq!(percent_decode("/caf%C3%A9"), "/café");
    }

    #[test]
    fn test_first_matching_interaction_wins() {
        let shared = shared(vec![interaction("one", "/x", 201), interaction("two", "/x", 202)]);
        let response = respond(&shared, &get("/x"));
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(!shared.state.lock().all_matched());
    }

    #[test]
    fn test_unknown_request_is_recorded() {
        let shared = shared(vec![interaction("one", "/x", 200)]);
        let response = respond(&shared, &get("/y"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let state = shared.state.lock();
        assert!(matches!(state.failures()[0], MatchFailure::RequestNotFound { .. }));
    }

    #[test]
    fn test_near_miss_is_request_mismatch() {
        let mut expected = interaction("one", "/x", 200);
        expected.request.query.insert("q".into(), vec!["1".into()]);
        let shared = shared(vec![expected]);
        respond(&shared, &get("/x"));
        let state = shared.state.lock();
        assert!(matches!(state.failures()[0], MatchFailure::RequestMismatch { .. }));
    }

    #[test]
    fn test_response_content_type_defaults_from_body() {
        let mut expected = interaction("one", "/x", 200);
        expected.response.body = Body::from_text("{}", Some(crate::model::ContentType::json()));
        let shared = shared(vec![expected]);
        let response = respond(&shared, &get("/x"));
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    }
}
