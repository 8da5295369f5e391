//! Self-signed TLS for mock servers.

use std::sync::Arc;

use rcgen::{CertificateParams, KeyPair};
use rustls::ServerConfig;
use rustls::pki_types::PrivatePkcs8KeyDer;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::error::{PactError, Result};

/// Acceptor plus the PEM of its certificate, handed to clients that need
/// to trust it.
pub(crate) struct SelfSigned {
    pub acceptor: TlsAcceptor,
    pub certificate_pem: String,
}

fn tls_error(e: impl std::fmt::Display) -> PactError {
    PactError::TlsConfiguration(e.to_string())
}

/// Generate a certificate for `localhost` and `127.0.0.1`.
pub(crate) fn self_signed() -> Result<SelfSigned> {
    let key_pair = KeyPair::generate().map_err(tls_error)?;
    let params =
        CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()]).map_err(tls_error)?;
    let certificate = params.self_signed(&key_pair).map_err(tls_error)?;
    let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(vec![certificate.der().clone()], key.into())
        .map_err(tls_error)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    debug!("Generated self-signed mock server certificate");

    Ok(SelfSigned {
        acceptor: TlsAcceptor::from(Arc::new(config)),
        certificate_pem: certificate.pem(),
    })
}
