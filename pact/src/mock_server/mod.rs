//! Mock servers keyed by port.
//!
//! Starting a server freezes its pact. Each server runs its accept loop on
//! the context runtime and keeps its own match log behind a mutex.

mod server;
mod state;
mod tls;

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{info, warn};

pub use state::MatchFailure;

use crate::error::{PactError, Result};
use crate::matching::MatchConfig;
use crate::model::{HttpInteraction, Pact};
use crate::pact_file::{PactStorage, write_pact};
use crate::registry::{PactHandle, Registry};
use server::Shared;
use state::MatchState;

/// A running mock server.
struct MockServer {
    pact: PactHandle,
    snapshot: Pact,
    address: SocketAddr,
    shared: Arc<Shared>,
    shutdown: Option<oneshot::Sender<()>>,
    certificate_pem: Option<String>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Registry of running mock servers.
#[derive(Default)]
pub struct MockServerManager {
    servers: Mutex<HashMap<u16, MockServer>>,
}

impl std::fmt::Debug for MockServerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServerManager")
            .field("ports", &self.servers.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

fn resolve_address(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| PactError::AddressInvalid(address.to_string()))
}

impl MockServerManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a server for a pact on `address` (`host:port`, port 0 picks a
    /// free port) and return the bound port.
    ///
    /// The pact is frozen; it is unfrozen again if the server fails to
    /// start.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `AddressInvalid`, `BindFailure` or
    /// `TlsConfiguration`.
    pub fn start(
        &self,
        registry: &Registry,
        pact: PactHandle,
        address: &str,
        tls: bool,
        config: MatchConfig,
        runtime: &Handle,
    ) -> Result<u16> {
        let (snapshot, was_frozen) = registry.freeze(pact)?;
        self.start_frozen(pact, snapshot, address, tls, config, runtime)
            .inspect_err(|e| {
                warn!(pact = pact.id(), error = %e, "Mock server failed to start");
                registry.restore_frozen(pact, was_frozen);
            })
    }

    fn start_frozen(
        &self,
        pact: PactHandle,
        snapshot: Pact,
        address: &str,
        tls: bool,
        config: MatchConfig,
        runtime: &Handle,
    ) -> Result<u16> {
        let requested = resolve_address(address)?;
        let tls = tls.then(tls::self_signed).transpose()?;

        let bind_error = |source: std::io::Error| PactError::BindFailure {
            address: address.to_string(),
            source,
        };
        let std_listener = std::net::TcpListener::bind(requested).map_err(bind_error)?;
        std_listener.set_nonblocking(true).map_err(bind_error)?;
        let bound = std_listener.local_addr().map_err(bind_error)?;
        let listener = {
            let _guard = runtime.enter();
            tokio::net::TcpListener::from_std(std_listener).map_err(bind_error)?
        };

        let interactions: Vec<HttpInteraction> = snapshot.http_interactions().cloned().collect();
        let shared = Arc::new(Shared {
            port: bound.port(),
            state: Mutex::new(MatchState::new(interactions.len())),
            interactions,
            config,
        });
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (acceptor, certificate_pem) = match tls {
            Some(tls) => (Some(tls.acceptor), Some(tls.certificate_pem)),
            None => (None, None),
        };
        runtime.spawn(server::run(listener, acceptor, shared.clone(), shutdown_rx));

        info!(
            port = bound.port(),
            pact = %snapshot.label(),
            tls = certificate_pem.is_some(),
            interactions = shared.interactions.len(),
            "Mock server started"
        );
        self.servers.lock().insert(
            bound.port(),
            MockServer {
                pact,
                snapshot,
                address: bound,
                shared,
                shutdown: Some(shutdown_tx),
                certificate_pem,
            },
        );
        Ok(bound.port())
    }

    /// Every interaction was requested and no request failed.
    ///
    /// `false` for an unknown port.
    pub fn matched(&self, port: u16) -> bool {
        self.servers
            .lock()
            .get(&port)
            .is_some_and(|server| server.shared.state.lock().all_matched())
    }

    /// Recorded failures followed by one `MissingRequest` per interaction
    /// never requested. `None` for an unknown port.
    pub fn mismatches(&self, port: u16) -> Option<Vec<MatchFailure>> {
        let servers = self.servers.lock();
        let server = servers.get(&port)?;
        let state = server.shared.state.lock();
        let mut out = state.failures().to_vec();
        out.extend(state.unmatched().filter_map(|index| {
            server.shared.interactions.get(index).map(|i| MatchFailure::MissingRequest {
                method: i.request.method.clone(),
                path: i.request.path.clone(),
                request: crate::pact_file::request_to_json(&i.request),
            })
        }));
        Some(out)
    }

    /// Mismatches as a JSON array.
    pub fn mismatches_json(&self, port: u16) -> Option<Value> {
        self.mismatches(port)
            .and_then(|failures| serde_json::to_value(failures).ok())
    }

    /// Address the server is bound to.
    pub fn address(&self, port: u16) -> Option<SocketAddr> {
        self.servers.lock().get(&port).map(|server| server.address)
    }

    /// URL of the server (`http://` or `https://`).
    pub fn url(&self, port: u16) -> Option<String> {
        self.servers.lock().get(&port).map(|server| {
            let scheme = if server.certificate_pem.is_some() { "https" } else { "http" };
            format!("{scheme}://{}", server.address)
        })
    }

    /// PEM certificate of a TLS server.
    pub fn tls_certificate(&self, port: u16) -> Option<String> {
        self.servers
            .lock()
            .get(&port)
            .and_then(|server| server.certificate_pem.clone())
    }

    /// Pact served on a port.
    pub fn pact_handle(&self, port: u16) -> Option<PactHandle> {
        self.servers.lock().get(&port).map(|server| server.pact)
    }

    /// Stop a server and release its port. Returns `false` for an unknown
    /// port.
    pub fn cleanup(&self, port: u16) -> bool {
        let removed = self.servers.lock().remove(&port);
        match removed {
            Some(server) => {
                info!(port, pact = %server.snapshot.label(), "Mock server stopped");
                true
            }
            None => false,
        }
    }

    /// Write the pact served on a port.
    ///
    /// Uses the registry's copy when the pact is still live (it may have
    /// gained plugin metadata), else the snapshot taken at start.
    ///
    /// # Errors
    ///
    /// Returns `MockServerNotFound`, or the pact file error.
    pub fn write_pact_file(
        &self,
        registry: &Registry,
        port: u16,
        storage: &dyn PactStorage,
        overwrite: bool,
    ) -> Result<String> {
        let (handle, snapshot) = self
            .servers
            .lock()
            .get(&port)
            .map(|server| (server.pact, server.snapshot.clone()))
            .ok_or(PactError::MockServerNotFound(port))?;
        let pact = registry.pact(handle).unwrap_or(snapshot);
        Ok(write_pact(&pact, storage, overwrite)?)
    }

    /// Whether any server is serving the pact.
    pub fn serves(&self, pact: PactHandle) -> bool {
        self.servers.lock().values().any(|server| server.pact == pact)
    }

    /// Stop every server.
    pub fn shutdown_all(&self) {
        let drained: Vec<_> = self.servers.lock().drain().collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "Stopping mock servers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_address() {
        assert!(matches!(
            resolve_address("not an address"),
            Err(PactError::AddressInvalid(_))
        ));
        assert!(resolve_address("127.0.0.1:0").is_ok());
    }

    #[test]
    fn test_unknown_port() {
        let manager = MockServerManager::new();
        assert!(!manager.matched(1));
        assert!(manager.mismatches(1).is_none());
        assert!(!manager.cleanup(1));
    }

    #[test]
    fn test_start_failure_unfreezes() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let registry = Registry::new();
        let pact = registry.new_pact("C", "P");
        let manager = MockServerManager::new();
        let result = manager.start(&registry, pact, "bogus", false, MatchConfig::default(), runtime.handle());
        assert!(matches!(result, Err(PactError::AddressInvalid(_))));
        assert!(!registry.is_frozen(pact).unwrap());
    }
}
