//! Engine context.
//!
//! Owns every subsystem plus the runtime that drives mock servers and
//! verification runs. The boundary uses one process-wide instance; tests
//! build their own.

use std::path::Path;
use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{PactError, Result};
use crate::matching::MatchConfig;
use crate::mock_server::MockServerManager;
use crate::pact_file::{FsStorage, PactStorage, write_pact};
use crate::plugins::{PluginDriver, PluginManager, ProcessPluginDriver};
use crate::registry::{PactHandle, Registry, VerifierHandle};
use crate::verifier::VerificationTask;

/// Every subsystem of the engine.
pub struct PactContext {
    /// Handle registry
    pub registry: Registry,
    /// Running mock servers
    pub mock_servers: MockServerManager,
    /// Loaded plugins
    pub plugins: PluginManager,
    config: Config,
    runtime: Option<Runtime>,
}

impl std::fmt::Debug for PactContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PactContext")
            .field("registry", &self.registry)
            .field("mock_servers", &self.mock_servers)
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

impl PactContext {
    /// Context whose plugins are started from `config.plugin_dir`.
    ///
    /// # Errors
    ///
    /// Returns `Io` when the runtime cannot be created.
    pub fn new(config: Config) -> Result<Self> {
        let driver = Arc::new(ProcessPluginDriver::new(config.plugin_dir.clone()));
        Self::with_driver(config, driver)
    }

    /// Context with a custom plugin driver.
    ///
    /// # Errors
    ///
    /// Returns `Io` when the runtime cannot be created.
    pub fn with_driver(config: Config, driver: Arc<dyn PluginDriver>) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("pact-engine")
            .build()?;
        debug!(plugin_dir = %config.plugin_dir.display(), "Engine context created");
        Ok(Self {
            registry: Registry::new(),
            mock_servers: MockServerManager::new(),
            plugins: PluginManager::new(driver),
            config,
            runtime: Some(runtime),
        })
    }

    /// Configuration the context was built with.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime
            .as_ref()
            .ok_or_else(|| PactError::internal("engine runtime is shut down"))
    }

    /// Start a mock server for a pact and return its port.
    ///
    /// # Errors
    ///
    /// As [`MockServerManager::start`].
    pub fn create_mock_server(&self, pact: PactHandle, address: &str, tls: bool, config: MatchConfig) -> Result<u16> {
        let runtime = self.runtime()?;
        self.mock_servers
            .start(&self.registry, pact, address, tls, config, runtime.handle())
    }

    /// Write the pact served on a port into `dir`.
    ///
    /// # Errors
    ///
    /// Returns `MockServerNotFound` or the pact file error.
    pub fn write_mock_server_pact(&self, port: u16, dir: &Path, overwrite: bool) -> Result<String> {
        self.mock_servers
            .write_pact_file(&self.registry, port, &FsStorage::new(dir), overwrite)
    }

    /// Write a pact by handle. The pact is frozen afterwards.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` or the pact file error.
    pub fn write_pact(&self, pact: PactHandle, storage: &dyn PactStorage, overwrite: bool) -> Result<String> {
        let (snapshot, was_frozen) = self.registry.freeze(pact)?;
        write_pact(&snapshot, storage, overwrite).map_err(|e| {
            self.registry.restore_frozen(pact, was_frozen);
            PactError::from(e)
        })
    }

    /// Declare that a pact uses a plugin.
    ///
    /// # Errors
    ///
    /// As [`PluginManager::using_plugin`].
    pub fn using_plugin(&self, pact: PactHandle, name: &str, version: Option<&str>) -> Result<()> {
        self.plugins.using_plugin(&self.registry, pact, name, version)
    }

    /// Start a verification run on the engine runtime.
    ///
    /// # Errors
    ///
    /// As [`Registry::verifier_execute`].
    pub fn verifier_execute(&self, handle: VerifierHandle) -> Result<VerificationTask> {
        let runtime = self.runtime()?;
        self.registry.verifier_execute(handle, runtime.handle())
    }

    /// Handle of the engine runtime.
    ///
    /// # Errors
    ///
    /// Returns `Internal` once the context is shut down.
    pub fn runtime_handle(&self) -> Result<&tokio::runtime::Handle> {
        Ok(self.runtime()?.handle())
    }

    /// Wait for a future on the engine runtime.
    ///
    /// Must not be called from inside the runtime.
    ///
    /// # Errors
    ///
    /// Returns `Internal` once the context is shut down.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> Result<F::Output> {
        Ok(self.runtime()?.block_on(future))
    }

    /// Stop mock servers and plugins.
    pub fn shutdown(&self) {
        self.mock_servers.shutdown_all();
        self.plugins.shutdown_all();
    }
}

impl Drop for PactContext {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        info!("Engine context stopped");
    }
}
