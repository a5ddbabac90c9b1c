use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::runtime::Runtime;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use crate::config::configuration::{Config, FederatedTypeConfig};
use crate::version::manager::VersionManager;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A federated type handled by this process.
pub struct FederatedType {
    pub config: FederatedTypeConfig,
    pub version_manager: Arc<VersionManager>,
}

pub struct Context {
    config: Config,
    types: Vec<FederatedType>,
    handles: Vec<AbortOnDropHandle<()>>,
    cancellation: CancellationToken,
    runtime: Runtime,
}

impl Context {
    pub fn new(
        config: Config,
        types: Vec<FederatedType>,
        handles: Vec<AbortOnDropHandle<()>>,
        cancellation: CancellationToken,
        runtime: Runtime,
    ) -> Self {
        Self {
            config,
            types,
            handles,
            cancellation,
            runtime,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Version manager of the federated type `federated_kind`, for the
    /// propagation engine.
    pub fn version_manager(&self, federated_kind: &str) -> Option<Arc<VersionManager>> {
        self.types
            .iter()
            .find(|t| t.config.federated.kind == federated_kind)
            .map(|t| t.version_manager.clone())
    }

    pub fn wait_for_termination(&self) -> Result<()> {
        let cloned_token = self.cancellation.clone();
        self.runtime.block_on(async move {
            tokio::select! {
                _ = cloned_token.cancelled() => bail!("Controller was cancelled"),
                _ = signal::ctrl_c() => {},
            };
            Ok(())
        })
    }

    pub fn shutdown(self) -> Result<()> {
        self.cancellation.cancel();
        drop(self.handles);
        // In-flight version writes finish or time out on their own.
        self.runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        Ok(())
    }
}
