use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{Config, ConfigError};
use crate::services::lease::LeaseManager;
use crate::services::registry::{RegistryStore, http};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The registry process: HTTP surface plus the eviction sweep.
pub struct RegistryServer {
    listener: TcpListener,
    store: RegistryStore,
    lease_manager: LeaseManager,
}

impl RegistryServer {
    pub async fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr = config.bind_address()?;
        let listener = TcpListener::bind(addr).await?;

        // 初始化服务注册表
        let store = RegistryStore::new(config.registry.clone());
        let lease_manager = LeaseManager::new(
            store.clone(),
            config.sweep_interval(),
            config.self_preservation.clone(),
        );

        Ok(Self {
            listener,
            store,
            lease_manager,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    pub fn lease_manager(&self) -> &LeaseManager {
        &self.lease_manager
    }

    /// Serves until `shutdown` is cancelled, then waits for the sweep task.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let tracker = TaskTracker::new();
        self.lease_manager.spawn(&tracker, shutdown.clone());
        tracker.close();

        let addr = self.listener.local_addr()?;
        let app = http::router(self.store.clone(), self.lease_manager.clone());
        tracing::info!(addr = %addr, "Registry server listening");

        let result = axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await;

        // serve 出错时也要停掉清理任务
        shutdown.cancel();
        tracker.wait().await;
        tracing::info!(instances = self.store.len(), "Registry server stopped");

        Ok(result?)
    }
}
