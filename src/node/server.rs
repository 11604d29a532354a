//! Shard node server

use crate::catalog::{ConfigServer, LocalDistLockManager};
use crate::common::{Config, Result};
use crate::node::http::{create_router, NodeState};
use crate::sharding::{start_range_deleter_task, LocalMetadataStore, ShardService, ShardingState};
use crate::storage::Storage;
use std::sync::Arc;
use tokio::sync::watch;

pub const STORE_DIR: &str = "shard.db";

pub struct ShardNode {
    config: Config,
}

impl ShardNode {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        let server = &self.config.server;
        tracing::info!("Starting shard node: {}", self.config.node_id);
        tracing::info!("  HTTP API: {}", server.bind_addr);
        tracing::info!("  Data dir: {}", server.data_dir.display());
        tracing::info!("  Range deleter batch: {}", self.config.range_deleter.batch_size);

        let store = Arc::new(LocalMetadataStore::open(server.data_dir.join(STORE_DIR))?);

        let sharding = Arc::new(ShardingState::new());
        sharding.initialize_from_store(&store)?;

        // Embedded config service and lock manager for single-process clusters
        let config_server = Arc::new(ConfigServer::new());
        let dist_lock = Arc::new(LocalDistLockManager::new());

        let service = Arc::new(ShardService::new(
            self.config.clone(),
            sharding.clone(),
            Arc::new(Storage::new()),
            config_server.clone(),
            dist_lock,
            Some(store.clone()),
        )?);

        // Restored range deletions are validated against primed metadata
        if sharding.enabled() {
            let priming = sharding.prime_metadata_cache(service.metadata().clone())?;
            if let Err(e) = priming.await {
                tracing::error!("Metadata cache priming task failed: {}", e);
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let deleter = start_range_deleter_task(
            service.range_deleters().clone(),
            self.config.range_deleter.clone(),
            shutdown_rx,
        );

        let router = create_router(NodeState {
            service: service.clone(),
            config_server: Some(config_server),
        });
        let listener = tokio::net::TcpListener::bind(server.bind_addr).await?;

        tracing::info!("Shard node ready ({})", sharding.state().name());

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
                tracing::info!("Shutting down");
            })
            .await;
        if let Err(e) = &served {
            tracing::error!("HTTP server error: {}", e);
        }

        let _ = shutdown_tx.send(true);
        if let Err(e) = deleter.await {
            tracing::error!("Range deleter task failed: {}", e);
        }
        store.flush()?;

        served.map_err(Into::into)
    }
}
