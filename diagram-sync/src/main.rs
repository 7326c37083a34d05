use std::sync::Arc;

use diagram_sync::{
    MemorySnapshotStore, RocksSnapshotStore, ServerConfig, SnapshotStore, StoreConfig, SyncError, SyncServer,
};

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    log::info!("Starting diagram-sync server on {}...", config.bind_addr);

    let store: Arc<dyn SnapshotStore> = match &config.storage_path {
        Some(path) => {
            let store = RocksSnapshotStore::open(StoreConfig::at(path.clone()))?;
            log::info!("Persisting snapshots to {}", store.path().display());
            Arc::new(store)
        }
        None => {
            log::warn!("No storage path configured; snapshots are kept in memory only");
            Arc::new(MemorySnapshotStore::new())
        }
    };

    SyncServer::new(config, store).run().await
}
