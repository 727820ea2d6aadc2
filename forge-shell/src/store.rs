//! Record store for the shell, optionally backed by a JSON snapshot file.

use forge_core::MemoryStore;

use crate::config::ShellConfig;
use crate::error::ShellError;

/// Load the snapshot at `store_path` when it exists, else start empty.
pub async fn open_store(config: &ShellConfig) -> Result<MemoryStore, ShellError> {
    let Some(path) = &config.store_path else {
        return Ok(MemoryStore::new());
    };
    if !tokio::fs::try_exists(path).await? {
        log::info!("No record snapshot at {}, starting empty", path.display());
        return Ok(MemoryStore::new());
    }
    Ok(MemoryStore::load_snapshot(path).await?)
}

/// Write the store back to `store_path`, if one is configured.
pub async fn persist_store(config: &ShellConfig, store: &MemoryStore) -> Result<(), ShellError> {
    if let Some(path) = &config.store_path {
        store.save_snapshot(path).await?;
    }
    Ok(())
}
