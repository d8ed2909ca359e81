pub mod abstraction;
pub mod cursor;
pub mod migrations;
mod repo;

use std::sync::Arc;

use abstraction::StorageEngine;
use tracing::info;

use crate::{service::mutex, Config, Error, Result};

/// The persistence adapter: one storage engine selected at startup, with the
/// per-service repositories implemented on top of it (see `repo/`).
pub struct Database {
    pub engine: Arc<dyn StorageEngine>,
}

impl Database {
    /// Opens the configured backend and verifies it is reachable. A backend
    /// that cannot be reached is a fatal startup error.
    pub async fn open(config: &Config, client: reqwest::Client) -> Result<Self> {
        let engine: Arc<dyn StorageEngine> = match config.storage_backend.as_str() {
            "mongodb" => Arc::new(
                abstraction::mongo::Engine::open(&config.mongodb_url, &config.mongodb_database)
                    .await?,
            ),
            "blob" => {
                let blob_config = config
                    .blob
                    .as_ref()
                    .ok_or(Error::BadConfig("Blob backend selected without blob config"))?;
                Arc::new(abstraction::blob::Engine::open(blob_config, client)?)
            }
            "memory" => Arc::new(abstraction::memory::Engine::new()),
            _ => return Err(Error::BadConfig("Storage backend not found.")),
        };

        engine.ping().await?;
        info!("Opened {} storage backend", config.storage_backend);

        Ok(Self { engine })
    }

    /// Runs the legacy import (when configured) and every pending schema
    /// migration, all under the fleet-wide migration lock. A failure here
    /// must abort startup.
    pub async fn migrate(
        &self,
        config: &Config,
        mutex: &mutex::Service,
        client: reqwest::Client,
    ) -> Result<()> {
        let legacy = if config.storage_backend == "mongodb" {
            match &config.blob {
                Some(blob_config) => Some(abstraction::blob::Engine::open(blob_config, client)?),
                None => None,
            }
        } else {
            None
        };

        migrations::run_startup(
            self.engine.as_ref(),
            legacy.as_ref().map(|e| e as &dyn StorageEngine),
            mutex,
        )
        .await
    }
}
