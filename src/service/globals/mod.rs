use std::{
    sync::atomic::{self, AtomicBool},
    time::Duration,
};

use tokio::sync::broadcast;
use tracing::info;

use crate::{Config, Result};

/// Broadcasts the single shutdown cancellation to every long-running task.
pub struct ShutdownHandler(broadcast::Sender<()>);

impl ShutdownHandler {
    pub fn new() -> Self {
        Self(broadcast::channel(1).0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.0.subscribe()
    }

    pub fn fire(&self) {
        let _ = self.0.send(());
    }
}

impl Default for ShutdownHandler {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Service {
    pub config: Config,
    default_client: reqwest::Client,
    rotate: ShutdownHandler,
    pub shutdown: AtomicBool,
}

impl Service {
    pub fn load(config: Config) -> Result<Self> {
        let default_client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            config,
            default_client,
            rotate: ShutdownHandler::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Returns a reqwest client which can be used to send requests
    pub fn default_client(&self) -> reqwest::Client {
        // Client is cheap to clone (Arc wrapper) and avoids lifetime issues
        self.default_client.clone()
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.rotate.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(atomic::Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, atomic::Ordering::Relaxed);
        info!(target: "shutdown", "Received shutdown notification, draining tasks...");
        self.rotate.fire();
    }
}
