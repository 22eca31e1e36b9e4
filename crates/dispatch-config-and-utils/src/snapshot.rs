//! Versioned configuration snapshots.
//!
//! Modules never read ambient global settings. They hold a [`ConfigHandle`]
//! and take a [`ConfigSnapshot`] at the start of each operation; every update
//! publishes a new snapshot with a higher version to subscribers.

use crate::{CoreResult, DispatchConfig};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// An immutable view of the configuration at one version.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub config: Arc<DispatchConfig>,
}

/// Shared handle publishing configuration snapshots.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    sender: Arc<watch::Sender<ConfigSnapshot>>,
}

impl ConfigHandle {
    /// Creates a handle whose first snapshot has version 1.
    pub fn new(config: DispatchConfig) -> CoreResult<Self> {
        config.validate()?;
        let (sender, _) = watch::channel(ConfigSnapshot {
            version: 1,
            config: Arc::new(config),
        });
        Ok(Self {
            sender: Arc::new(sender),
        })
    }

    /// The snapshot in effect right now.
    pub fn current(&self) -> ConfigSnapshot {
        self.sender.borrow().clone()
    }

    /// Applies `f` to a copy of the current config and publishes the result.
    ///
    /// Invalid results are rejected and the current snapshot stays in effect.
    pub fn update<F>(&self, f: F) -> CoreResult<ConfigSnapshot>
    where
        F: FnOnce(&mut DispatchConfig),
    {
        let current = self.current();
        let mut next = (*current.config).clone();
        f(&mut next);
        self.publish(current.version, next)
    }

    /// Replaces the whole configuration.
    pub fn replace(&self, config: DispatchConfig) -> CoreResult<ConfigSnapshot> {
        let current = self.current();
        self.publish(current.version, config)
    }

    /// Receives every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<ConfigSnapshot> {
        self.sender.subscribe()
    }

    fn publish(&self, previous: u64, config: DispatchConfig) -> CoreResult<ConfigSnapshot> {
        config.validate()?;
        let snapshot = ConfigSnapshot {
            version: previous + 1,
            config: Arc::new(config),
        };
        self.sender.send_replace(snapshot.clone());
        info!(version = snapshot.version, "Configuration updated");
        Ok(snapshot)
    }
}
