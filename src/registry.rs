//! Path-keyed registry of open storage coordinators.
//!
//! Several projects can be open in one process. Each resolved store
//! directory maps to exactly one [`StorageCoordinator`]; opening the same
//! directory twice returns the instance already open. The registry is an
//! ordinary value owned by the application context, and its entries live
//! until [`CoordinatorRegistry::close`] or [`CoordinatorRegistry::close_all`].

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::DbConfig;
use crate::storage::StorageCoordinator;

#[derive(Default)]
pub struct CoordinatorRegistry {
    entries: Mutex<HashMap<PathBuf, Arc<StorageCoordinator>>>,
}

impl CoordinatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the coordinator for `dir`, opening it on first use.
    ///
    /// The lock is held across initialization so two concurrent opens of the
    /// same directory cannot both construct a coordinator.
    pub async fn open(&self, dir: &Path, config: &DbConfig) -> Result<Arc<StorageCoordinator>> {
        let key = resolve(dir)?;
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(&key) {
            if !existing.is_closed() {
                return Ok(Arc::clone(existing));
            }
        }

        let coordinator = Arc::new(StorageCoordinator::initialize(&key, config).await?);
        entries.insert(key.clone(), Arc::clone(&coordinator));
        debug!(dir = %key.display(), "registered storage coordinator");
        Ok(coordinator)
    }

    pub async fn get(&self, dir: &Path) -> Option<Arc<StorageCoordinator>> {
        let key = resolve(dir).ok()?;
        self.entries.lock().await.get(&key).cloned()
    }

    /// Disconnect and forget the coordinator for `dir`. Returns whether one was open.
    pub async fn close(&self, dir: &Path) -> Result<bool> {
        let key = resolve(dir)?;
        let removed = self.entries.lock().await.remove(&key);
        match removed {
            Some(coordinator) => {
                coordinator.disconnect().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = self.entries.lock().await.drain().collect();
        for (_, coordinator) in drained {
            coordinator.disconnect().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Canonical key for a store directory. The directory is created so that
/// two spellings of the same path resolve identically.
fn resolve(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create store directory {}", dir.display()))?;
    dir.canonicalize()
        .with_context(|| format!("Failed to resolve store directory {}", dir.display()))
}
