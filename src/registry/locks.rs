//! Per-resource Lock Registry
//!
//! Lazily created async mutexes keyed by resource name. Guards are owned so
//! they can be held across await points and moved into tasks.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed async mutexes
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the mutex for `key`
    pub fn handle(&self, key: &str) -> Arc<Mutex<()>> {
        if let Some(existing) = self.locks.get(key) {
            return existing.clone();
        }
        self.locks.entry(key.to_string()).or_default().clone()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.handle(key).lock_owned().await
    }

    /// Evict the entry for `key`. Holders of an existing guard keep it; the
    /// next caller gets a fresh mutex.
    pub fn remove(&self, key: &str) -> bool {
        self.locks.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.locks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
