//! Per-asset lock table.
//!
//! Everything that mutates a cycle serializes on its asset's lock. The quote
//! path must never queue up behind a slow decision, so it only try-locks and
//! drops the quote on contention; trade updates and workers wait.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct AssetLockTable {
    locks: StdMutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl AssetLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, asset_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        locks.entry(asset_id).or_default().clone()
    }

    /// Non-blocking acquire for the quote path. None means another task is
    /// already working this asset.
    pub fn try_acquire(&self, asset_id: i64) -> Option<OwnedMutexGuard<()>> {
        self.entry(asset_id).try_lock_owned().ok()
    }

    /// Blocking acquire for trade updates, which must never be dropped.
    pub async fn acquire(&self, asset_id: i64) -> OwnedMutexGuard<()> {
        self.entry(asset_id).lock_owned().await
    }

    /// Bounded acquire for workers; a worker that cannot get the lock within
    /// its budget skips the asset until the next sweep.
    pub async fn acquire_timeout(
        &self,
        asset_id: i64,
        timeout: Duration,
    ) -> Option<OwnedMutexGuard<()>> {
        tokio::time::timeout(timeout, self.acquire(asset_id)).await.ok()
    }
}
