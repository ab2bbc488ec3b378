// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease-based mapset lock.
//!
//! A mapset is identified by `{user_group}/{location}/{mapset}`. Holding the
//! lock means owning a live key in the shared store; the key expires after
//! its TTL so a crashed holder cannot block a mapset forever. Acquisition is
//! a single non-blocking attempt; callers never wait or retry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::CoreError;
use crate::store::KeyValueStore;

const LOCK_PREFIX: &str = "RESOURCE-LOCK::";

/// Build the resource id of a mapset lock.
pub fn mapset_lock_id(user_group: &str, location: &str, mapset: &str) -> String {
    format!("{user_group}/{location}/{mapset}")
}

/// Distributed lock over mapset resource ids.
#[derive(Clone)]
pub struct MapsetLock {
    store: Arc<dyn KeyValueStore>,
}

impl MapsetLock {
    /// Create a lock manager on top of a shared store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(resource_id: &str) -> String {
        format!("{LOCK_PREFIX}{resource_id}")
    }

    fn lease_value(ttl: Duration) -> String {
        let expires = Utc::now() + chrono::Duration::milliseconds(ttl.as_millis() as i64);
        expires.timestamp_millis().to_string()
    }

    /// Try to acquire the lock. Returns false if it is already held.
    pub async fn lock(&self, resource_id: &str, ttl: Duration) -> Result<bool, CoreError> {
        let acquired = self
            .store
            .set_if_absent(&Self::key(resource_id), &Self::lease_value(ttl), ttl)
            .await?;
        if acquired {
            info!(resource_id = %resource_id, ttl_secs = ttl.as_secs(), "Mapset lock acquired");
        } else {
            debug!(resource_id = %resource_id, "Mapset lock already held");
        }
        Ok(acquired)
    }

    /// Extend a held lock. Returns false if the lease is gone (never held or expired).
    pub async fn extend(&self, resource_id: &str, ttl: Duration) -> Result<bool, CoreError> {
        let extended = self
            .store
            .set_if_present(&Self::key(resource_id), &Self::lease_value(ttl), ttl)
            .await?;
        debug!(resource_id = %resource_id, ttl_secs = ttl.as_secs(), extended, "Mapset lock extend");
        Ok(extended)
    }

    /// Release the lock. Returns true if a live lease was removed.
    pub async fn unlock(&self, resource_id: &str) -> Result<bool, CoreError> {
        let removed = self.store.del(&Self::key(resource_id)).await?;
        info!(resource_id = %resource_id, removed, "Mapset lock released");
        Ok(removed)
    }

    /// Whether the lock is currently held by anyone.
    pub async fn get(&self, resource_id: &str) -> Result<bool, CoreError> {
        Ok(self.store.get(&Self::key(resource_id)).await?.is_some())
    }
}

/// A lock the caller tried to take, with a flag recording whether it did.
///
/// Release only touches the store when the flag is set, so cleanup never
/// deletes a lease owned by someone else.
#[derive(Debug, Clone)]
pub struct HeldLock {
    /// Resource id of the lock.
    pub resource_id: String,
    acquired: bool,
}

impl HeldLock {
    /// A lock that has not been acquired yet.
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            acquired: false,
        }
    }

    /// Whether this holder acquired the lock.
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Attempt acquisition once.
    pub async fn acquire(&mut self, lock: &MapsetLock, ttl: Duration) -> Result<bool, CoreError> {
        self.acquired = lock.lock(&self.resource_id, ttl).await?;
        Ok(self.acquired)
    }

    /// Extend the lease if we hold it. Not holding it is a no-op returning false.
    pub async fn extend(&self, lock: &MapsetLock, ttl: Duration) -> Result<bool, CoreError> {
        if !self.acquired {
            return Ok(false);
        }
        lock.extend(&self.resource_id, ttl).await
    }

    /// Release the lease if we hold it. Not holding it is a no-op.
    pub async fn release(&mut self, lock: &MapsetLock) -> Result<(), CoreError> {
        if self.acquired {
            lock.unlock(&self.resource_id).await?;
            self.acquired = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn lock() -> MapsetLock {
        MapsetLock::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_mapset_lock_id() {
        assert_eq!(mapset_lock_id("group", "nc_spm_08", "user1"), "group/nc_spm_08/user1");
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let lock = lock();
        assert!(lock.lock("g/loc/m1", Duration::from_secs(10)).await.unwrap());
        assert!(!lock.lock("g/loc/m1", Duration::from_secs(10)).await.unwrap());
        assert!(lock.get("g/loc/m1").await.unwrap());
        assert!(lock.unlock("g/loc/m1").await.unwrap());
        assert!(!lock.get("g/loc/m1").await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_fails_when_not_held() {
        let lock = lock();
        assert!(!lock.extend("g/loc/none", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_reacquired() {
        let lock = lock();
        assert!(lock.lock("g/loc/m1", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!lock.extend("g/loc/m1", Duration::from_secs(1)).await.unwrap());
        assert!(lock.lock("g/loc/m1", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_held_lock_never_releases_foreign_lease() {
        let lock = lock();
        let mut owner = HeldLock::new("g/loc/m1");
        let mut loser = HeldLock::new("g/loc/m1");

        assert!(owner.acquire(&lock, Duration::from_secs(10)).await.unwrap());
        assert!(!loser.acquire(&lock, Duration::from_secs(10)).await.unwrap());

        loser.release(&lock).await.unwrap();
        assert!(lock.get("g/loc/m1").await.unwrap(), "loser must not unlock");
        assert!(!loser.extend(&lock, Duration::from_secs(10)).await.unwrap());

        owner.release(&lock).await.unwrap();
        assert!(!lock.get("g/loc/m1").await.unwrap());
    }
}
