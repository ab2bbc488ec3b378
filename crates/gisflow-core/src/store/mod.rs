// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Key-value store interfaces and backends.
//!
//! Status records and mapset lock leases both live in a shared key-value
//! service. The trait is deliberately narrow: plain SET/GET/DEL with optional
//! expiration plus the two conditional writes the lock protocol needs.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoreError;

/// Shared key-value store with expiration.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CoreError>;

    /// Read a value. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, CoreError>;

    /// Delete a key. Returns true if a live key was removed.
    async fn del(&self, key: &str) -> Result<bool, CoreError>;

    /// Store a value only if the key is absent (or expired).
    ///
    /// Returns true if this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, CoreError>;

    /// Overwrite a value only if the key currently exists.
    ///
    /// Returns true if the key existed and was updated.
    async fn set_if_present(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError>;

    /// Check connectivity.
    async fn health_check(&self) -> Result<bool, CoreError> {
        Ok(true)
    }
}
