// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource status logger.
//!
//! Status records are stored as JSON under
//! `RESOURCE-LOG::{user_id}/{resource_id}/{iteration}` and expire after the
//! configured resource expiration time. Termination requests are a separate
//! flag key polled by the running worker between steps.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::CoreError;
use crate::resource::ResourceStatusRecord;
use crate::store::KeyValueStore;

const LOG_PREFIX: &str = "RESOURCE-LOG::";
const TERMINATE_PREFIX: &str = "RESOURCE-TERMINATE::";

/// Reads and writes resource status records and termination flags.
#[derive(Clone)]
pub struct ResourceLogger {
    store: Arc<dyn KeyValueStore>,
    expiration: Duration,
}

impl ResourceLogger {
    /// Create a logger whose records expire after `expiration`.
    pub fn new(store: Arc<dyn KeyValueStore>, expiration: Duration) -> Self {
        Self { store, expiration }
    }

    fn log_key(user_id: &str, resource_id: &str, iteration: u32) -> String {
        format!("{LOG_PREFIX}{user_id}/{resource_id}/{iteration}")
    }

    fn terminate_key(user_id: &str, resource_id: &str, iteration: u32) -> String {
        format!("{TERMINATE_PREFIX}{user_id}/{resource_id}/{iteration}")
    }

    /// Write a status record, replacing the previous one.
    pub async fn commit(&self, record: &ResourceStatusRecord) -> Result<(), CoreError> {
        let key = Self::log_key(&record.user_id, &record.resource_id, record.iteration);
        let value = serde_json::to_string(record)?;
        self.store.set(&key, &value, Some(self.expiration)).await?;
        debug!(
            resource_id = %record.resource_id,
            iteration = record.iteration,
            status = %record.status,
            "Status record committed"
        );
        Ok(())
    }

    /// Read a status record.
    pub async fn get(
        &self,
        user_id: &str,
        resource_id: &str,
        iteration: u32,
    ) -> Result<Option<ResourceStatusRecord>, CoreError> {
        let key = Self::log_key(user_id, resource_id, iteration);
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Delete a status record.
    pub async fn delete(
        &self,
        user_id: &str,
        resource_id: &str,
        iteration: u32,
    ) -> Result<bool, CoreError> {
        self.store
            .del(&Self::log_key(user_id, resource_id, iteration))
            .await
    }

    /// Request cooperative termination of a running job.
    pub async fn commit_termination(
        &self,
        user_id: &str,
        resource_id: &str,
        iteration: u32,
    ) -> Result<(), CoreError> {
        let key = Self::terminate_key(user_id, resource_id, iteration);
        self.store.set(&key, "1", Some(self.expiration)).await?;
        info!(resource_id = %resource_id, iteration, "Termination requested");
        Ok(())
    }

    /// Whether termination was requested.
    pub async fn get_termination(
        &self,
        user_id: &str,
        resource_id: &str,
        iteration: u32,
    ) -> Result<bool, CoreError> {
        let key = Self::terminate_key(user_id, resource_id, iteration);
        Ok(self.store.get(&key).await?.is_some())
    }

    /// Clear a termination request.
    pub async fn delete_termination(
        &self,
        user_id: &str,
        resource_id: &str,
        iteration: u32,
    ) -> Result<(), CoreError> {
        self.store
            .del(&Self::terminate_key(user_id, resource_id, iteration))
            .await?;
        Ok(())
    }
}
