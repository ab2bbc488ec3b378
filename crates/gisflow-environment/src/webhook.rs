// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Webhook notifications.
//!
//! Best-effort: delivery failures are logged and never affect the job.

use std::time::Duration;

use gisflow_core::ResourceStatusRecord;
use gisflow_core::chain::Webhooks;
use tracing::{debug, warn};

/// Posts status records to the chain's webhooks.
#[derive(Debug, Clone, Default)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhooks: Webhooks,
    timeout: Duration,
}

impl WebhookNotifier {
    /// Notifier for the given webhooks.
    pub fn new(client: reqwest::Client, webhooks: Webhooks, timeout: Duration) -> Self {
        Self {
            client,
            webhooks,
            timeout,
        }
    }

    /// Send a progress update.
    pub async fn update(&self, record: &ResourceStatusRecord) {
        if let Some(url) = &self.webhooks.update {
            self.post(url, record).await;
        }
    }

    /// Send the terminal record.
    pub async fn finished(&self, record: &ResourceStatusRecord) {
        if let Some(url) = &self.webhooks.finished {
            self.post(url, record).await;
        }
    }

    async fn post(&self, url: &str, record: &ResourceStatusRecord) {
        let result = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(record)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match result {
            Ok(_) => debug!(url = %url, status = %record.status, "Webhook notified"),
            Err(e) => warn!(url = %url, error = %e, "Webhook notification failed"),
        }
    }
}
