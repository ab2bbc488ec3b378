// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job submission queue.
//!
//! Multi-producer queue of [`QueueMessage`]s consumed by exactly one queue
//! manager. Producers are the operational layer (enqueue, resume) and the
//! process that owns the manager (which pushes [`QueueMessage::Stop`] on
//! shutdown).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::error::CoreError;
use crate::resource::{Entrypoint, ResourceDataContainer};

/// A job waiting to be run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    /// Engine to run.
    pub entrypoint: Entrypoint,
    /// Job data.
    pub resource: ResourceDataContainer,
    /// Maximum time in the waiting set, in seconds.
    pub wait_timeout_secs: f64,
}

impl QueuedJob {
    /// Create a queued job.
    pub fn new(entrypoint: Entrypoint, resource: ResourceDataContainer, wait_timeout: Duration) -> Self {
        Self {
            entrypoint,
            resource,
            wait_timeout_secs: wait_timeout.as_secs_f64(),
        }
    }

    /// Queue-wait timeout.
    pub fn wait_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.wait_timeout_secs).unwrap_or(Duration::ZERO)
    }
}

/// Message carried by the submission queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueMessage {
    /// Run a job.
    Job(QueuedJob),
    /// Terminate every job and stop the manager.
    Stop,
}

/// Submission queue shared between producers and the queue manager.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a message.
    async fn push(&self, message: QueueMessage) -> Result<(), CoreError>;

    /// Remove the oldest message, waiting at most `wait` for one to arrive.
    async fn pop(&self, wait: Duration) -> Result<Option<QueueMessage>, CoreError>;
}

/// In-process FIFO queue.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobQueue {
    inner: Arc<MemoryQueueInner>,
}

#[derive(Debug, Default)]
struct MemoryQueueInner {
    items: Mutex<VecDeque<QueueMessage>>,
    notify: Notify,
}

impl MemoryJobQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending messages.
    pub async fn len(&self) -> usize {
        self.inner.items.lock().await.len()
    }

    /// Whether no message is pending.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn push(&self, message: QueueMessage) -> Result<(), CoreError> {
        self.inner.items.lock().await.push_back(message);
        self.inner.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, wait: Duration) -> Result<Option<QueueMessage>, CoreError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.inner.notify.notified();
            if let Some(message) = self.inner.items.lock().await.pop_front() {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.inner.items.lock().await.pop_front());
            }
        }
    }
}

/// Redis list queue (RPUSH / LPOP).
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
    name: String,
    poll_interval: Duration,
}

impl RedisJobQueue {
    /// Queue on the Redis list `name`.
    pub fn new(conn: ConnectionManager, name: impl Into<String>) -> Self {
        Self {
            conn,
            name: name.into(),
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn push(&self, message: QueueMessage) -> Result<(), CoreError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&message)?;
        let _: i64 = redis::cmd("RPUSH")
            .arg(&self.name)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        debug!(queue = %self.name, "Message pushed");
        Ok(())
    }

    async fn pop(&self, wait: Duration) -> Result<Option<QueueMessage>, CoreError> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut conn = self.conn.clone();
        loop {
            let raw: Option<String> = redis::cmd("LPOP")
                .arg(&self.name)
                .query_async(&mut conn)
                .await?;
            if let Some(raw) = raw {
                return Ok(Some(serde_json::from_str(&raw)?));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}
