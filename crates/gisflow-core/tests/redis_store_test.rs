// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the Redis store, lock and queue backends.
//!
//! Skipped unless TEST_REDIS_URL is set.

use std::sync::Arc;
use std::time::Duration;

use gisflow_core::lock::MapsetLock;
use gisflow_core::queue::{JobQueue, QueueMessage, RedisJobQueue};
use gisflow_core::store::{KeyValueStore, RedisStore};
use uuid::Uuid;

/// Helper macro to skip tests if Redis URL is not set.
macro_rules! skip_if_no_redis {
    () => {
        if std::env::var("TEST_REDIS_URL").is_err() {
            eprintln!("Skipping test: TEST_REDIS_URL not set");
            return;
        }
    };
}

async fn store() -> RedisStore {
    let url = std::env::var("TEST_REDIS_URL").unwrap();
    RedisStore::connect(&url).await.unwrap()
}

#[tokio::test]
async fn test_redis_conditional_writes() {
    skip_if_no_redis!();
    let store = store().await;
    let key = format!("gisflow-test-{}", Uuid::new_v4());

    assert!(store.health_check().await.unwrap());
    assert!(!store.set_if_present(&key, "1", Duration::from_secs(5)).await.unwrap());
    assert!(store.set_if_absent(&key, "1", Duration::from_secs(5)).await.unwrap());
    assert!(!store.set_if_absent(&key, "2", Duration::from_secs(5)).await.unwrap());
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("1"));
    assert!(store.del(&key).await.unwrap());
}

#[tokio::test]
async fn test_redis_lock_mutual_exclusion() {
    skip_if_no_redis!();
    let lock = MapsetLock::new(Arc::new(store().await));
    let id = format!("group/loc/{}", Uuid::new_v4());

    let (a, b) = tokio::join!(
        lock.lock(&id, Duration::from_secs(5)),
        lock.lock(&id, Duration::from_secs(5))
    );
    assert!(a.unwrap() ^ b.unwrap(), "exactly one caller must win");
    lock.unlock(&id).await.unwrap();
}

#[tokio::test]
async fn test_redis_queue_roundtrip() {
    skip_if_no_redis!();
    let store = store().await;
    let queue = RedisJobQueue::new(store.connection(), format!("gisflow-queue-{}", Uuid::new_v4()));

    queue.push(QueueMessage::Stop).await.unwrap();
    assert_eq!(
        queue.pop(Duration::from_millis(100)).await.unwrap(),
        Some(QueueMessage::Stop)
    );
    assert!(queue.pop(Duration::from_millis(60)).await.unwrap().is_none());
}
