// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runner for testing.
//!
//! Simulates job processes without running anything. Jobs exit after
//! `execution_delay_ms` with `exit_code`, or never when `never_complete` is
//! set.

use async_trait::async_trait;
use gisflow_core::queue::QueuedJob;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::traits::*;

#[derive(Debug, Clone)]
struct MockJob {
    started: Instant,
    stopped: bool,
}

/// Mock runner for testing.
#[derive(Clone)]
pub struct MockJobRunner {
    jobs: Arc<Mutex<HashMap<String, MockJob>>>,
    launched: Arc<Mutex<Vec<String>>>,
    stopped: Arc<Mutex<Vec<String>>>,
    /// Simulated run time (in milliseconds)
    pub execution_delay_ms: u64,
    /// Exit code reported when a job completes
    pub exit_code: i32,
    /// If true, jobs stay running until explicitly stopped
    pub never_complete: bool,
}

impl Default for MockJobRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockJobRunner {
    /// Jobs that succeed after 10ms.
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            launched: Arc::new(Mutex::new(Vec::new())),
            stopped: Arc::new(Mutex::new(Vec::new())),
            execution_delay_ms: 10,
            exit_code: 0,
            never_complete: false,
        }
    }

    /// Jobs that exit with `code` without writing any status.
    pub fn crashing(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::new()
        }
    }

    /// Jobs that stay running until stopped.
    pub fn never_completing() -> Self {
        Self {
            execution_delay_ms: 0,
            never_complete: true,
            ..Self::new()
        }
    }

    /// Resource ids of every launched job, in launch order.
    pub async fn launched(&self) -> Vec<String> {
        self.launched.lock().await.clone()
    }

    /// Resource ids of every stopped job, in stop order.
    pub async fn stopped(&self) -> Vec<String> {
        self.stopped.lock().await.clone()
    }
}

#[async_trait]
impl JobRunner for MockJobRunner {
    fn runner_type(&self) -> &'static str {
        "mock"
    }

    async fn launch(&self, job: &QueuedJob) -> Result<JobHandle> {
        let resource_id = job.resource.resource_id.clone();
        let handle_id = format!("mock_{}_{}", resource_id, job.resource.iteration);
        self.jobs.lock().await.insert(
            handle_id.clone(),
            MockJob {
                started: Instant::now(),
                stopped: false,
            },
        );
        self.launched.lock().await.push(resource_id);
        Ok(JobHandle::for_job(job, handle_id, None))
    }

    async fn exit_code(&self, handle: &JobHandle) -> Option<i32> {
        let jobs = self.jobs.lock().await;
        let job = jobs.get(&handle.handle_id)?;
        if job.stopped {
            return Some(-1);
        }
        if self.never_complete {
            return None;
        }
        (job.started.elapsed() >= Duration::from_millis(self.execution_delay_ms)).then_some(self.exit_code)
    }

    async fn stop(&self, handle: &JobHandle) -> Result<()> {
        if let Some(job) = self.jobs.lock().await.get_mut(&handle.handle_id) {
            job.stopped = true;
        }
        self.stopped.lock().await.push(handle.resource_id.clone());
        Ok(())
    }
}
