// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process runner: every job in its own tokio task.
//!
//! Used by tests and single-process deployments. Stopping a job requests
//! cooperative termination first and aborts the task after the grace period.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use gisflow_core::ResourceStatus;
use gisflow_core::queue::QueuedJob;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::traits::*;
use crate::context::ProcessingContext;
use crate::worker;

/// Exit code reported for a job task that panicked.
pub const PANIC_EXIT_CODE: i32 = 101;

struct RunningTask {
    task: JoinHandle<ResourceStatus>,
    user_id: String,
}

/// Runs jobs as tokio tasks in the current process.
pub struct TaskRunner {
    ctx: ProcessingContext,
    grace_period: Duration,
    tasks: Mutex<HashMap<String, RunningTask>>,
}

impl TaskRunner {
    /// Runner executing jobs with `ctx`.
    pub fn new(ctx: ProcessingContext) -> Self {
        Self {
            ctx,
            grace_period: Duration::from_secs(10),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Set how long a stopped job may take before its task is aborted.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

#[async_trait]
impl JobRunner for TaskRunner {
    fn runner_type(&self) -> &'static str {
        "task"
    }

    async fn launch(&self, job: &QueuedJob) -> Result<JobHandle> {
        let handle_id = format!("task_{}_{}", job.resource.resource_id, job.resource.iteration);
        let task = tokio::spawn(worker::run_job(self.ctx.clone(), job.clone()));
        self.tasks.lock().await.insert(
            handle_id.clone(),
            RunningTask {
                task,
                user_id: job.resource.user_id.clone(),
            },
        );
        info!(resource_id = %job.resource.resource_id, "Job task started");
        Ok(JobHandle::for_job(job, handle_id, None))
    }

    async fn exit_code(&self, handle: &JobHandle) -> Option<i32> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.get(&handle.handle_id)?.task.is_finished() {
            return None;
        }
        let running = tasks.remove(&handle.handle_id)?;
        match running.task.await {
            Ok(_) => Some(0),
            Err(e) if e.is_cancelled() => Some(-1),
            Err(_) => Some(PANIC_EXIT_CODE),
        }
    }

    async fn stop(&self, handle: &JobHandle) -> Result<()> {
        let Some(mut running) = self.tasks.lock().await.remove(&handle.handle_id) else {
            return Ok(());
        };
        if let Err(e) = self
            .ctx
            .logger
            .commit_termination(&running.user_id, &handle.resource_id, handle.iteration)
            .await
        {
            warn!(resource_id = %handle.resource_id, error = %e, "Failed to request termination");
        }
        if tokio::time::timeout(self.grace_period, &mut running.task).await.is_err() {
            warn!(resource_id = %handle.resource_id, "Job task did not stop in time, aborting");
            running.task.abort();
        }
        Ok(())
    }
}
