// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner trait definitions.
//!
//! A job runner starts one queued job in isolation and reports whether it
//! has exited. Runners never write status records; the queue manager does
//! that on a job's behalf when the job could not.

use async_trait::async_trait;
use gisflow_core::queue::QueuedJob;
use thiserror::Error;

/// Errors from runner operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// Worker binary was not found.
    #[error("Binary not found: {0}")]
    BinaryNotFound(String),

    /// Job failed to start.
    #[error("Job start failed: {0}")]
    StartFailed(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Handle of a launched job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    /// Runner-specific identifier (PID for native, task id otherwise).
    pub handle_id: String,
    /// Resource id of the job.
    pub resource_id: String,
    /// Iteration of the job.
    pub iteration: u32,
    /// When the job was started.
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// OS process id, when the job runs in its own process.
    pub pid: Option<u32>,
}

impl JobHandle {
    /// Handle for `job` with the given id and pid.
    pub fn for_job(job: &QueuedJob, handle_id: impl Into<String>, pid: Option<u32>) -> Self {
        Self {
            handle_id: handle_id.into(),
            resource_id: job.resource.resource_id.clone(),
            iteration: job.resource.iteration,
            started_at: chrono::Utc::now(),
            pid,
        }
    }
}

/// Trait for job runners.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Runner type identifier (e.g., "native", "task", "mock").
    fn runner_type(&self) -> &'static str;

    /// Start a job without waiting for it.
    async fn launch(&self, job: &QueuedJob) -> Result<JobHandle>;

    /// Exit code of a finished job; `None` while it is still running.
    ///
    /// A job killed by a signal reports -1.
    async fn exit_code(&self, handle: &JobHandle) -> Option<i32>;

    /// Stop a running job. Stopping a finished job is a no-op.
    async fn stop(&self, handle: &JobHandle) -> Result<()>;
}
