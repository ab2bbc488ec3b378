// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment handlers.
//!
//! The public surface used by the operational (HTTP) layer: compile a chain,
//! enqueue jobs, request termination, read status, resume from a checkpoint,
//! unlock a mapset, and run a job directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gisflow_core::queue::{JobQueue, QueueMessage, QueuedJob};
use gisflow_core::resource::{Entrypoint, ResumePoint};
use gisflow_core::{
    CompiledChain, ResourceDataContainer, ResourceStatus, ResourceStatusRecord,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::context::ProcessingContext;
use crate::engine::Processing;
use crate::ephemeral::EphemeralProcessing;
use crate::error::{Error, Result};
use crate::interim::{self, InterimResult};
use crate::persistent::PersistentProcessing;

const JOB_PREFIX: &str = "RESOURCE-JOB::";

/// Default delay before a `running` record is re-read to prove it stale.
const DEFAULT_STALE_CHECK_DELAY: Duration = Duration::from_secs(5);

fn job_key(user_id: &str, resource_id: &str, iteration: u32) -> String {
    format!("{JOB_PREFIX}{user_id}/{resource_id}/{iteration}")
}

/// Shared state for environment handlers.
pub struct EnvironmentHandlerState {
    /// Processing dependencies (config, store, logger, lock, executor).
    pub ctx: ProcessingContext,
    /// Submission queue of the queue manager.
    pub queue: Arc<dyn JobQueue>,
    /// When the state was created (for uptime calculation).
    pub start_time: std::time::Instant,
    /// Delay before a `running` record is re-read on resume.
    pub stale_check_delay: Duration,
}

impl EnvironmentHandlerState {
    /// Create a new environment handler state.
    pub fn new(ctx: ProcessingContext, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            ctx,
            queue,
            start_time: std::time::Instant::now(),
            stale_check_delay: DEFAULT_STALE_CHECK_DELAY,
        }
    }

    /// Set the stale-running re-check delay.
    pub fn with_stale_check_delay(mut self, delay: Duration) -> Self {
        self.stale_check_delay = delay;
        self
    }

    async fn latest_iteration(&self, user_id: &str, resource_id: &str) -> Result<Option<u32>> {
        let mut latest = None;
        let mut iteration = 1;
        while self
            .ctx
            .logger
            .get(user_id, resource_id, iteration)
            .await?
            .is_some()
        {
            latest = Some(iteration);
            iteration += 1;
        }
        Ok(latest)
    }

    async fn stored_job(&self, user_id: &str, resource_id: &str, iteration: u32) -> Result<Option<QueuedJob>> {
        match self.ctx.store.get(&job_key(user_id, resource_id, iteration)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

// ============================================================================
// Compile
// ============================================================================

/// Compile a process chain without running it.
///
/// `$file::` ids resolve below a scratch directory in the temp database.
pub async fn handle_compile(state: &EnvironmentHandlerState, document: &Value) -> Result<CompiledChain> {
    let scratch = state.ctx.config.grass_tmp_database.join("compile");
    let chain = state.ctx.chain_converter(&scratch).compile(document).await?;
    Ok(chain)
}

// ============================================================================
// Enqueue
// ============================================================================

/// Request to enqueue a job.
pub struct EnqueueRequest {
    /// Engine to run.
    pub entrypoint: Entrypoint,
    /// Job data.
    pub resource: ResourceDataContainer,
    /// Queue-wait timeout; the configured default when not given.
    pub wait_timeout: Option<Duration>,
}

/// Response from enqueuing a job.
#[derive(Debug)]
pub struct EnqueueResponse {
    /// Resource id of the job.
    pub resource_id: String,
    /// Iteration of the job.
    pub iteration: u32,
    /// The `accepted` record written for the job.
    pub record: ResourceStatusRecord,
}

/// Handle enqueue request: write the `accepted` record and submit the job.
pub async fn handle_enqueue(state: &EnvironmentHandlerState, request: EnqueueRequest) -> Result<EnqueueResponse> {
    let rdc = request.resource;
    let wait_timeout = request
        .wait_timeout
        .unwrap_or(state.ctx.config.queue_wait_timeout);
    let job = QueuedJob::new(request.entrypoint, rdc.clone(), wait_timeout);

    let record = ResourceStatusRecord::accepted(&rdc);
    state.ctx.logger.commit(&record).await?;
    state
        .ctx
        .store
        .set(
            &job_key(&rdc.user_id, &rdc.resource_id, rdc.iteration),
            &serde_json::to_string(&job)?,
            Some(state.ctx.config.resource_expire_time),
        )
        .await?;
    state.queue.push(QueueMessage::Job(job)).await?;

    info!(
        resource_id = %rdc.resource_id,
        iteration = rdc.iteration,
        entrypoint = ?request.entrypoint,
        "Job accepted"
    );
    Ok(EnqueueResponse {
        resource_id: rdc.resource_id,
        iteration: rdc.iteration,
        record,
    })
}

// ============================================================================
// Termination
// ============================================================================

/// Request to terminate a job.
pub struct TerminationRequest {
    /// Owner.
    pub user_id: String,
    /// Resource id.
    pub resource_id: String,
}

/// Response from a termination request.
#[derive(Debug)]
pub struct TerminationResponse {
    /// Whether the termination flag was written.
    pub success: bool,
    /// Iteration the flag applies to.
    pub iteration: Option<u32>,
    /// Error message if failed.
    pub error: Option<String>,
}

/// Handle termination request.
///
/// Termination is cooperative: the job stops at its next step boundary.
pub async fn handle_request_termination(
    state: &EnvironmentHandlerState,
    request: TerminationRequest,
) -> Result<TerminationResponse> {
    let Some(iteration) = state
        .latest_iteration(&request.user_id, &request.resource_id)
        .await?
    else {
        return Ok(TerminationResponse {
            success: false,
            iteration: None,
            error: Some(format!("Resource '{}' not found", request.resource_id)),
        });
    };

    let record = state
        .ctx
        .logger
        .get(&request.user_id, &request.resource_id, iteration)
        .await?;
    if record.is_some_and(|r| r.status.is_terminal()) {
        return Ok(TerminationResponse {
            success: false,
            iteration: Some(iteration),
            error: Some(format!("Resource '{}' has already finished", request.resource_id)),
        });
    }

    state
        .ctx
        .logger
        .commit_termination(&request.user_id, &request.resource_id, iteration)
        .await?;
    Ok(TerminationResponse {
        success: true,
        iteration: Some(iteration),
        error: None,
    })
}

// ============================================================================
// Status
// ============================================================================

/// Handle status request. `iteration` defaults to the latest one.
pub async fn handle_get_status(
    state: &EnvironmentHandlerState,
    user_id: &str,
    resource_id: &str,
    iteration: Option<u32>,
) -> Result<Option<ResourceStatusRecord>> {
    let iteration = match iteration {
        Some(i) => i,
        None => match state.latest_iteration(user_id, resource_id).await? {
            Some(i) => i,
            None => return Ok(None),
        },
    };
    Ok(state.ctx.logger.get(user_id, resource_id, iteration).await?)
}

// ============================================================================
// Resume
// ============================================================================

/// Request to resume a failed job from its newest checkpoint.
pub struct ResumeRequest {
    /// Owner.
    pub user_id: String,
    /// Resource id.
    pub resource_id: String,
    /// Replacement process chain; the original one when not given.
    pub request_data: Option<Value>,
    /// Queue-wait timeout; the configured default when not given.
    pub wait_timeout: Option<Duration>,
}

/// Response from resuming a job.
#[derive(Debug)]
pub struct ResumeResponse {
    /// Whether the new iteration was enqueued.
    pub success: bool,
    /// The new iteration.
    pub iteration: Option<u32>,
    /// Step the new iteration starts after.
    pub resume_step: Option<usize>,
    /// Error message if failed.
    pub error: Option<String>,
}

impl ResumeResponse {
    fn rejected(error: String) -> Self {
        Self {
            success: false,
            iteration: None,
            resume_step: None,
            error: Some(error),
        }
    }
}

/// Handle resume request.
///
/// Allowed when the latest iteration ended in `error` or `terminated`, or is
/// `running` but stale: its record did not change over the re-check delay.
/// A stale record is flipped to `error` first.
pub async fn handle_resume(state: &EnvironmentHandlerState, request: ResumeRequest) -> Result<ResumeResponse> {
    let user_id = request.user_id.as_str();
    let resource_id = request.resource_id.as_str();
    info!(resource_id = %resource_id, "Resume request received");

    let Some(iteration) = state.latest_iteration(user_id, resource_id).await? else {
        return Ok(ResumeResponse::rejected(format!("Resource '{resource_id}' not found")));
    };
    let Some(record) = state.ctx.logger.get(user_id, resource_id, iteration).await? else {
        return Ok(ResumeResponse::rejected(format!("Resource '{resource_id}' not found")));
    };

    match record.status {
        ResourceStatus::Error | ResourceStatus::Terminated => {}
        ResourceStatus::Running => {
            tokio::time::sleep(state.stale_check_delay).await;
            let again = state.ctx.logger.get(user_id, resource_id, iteration).await?;
            match again {
                Some(current) if current.status == ResourceStatus::Running && current.time_delta == record.time_delta => {
                    warn!(resource_id = %resource_id, iteration, "Stale running record, marking as error");
                    let stale = current.transition(
                        ResourceStatus::Error,
                        "The job stopped reporting progress and was marked as failed",
                    );
                    state.ctx.logger.commit(&stale).await?;
                }
                _ => {
                    return Ok(ResumeResponse::rejected(format!(
                        "Resource '{resource_id}' is still running"
                    )));
                }
            }
        }
        other => {
            return Ok(ResumeResponse::rejected(format!(
                "Resource '{resource_id}' can not be resumed from status '{other}'"
            )));
        }
    }

    let Some(job) = state.stored_job(user_id, resource_id, iteration).await? else {
        return Ok(ResumeResponse::rejected(format!(
            "Job data of resource '{resource_id}' has expired"
        )));
    };
    let Some(point) = interim::latest_checkpoint(&state.ctx.config.interim, user_id, resource_id) else {
        return Ok(ResumeResponse::rejected(format!(
            "No interim results saved for resource '{resource_id}'"
        )));
    };

    let mut rdc = job.resource.resumed(point.clone());
    if let Some(request_data) = request.request_data {
        rdc.request_data = request_data;
    }
    let response = handle_enqueue(
        state,
        EnqueueRequest {
            entrypoint: job.entrypoint,
            resource: rdc,
            wait_timeout: request.wait_timeout,
        },
    )
    .await?;

    Ok(ResumeResponse {
        success: true,
        iteration: Some(response.iteration),
        resume_step: Some(point.step),
        error: None,
    })
}

// ============================================================================
// Mapset Unlock
// ============================================================================

/// Handle admin unlock of a mapset. Returns whether a lease was removed.
pub async fn handle_unlock_mapset(
    state: &EnvironmentHandlerState,
    user_group: &str,
    location: &str,
    mapset: &str,
) -> Result<bool> {
    let id = gisflow_core::lock::mapset_lock_id(user_group, location, mapset);
    warn!(lock = %id, "Administrative mapset unlock");
    Ok(state.ctx.lock.unlock(&id).await?)
}

// ============================================================================
// Direct Execution
// ============================================================================

/// Run an ephemeral job in the current task.
pub async fn run_ephemeral(ctx: ProcessingContext, rdc: ResourceDataContainer) -> ResourceStatus {
    EphemeralProcessing::new(ctx, rdc).run().await
}

/// Run a persistent job in the current task.
pub async fn run_persistent(ctx: ProcessingContext, rdc: ResourceDataContainer) -> ResourceStatus {
    PersistentProcessing::new(ctx, rdc).run().await
}

// ============================================================================
// Checkpoints
// ============================================================================

/// Save a checkpoint of `rdc` after `step`.
pub async fn checkpoint(
    ctx: &ProcessingContext,
    rdc: &ResourceDataContainer,
    step: usize,
    mapset_path: &std::path::Path,
    tmp_path: &std::path::Path,
) -> Result<()> {
    let mut interim = InterimResult::new(&ctx.config.interim, ctx.lock.clone(), rdc);
    if !interim.is_enabled() {
        return Err(Error::InvalidRequest(format!(
            "interim results are disabled for endpoint '{}'",
            rdc.endpoint
        )));
    }
    interim.continue_from_latest();
    interim
        .save_interim_results(step, mapset_path, tmp_path, None, false)
        .await?;
    Ok(())
}

/// Newest checkpoint of a resource as `(mapset, tmpdir)`.
pub fn resume_from_checkpoint(
    ctx: &ProcessingContext,
    user_id: &str,
    resource_id: &str,
) -> Option<(PathBuf, PathBuf)> {
    interim::latest_checkpoint(&ctx.config.interim, user_id, resource_id)
        .map(|ResumePoint { mapset_path, tmpdir_path, .. }| (mapset_path, tmpdir_path))
}
