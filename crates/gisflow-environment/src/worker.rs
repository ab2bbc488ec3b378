// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker entry point: run one queued job to a terminal status.

use std::path::Path;

use gisflow_core::ResourceStatus;
use gisflow_core::queue::QueuedJob;
use gisflow_core::resource::Entrypoint;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use crate::context::ProcessingContext;
use crate::engine::Processing;
use crate::ephemeral::EphemeralProcessing;
use crate::error::Result;
use crate::persistent::PersistentProcessing;

/// Run `job` with the engine its entrypoint names.
pub async fn run_job(ctx: ProcessingContext, job: QueuedJob) -> ResourceStatus {
    info!(
        resource_id = %job.resource.resource_id,
        iteration = job.resource.iteration,
        entrypoint = ?job.entrypoint,
        "Worker starting job"
    );
    match job.entrypoint {
        Entrypoint::Ephemeral => EphemeralProcessing::new(ctx, job.resource).run().await,
        Entrypoint::Persistent => PersistentProcessing::new(ctx, job.resource).run().await,
    }
}

/// Read a job file and run it.
///
/// SIGTERM is turned into a termination request, so the job stops at the
/// next step boundary and still cleans up after itself.
pub async fn run_job_file(ctx: ProcessingContext, path: &Path) -> Result<ResourceStatus> {
    let raw = tokio::fs::read(path).await?;
    let job: QueuedJob = serde_json::from_slice(&raw)?;
    let user_id = job.resource.user_id.clone();
    let resource_id = job.resource.resource_id.clone();
    let iteration = job.resource.iteration;
    let logger = ctx.logger.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let run = run_job(ctx, job);
    tokio::pin!(run);

    loop {
        tokio::select! {
            status = &mut run => return Ok(status),
            _ = sigterm.recv() => {
                warn!(resource_id = %resource_id, "SIGTERM received, requesting termination");
                logger.commit_termination(&user_id, &resource_id, iteration).await?;
            }
        }
    }
}
