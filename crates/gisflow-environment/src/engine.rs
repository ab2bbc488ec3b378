// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Processing engine shared by the ephemeral and persistent entrypoints.
//!
//! An engine owns one job attempt: its temporary GRASS database, the GRASS
//! session, the locks it took and the status record it keeps committing.
//!
//! ```text
//! Created ──setup──▶ Setup ──execute──▶ Running ──▶ Finished | Error | Terminated | Timeout
//!                                                          │
//!                                                   final_cleanup
//!                                                          ▼
//!                                                      CleanedUp
//! ```
//!
//! Every exit path goes through [`Processing::run`], which always cleans up
//! before it writes the single terminal record of the attempt.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use gisflow_core::chain::ExportRequest;
use gisflow_core::lock::HeldLock;
use gisflow_core::resource::ProcessLogEntry;
use gisflow_core::{
    CompiledChain, Process, ResourceDataContainer, ResourceStatus, ResourceStatusRecord,
};
use tracing::{debug, error, info, warn};

use crate::context::ProcessingContext;
use crate::error::{Error, Result};
use crate::executor::{ExecOutput, ExecRequest};
use crate::export;
use crate::fsops::{self, GISLOCK};
use crate::grass_env::GrassSession;
use crate::interim::InterimResult;
use crate::webhook::WebhookNotifier;

/// Lock TTL used while results are copied back.
pub const COPY_LOCK_TTL: Duration = Duration::from_secs(3600);

/// Lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, nothing on disk yet.
    Created,
    /// Temporary directories exist.
    Setup,
    /// Executing the process list.
    Running,
    /// All steps succeeded.
    Finished,
    /// A step or a setup stage failed.
    Error,
    /// Termination was requested.
    Terminated,
    /// A time limit was exceeded.
    Timeout,
    /// Temporary state removed and locks released.
    CleanedUp,
}

impl From<ResourceStatus> for EngineState {
    fn from(status: ResourceStatus) -> Self {
        match status {
            ResourceStatus::Finished => Self::Finished,
            ResourceStatus::Terminated => Self::Terminated,
            ResourceStatus::Timeout => Self::Timeout,
            ResourceStatus::Accepted | ResourceStatus::Running => Self::Running,
            ResourceStatus::Error => Self::Error,
        }
    }
}

/// State of one job attempt.
pub struct ProcessingEngine {
    ctx: ProcessingContext,
    rdc: ResourceDataContainer,
    state: EngineState,
    record: ResourceStatusRecord,
    started: Instant,
    job_dir: PathBuf,
    temp_file_dir: PathBuf,
    temp_gisdbase: PathBuf,
    temp_mapset: Option<String>,
    session: Option<GrassSession>,
    locks: Vec<HeldLock>,
    interim: InterimResult,
    webhooks: WebhookNotifier,
    completed_steps: usize,
}

impl ProcessingEngine {
    /// Engine for the job described by `rdc`.
    pub fn new(ctx: ProcessingContext, rdc: ResourceDataContainer) -> Self {
        let job_dir = ctx
            .config
            .grass_tmp_database
            .join(format!("gisflow_{}", uuid::Uuid::new_v4().simple()));
        let interim = InterimResult::new(&ctx.config.interim, ctx.lock.clone(), &rdc);
        let completed_steps = rdc.resume.as_ref().map(|r| r.step).unwrap_or(0);
        Self {
            record: ResourceStatusRecord::accepted(&rdc),
            temp_file_dir: job_dir.join("tmp"),
            temp_gisdbase: job_dir.join("grassdb"),
            job_dir,
            state: EngineState::Created,
            started: Instant::now(),
            temp_mapset: None,
            session: None,
            locks: Vec::new(),
            interim,
            webhooks: WebhookNotifier::default(),
            completed_steps,
            ctx,
            rdc,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// The job data.
    pub fn rdc(&self) -> &ResourceDataContainer {
        &self.rdc
    }

    /// Shared dependencies.
    pub fn ctx(&self) -> &ProcessingContext {
        &self.ctx
    }

    /// The latest status record.
    pub fn record(&self) -> &ResourceStatusRecord {
        &self.record
    }

    /// Per-job working directory.
    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    /// Directory `$file::` paths resolve into.
    pub fn temp_file_dir(&self) -> &Path {
        &self.temp_file_dir
    }

    /// Location directory of the temporary GRASS database.
    pub fn temp_location_dir(&self) -> PathBuf {
        self.temp_gisdbase.join(&self.rdc.location_name)
    }

    /// Path of the temporary mapset, once created.
    pub fn temp_mapset_path(&self) -> Option<PathBuf> {
        self.temp_mapset
            .as_ref()
            .map(|name| self.temp_location_dir().join(name))
    }

    /// Location directory in the user's group database.
    pub fn user_location_dir(&self) -> PathBuf {
        self.ctx
            .config
            .grass_user_database
            .join(&self.rdc.user_group)
            .join(&self.rdc.location_name)
    }

    /// Location directory in the global read-only database.
    pub fn global_location_dir(&self) -> PathBuf {
        self.ctx.config.grass_database.join(&self.rdc.location_name)
    }

    /// Checkpoint writer of this job.
    pub fn interim(&self) -> &InterimResult {
        &self.interim
    }

    /// Number of chain steps completed so far.
    pub fn completed_steps(&self) -> usize {
        self.completed_steps
    }

    /// Create the job directories and mark the record running.
    pub async fn setup(&mut self) -> Result<()> {
        fs::create_dir_all(&self.temp_file_dir)?;
        fs::create_dir_all(&self.temp_gisdbase)?;
        self.state = EngineState::Setup;
        self.record = self
            .record
            .transition(ResourceStatus::Running, "Setting up processing environment");
        self.ctx.logger.commit(&self.record).await?;
        info!(
            resource_id = %self.rdc.resource_id,
            iteration = self.rdc.iteration,
            job_dir = %self.job_dir.display(),
            "Processing environment set up"
        );
        Ok(())
    }

    /// Compile the job's process chain and attach its webhooks.
    pub async fn compile(&mut self) -> Result<CompiledChain> {
        let converter = self.ctx.chain_converter(&self.temp_file_dir);
        let chain = converter.compile(&self.rdc.request_data).await?;
        self.webhooks = WebhookNotifier::new(
            self.ctx.http.clone(),
            chain.webhooks.clone(),
            self.ctx.config.webhook_timeout,
        );
        self.record.progress.num_of_steps = chain.len();
        info!(
            resource_id = %self.rdc.resource_id,
            processes = chain.len(),
            required_mapsets = ?chain.required_mapsets,
            "Process chain compiled"
        );
        Ok(chain)
    }

    /// Take a lock for the rest of the job. Fails if it is held elsewhere.
    pub async fn acquire_lock(&mut self, resource_id: String, ttl: Duration) -> Result<()> {
        let mut held = HeldLock::new(resource_id.clone());
        if !held.acquire(&self.ctx.lock, ttl).await? {
            return Err(Error::LockUnavailable(resource_id));
        }
        self.locks.push(held);
        Ok(())
    }

    /// Extend every lock this engine holds.
    pub async fn extend_locks(&self, ttl: Duration) -> Result<()> {
        for held in self.locks.iter().filter(|l| l.is_acquired()) {
            if !held.extend(&self.ctx.lock, ttl).await? {
                return Err(Error::LockUnavailable(format!(
                    "{} (lease expired)",
                    held.resource_id
                )));
            }
        }
        Ok(())
    }

    /// Link PERMANENT and the required mapsets into the temporary location.
    ///
    /// Each mapset is looked up in the user database first, then in the global
    /// database. `skip` names the mapset this job creates itself.
    pub fn link_mapsets(&self, required: &BTreeSet<String>, skip: Option<&str>) -> Result<()> {
        let user_loc = self.user_location_dir();
        let global_loc = self.global_location_dir();
        if !user_loc.is_dir() && !global_loc.is_dir() {
            return Err(Error::LocationNotFound(self.rdc.location_name.clone()));
        }
        let temp_loc = self.temp_location_dir();
        fs::create_dir_all(&temp_loc)?;

        let names = std::iter::once("PERMANENT")
            .chain(required.iter().map(String::as_str))
            .filter(|name| Some(*name) != skip);
        for name in names {
            let link = temp_loc.join(name);
            if link.symlink_metadata().is_ok() {
                continue;
            }
            let source = [user_loc.join(name), global_loc.join(name)]
                .into_iter()
                .find(|p| p.is_dir());
            match source {
                Some(source) => {
                    std::os::unix::fs::symlink(&source, &link)?;
                    debug!(mapset = %name, source = %source.display(), "Mapset linked");
                }
                None if name == "PERMANENT" => {
                    return Err(Error::LocationNotFound(self.rdc.location_name.clone()));
                }
                None => return Err(Error::MapsetNotFound(name.to_string())),
            }
        }
        Ok(())
    }

    /// Create the temporary mapset and open the GRASS session on it.
    ///
    /// A resumed job restores its checkpoint instead of starting empty. The
    /// region is copied from `region_from` when that file exists.
    pub async fn create_temp_mapset(&mut self, name: &str, region_from: Option<PathBuf>) -> Result<PathBuf> {
        let temp_loc = self.temp_location_dir();
        let mapset = temp_loc.join(name);
        let resume = self.rdc.resume.clone();
        let temp_files = self.temp_file_dir.clone();
        let search_path: Vec<String> = fs::read_dir(&temp_loc)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();

        let target = mapset.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            match resume {
                Some(point) => {
                    fsops::copy_dir(&point.mapset_path, &target, &[GISLOCK])?;
                    fsops::copy_dir(&point.tmpdir_path, &temp_files, &[])?;
                    if let Some(additional) = point.additional_mapsets_path
                        && let Some(location) = target.parent()
                    {
                        fsops::copy_dir(&additional, location, &[])?;
                    }
                }
                None => {
                    fs::create_dir_all(&target)?;
                    if let Some(region) = region_from.filter(|p| p.is_file()) {
                        fs::copy(region, target.join("WIND"))?;
                    }
                }
            }
            let mut lines = vec![target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()];
            lines.extend(search_path);
            fs::write(target.join("SEARCH_PATH"), lines.join("\n") + "\n")
        })
        .await
        .map_err(|e| Error::Other(e.to_string()))??;

        let session = GrassSession::setup(
            &self.ctx.config.grass_gis_base,
            &self.temp_gisdbase,
            &self.rdc.location_name,
            name,
            &self.job_dir,
        )?;
        self.session = Some(session);
        self.temp_mapset = Some(name.to_string());
        info!(
            resource_id = %self.rdc.resource_id,
            mapset = %name,
            resumed = self.rdc.resume.is_some(),
            "Temporary mapset created"
        );
        Ok(mapset)
    }

    async fn check_termination(&self) -> Result<()> {
        let requested = self
            .ctx
            .logger
            .get_termination(&self.rdc.user_id, &self.rdc.resource_id, self.rdc.iteration)
            .await?;
        if requested {
            return Err(Error::Terminated(format!(
                "termination requested for {}",
                self.rdc.resource_id
            )));
        }
        Ok(())
    }

    fn check_time_limit(&self) -> Result<()> {
        let limit = self.rdc.total_time_limit();
        let elapsed = self.started.elapsed();
        if elapsed > limit {
            return Err(Error::Timeout(format!(
                "elapsed {:.1}s exceeds the limit of {}s",
                elapsed.as_secs_f64(),
                limit.as_secs()
            )));
        }
        Ok(())
    }

    async fn mapset_size(&self) -> Option<u64> {
        let path = self.temp_mapset_path()?;
        tokio::task::spawn_blocking(move || fsops::dir_size(&path).ok())
            .await
            .ok()
            .flatten()
    }

    /// Run one process in the GRASS session and log it.
    ///
    /// A program that cannot be started is logged with return code -1.
    pub async fn run_process(&mut self, process: &Process, stdin: Option<String>) -> Result<ExecOutput> {
        let request = ExecRequest {
            program: process.name.clone(),
            args: process.args.clone(),
            env: self.session.as_ref().map(|s| s.env().clone()).unwrap_or_default(),
            stdin,
            working_dir: Some(self.temp_file_dir.clone()),
        };
        info!(
            resource_id = %self.rdc.resource_id,
            process_id = %process.id,
            command = %process.command_line(),
            "Running process"
        );
        let output = match self.ctx.executor.execute(&request).await {
            Ok(output) => output,
            Err(e) => ExecOutput::failure(-1, e.to_string()),
        };

        let mapset_size = if self.interim.is_enabled() {
            self.mapset_size().await
        } else {
            None
        };
        self.record.process_log.push(ProcessLogEntry {
            id: process.id.clone(),
            executable: process.name.clone(),
            parameter: process.args.clone(),
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
            return_code: output.return_code,
            run_time: output.run_time.as_secs_f64(),
            mapset_size,
        });

        if output.return_code != 0 {
            warn!(
                resource_id = %self.rdc.resource_id,
                process_id = %process.id,
                return_code = output.return_code,
                "Process failed"
            );
            return Err(Error::ProcessFailure {
                process_id: process.id.clone(),
                executable: process.name.clone(),
                return_code: output.return_code,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    /// Run the processes of `chain` in order, skipping already completed steps.
    pub async fn execute_process_list(&mut self, chain: &mut CompiledChain) -> Result<()> {
        self.state = EngineState::Running;
        let start = self.completed_steps;
        if start > 0 {
            info!(resource_id = %self.rdc.resource_id, skipped = start, "Resuming after completed steps");
        }

        for index in start..chain.processes.len() {
            self.check_termination().await?;
            self.check_time_limit()?;
            self.extend_locks(self.rdc.process_time_limit() * 2).await?;

            let stdin = chain.processes[index].stdin_source.as_ref().map(|source| {
                chain.processes[..index]
                    .iter()
                    .find(|p| p.id == source.process_id)
                    .and_then(|p| p.captured(source.stream))
                    .unwrap_or_default()
                    .to_string()
            });
            let process = chain.processes[index].clone();
            let output = self.run_process(&process, stdin).await?;

            if let Some((key, value)) = chain.parse_stdout(&process.id, &output.stdout) {
                self.record.process_results.insert(key, value);
            }
            chain.processes[index].set_output(output.stdout, output.stderr);
            self.completed_steps = index + 1;

            let step = index + 1;
            self.record.progress.step = step;
            self.record = self.record.transition(
                ResourceStatus::Running,
                format!("Running process {} of {}", step, chain.len()),
            );
            self.ctx.logger.commit(&self.record).await?;
            self.webhooks.update(&self.record).await;

            if self.interim.saves_every_step() {
                self.save_checkpoint(step, false).await?;
            }
        }
        Ok(())
    }

    /// Export the requested outputs into the download cache.
    pub async fn export_results(&mut self, exports: &[ExportRequest]) -> Result<()> {
        if exports.is_empty() {
            return Ok(());
        }
        self.check_termination().await?;
        let urls = export::export_resources(self, exports).await?;
        self.record.urls.resources.extend(urls);
        Ok(())
    }

    /// Save a checkpoint of the temporary mapset after `step`.
    pub async fn save_checkpoint(&mut self, step: usize, force_copy: bool) -> Result<()> {
        let Some(mapset) = self.temp_mapset_path() else {
            return Ok(());
        };
        let location = self.temp_location_dir();
        self.interim
            .save_interim_results(step, &mapset, &self.temp_file_dir, Some(&location), force_copy)
            .await?;
        Ok(())
    }

    async fn save_on_error(&mut self) {
        if !self.interim.saves_on_error() || self.completed_steps == 0 {
            return;
        }
        let step = self.completed_steps;
        if let Err(e) = self.save_checkpoint(step, true).await {
            error!(resource_id = %self.rdc.resource_id, step, error = %e, "Failed to save interim result");
        }
    }

    /// Release locks, close the session and remove the job directory.
    ///
    /// Safe to call more than once.
    pub async fn final_cleanup(&mut self) {
        for held in &mut self.locks {
            if let Err(e) = held.release(&self.ctx.lock).await {
                error!(lock = %held.resource_id, error = %e, "Failed to release lock");
            }
        }
        self.locks.clear();
        self.session = None;

        let job_dir = self.job_dir.clone();
        match tokio::task::spawn_blocking(move || fsops::remove_dir_if_exists(&job_dir)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(job_dir = %self.job_dir.display(), error = %e, "Failed to remove job directory"),
            Err(e) => warn!(error = %e, "Cleanup task failed"),
        }
        self.state = EngineState::CleanedUp;
        debug!(resource_id = %self.rdc.resource_id, "Processing environment cleaned up");
    }

    /// Write the terminal record of the attempt and send the finished webhook.
    pub async fn finish(&mut self, result: &Result<()>) -> ResourceStatus {
        let record = match result {
            Ok(()) => self
                .record
                .transition(ResourceStatus::Finished, "Processing successfully finished"),
            Err(e) => self
                .record
                .transition(e.terminal_status(), e.to_string())
                .with_exception(e.kind(), e.to_string()),
        };
        let status = record.status;
        self.record = record;
        if self.state != EngineState::CleanedUp {
            self.state = status.into();
        }

        if let Err(e) = self.ctx.logger.commit(&self.record).await {
            error!(resource_id = %self.rdc.resource_id, error = %e, "Failed to commit terminal record");
        }
        self.webhooks.finished(&self.record).await;
        info!(
            resource_id = %self.rdc.resource_id,
            iteration = self.rdc.iteration,
            status = %status,
            "Processing finished"
        );
        status
    }
}

/// A processing entrypoint.
///
/// Implementors provide [`Processing::execute`]; [`Processing::run`] wraps it
/// with setup, error mapping, the on-error checkpoint, cleanup and the
/// terminal record.
#[async_trait]
pub trait Processing: Send {
    /// The engine of this job.
    fn engine(&mut self) -> &mut ProcessingEngine;

    /// Entrypoint-specific work after setup.
    async fn execute(&mut self) -> Result<()>;

    /// Remove temporary state. Implementors extend this, never skip it.
    async fn final_cleanup(&mut self) {
        self.engine().final_cleanup().await;
    }

    /// Run the job to a terminal status.
    async fn run(&mut self) -> ResourceStatus {
        let mut result = self.engine().setup().await;
        if result.is_ok() {
            result = self.execute().await;
        }
        if let Err(e) = &result {
            warn!(
                resource_id = %self.engine().rdc().resource_id,
                error = %e,
                "Processing failed"
            );
            self.engine().save_on_error().await;
        }
        self.final_cleanup().await;
        self.engine().finish(&result).await
    }
}
