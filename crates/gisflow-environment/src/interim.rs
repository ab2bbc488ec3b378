// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interim results: per-step checkpoints of a running job.
//!
//! Layout below the interim root:
//!
//! ```text
//! {root}/{user_id}/{resource_id}/step{N}              temporary mapset after step N
//! {root}/{user_id}/{resource_id}/tmpdir{N}            temporary file directory after step N
//! {root}/{user_id}/{resource_id}/step{N}_add_mapsets  pattern-matched extra mapsets
//! ```
//!
//! Only the newest checkpoint is kept. When a step did not change the mapset
//! the previous snapshot is renamed forward instead of copied again.
//! Every save holds the lease `interim/{user_id}/{resource_id}` so two
//! processes never write the same checkpoint tree at once.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gisflow_core::config::{InterimConfig, InterimMode};
use gisflow_core::lock::HeldLock;
use gisflow_core::resource::ResumePoint;
use gisflow_core::{MapsetLock, ResourceDataContainer};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fsops::{self, GISLOCK};

const LEASE_TTL: Duration = Duration::from_secs(3600);

/// What happened to a snapshot directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotAction {
    /// Full copy into a fresh directory.
    Copied,
    /// Previous snapshot renamed forward (content unchanged).
    Promoted,
    /// Previous snapshot replaced by a mirroring copy.
    Synced,
}

fn promote_or_mirror(src: &Path, previous: Option<&Path>, dst: &Path) -> io::Result<SnapshotAction> {
    let exclude = [GISLOCK];
    match previous.filter(|p| p.exists()) {
        Some(prev) if prev == dst => {
            fsops::mirror_dir(src, dst, &exclude)?;
            Ok(SnapshotAction::Synced)
        }
        Some(prev) => {
            if fsops::tree_hash(src, &exclude)? == fsops::tree_hash(prev, &exclude)? {
                fsops::remove_dir_if_exists(dst)?;
                fs::rename(prev, dst)?;
                return Ok(SnapshotAction::Promoted);
            }
            fsops::mirror_dir(src, dst, &exclude)?;
            fsops::remove_dir_if_exists(prev)?;
            Ok(SnapshotAction::Synced)
        }
        None => {
            fsops::mirror_dir(src, dst, &exclude)?;
            Ok(SnapshotAction::Copied)
        }
    }
}

fn parse_step(name: &str) -> Option<usize> {
    name.strip_prefix("step")?.parse().ok()
}

/// Mapsets of a location matching `pattern`, skipping links and `skip`.
fn matching_mapsets(location_dir: &Path, pattern: &glob::Pattern, skip: &str) -> io::Result<Vec<PathBuf>> {
    let mut matches = Vec::new();
    for entry in fs::read_dir(location_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == skip || entry.file_type()?.is_symlink() || !entry.path().is_dir() {
            continue;
        }
        if pattern.matches(&name) {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}

/// Checkpoint writer and reader of one resource.
#[derive(Clone)]
pub struct InterimResult {
    config: InterimConfig,
    lock: MapsetLock,
    user_id: String,
    resource_id: String,
    endpoint: String,
    saved_step: Option<usize>,
}

impl InterimResult {
    /// Checkpoints of the job described by `rdc`.
    ///
    /// A resumed job starts with its resume step as the newest checkpoint.
    pub fn new(config: &InterimConfig, lock: MapsetLock, rdc: &ResourceDataContainer) -> Self {
        Self {
            config: config.clone(),
            lock,
            user_id: rdc.user_id.clone(),
            resource_id: rdc.resource_id.clone(),
            endpoint: rdc.endpoint.clone(),
            saved_step: rdc.resume.as_ref().map(|r| r.step),
        }
    }

    /// Whether checkpointing is active for this job.
    pub fn is_enabled(&self) -> bool {
        self.config.mode != InterimMode::Off && self.config.endpoints.contains(&self.endpoint)
    }

    /// Whether every successful step is saved.
    pub fn saves_every_step(&self) -> bool {
        self.is_enabled() && self.config.mode == InterimMode::Always
    }

    /// Whether only the last successful step is saved, on failure.
    pub fn saves_on_error(&self) -> bool {
        self.is_enabled() && self.config.mode == InterimMode::OnError
    }

    /// Newest saved step.
    pub fn saved_step(&self) -> Option<usize> {
        self.saved_step
    }

    /// Continue from the newest checkpoint on disk, if any.
    pub fn continue_from_latest(&mut self) {
        if let Some(point) = latest_checkpoint(&self.config, &self.user_id, &self.resource_id) {
            self.saved_step = Some(point.step);
        }
    }

    /// Directory holding all checkpoints of the resource.
    pub fn resource_dir(&self) -> PathBuf {
        resource_dir(&self.config, &self.user_id, &self.resource_id)
    }

    /// Mapset snapshot of step `n`.
    pub fn step_dir(&self, n: usize) -> PathBuf {
        self.resource_dir().join(format!("step{n}"))
    }

    /// Temp file snapshot of step `n`.
    pub fn tmpdir(&self, n: usize) -> PathBuf {
        self.resource_dir().join(format!("tmpdir{n}"))
    }

    /// Additional mapsets snapshot of step `n`.
    pub fn add_mapsets_dir(&self, n: usize) -> PathBuf {
        self.resource_dir().join(format!("step{n}_add_mapsets"))
    }

    /// Save the checkpoint of step `progress_step`.
    ///
    /// The first step (or `force_copy`) copies everything; later steps
    /// promote or mirror the previous checkpoint. Additional mapsets matching
    /// the configured pattern are taken from `location_dir` when given.
    pub async fn save_interim_results(
        &mut self,
        progress_step: usize,
        temp_mapset_path: &Path,
        temp_file_path: &Path,
        location_dir: Option<&Path>,
        force_copy: bool,
    ) -> Result<SnapshotAction> {
        let lease_id = format!("interim/{}/{}", self.user_id, self.resource_id);
        let mut lease = HeldLock::new(lease_id.clone());
        if !lease.acquire(&self.lock, LEASE_TTL).await? {
            return Err(Error::Sync(format!(
                "checkpoint <{lease_id}> is being written by another process"
            )));
        }

        let result = self
            .write_snapshot(progress_step, temp_mapset_path, temp_file_path, location_dir, force_copy)
            .await;
        lease.release(&self.lock).await?;

        let action = result?;
        self.saved_step = Some(progress_step);
        info!(
            resource_id = %self.resource_id,
            step = progress_step,
            action = ?action,
            "Interim result saved"
        );
        Ok(action)
    }

    async fn write_snapshot(
        &self,
        step: usize,
        temp_mapset_path: &Path,
        temp_file_path: &Path,
        location_dir: Option<&Path>,
        force_copy: bool,
    ) -> Result<SnapshotAction> {
        let previous = if step == 1 || force_copy {
            None
        } else {
            self.saved_step.filter(|&prev| prev != step)
        };
        let stale = self.saved_step.filter(|&prev| prev != step);

        let mapset_src = temp_mapset_path.to_path_buf();
        let tmp_src = temp_file_path.to_path_buf();
        let mapset_dst = self.step_dir(step);
        let tmp_dst = self.tmpdir(step);
        let add_dst = self.add_mapsets_dir(step);
        let prev_mapset = previous.map(|p| self.step_dir(p));
        let prev_tmp = previous.map(|p| self.tmpdir(p));
        let stale_dirs: Vec<PathBuf> = stale
            .map(|p| vec![self.step_dir(p), self.tmpdir(p), self.add_mapsets_dir(p)])
            .unwrap_or_default();

        let extra = match (&self.config.additional_mapsets_pattern, location_dir) {
            (Some(pattern), Some(dir)) => {
                let pattern = glob::Pattern::new(pattern)
                    .map_err(|e| Error::Sync(format!("invalid additional mapsets pattern: {e}")))?;
                let skip = temp_mapset_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Some((dir.to_path_buf(), pattern, skip))
            }
            _ => None,
        };
        let resource_dir = self.resource_dir();

        let result = tokio::task::spawn_blocking(move || -> io::Result<SnapshotAction> {
            fs::create_dir_all(&resource_dir)?;
            let action = promote_or_mirror(&mapset_src, prev_mapset.as_deref(), &mapset_dst)?;
            promote_or_mirror(&tmp_src, prev_tmp.as_deref(), &tmp_dst)?;

            if let Some((dir, pattern, skip)) = extra {
                fsops::remove_dir_if_exists(&add_dst)?;
                for mapset in matching_mapsets(&dir, &pattern, &skip)? {
                    if let Some(name) = mapset.file_name() {
                        fsops::copy_dir(&mapset, &add_dst.join(name), &[GISLOCK])?;
                    }
                }
            }
            for dir in stale_dirs {
                fsops::remove_dir_if_exists(&dir)?;
            }
            Ok(action)
        })
        .await
        .map_err(|e| Error::Sync(e.to_string()))?;

        result.map_err(|e| Error::Sync(e.to_string()))
    }

    /// Snapshot pair of step `pc_step`, if both directories exist.
    pub fn check_interim_result_mapset(&self, pc_step: usize) -> Option<(PathBuf, PathBuf)> {
        let mapset = self.step_dir(pc_step);
        let tmpdir = self.tmpdir(pc_step);
        if mapset.is_dir() && tmpdir.is_dir() {
            debug!(resource_id = %self.resource_id, step = pc_step, "Interim result found");
            Some((mapset, tmpdir))
        } else {
            None
        }
    }

    /// Remove every checkpoint of the resource.
    pub async fn delete(&self) -> Result<()> {
        let dir = self.resource_dir();
        tokio::task::spawn_blocking(move || fsops::remove_dir_if_exists(&dir))
            .await
            .map_err(|e| Error::Sync(e.to_string()))??;
        Ok(())
    }
}

/// Directory holding all checkpoints of a resource.
pub fn resource_dir(config: &InterimConfig, user_id: &str, resource_id: &str) -> PathBuf {
    config.root.join(user_id).join(resource_id)
}

/// Newest complete checkpoint of a resource, as a resume point.
pub fn latest_checkpoint(config: &InterimConfig, user_id: &str, resource_id: &str) -> Option<ResumePoint> {
    let dir = resource_dir(config, user_id, resource_id);
    let step = fs::read_dir(&dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| parse_step(&entry.file_name().to_string_lossy()))
        .filter(|n| dir.join(format!("tmpdir{n}")).is_dir())
        .max()?;
    let additional = dir.join(format!("step{step}_add_mapsets"));
    Some(ResumePoint {
        step,
        mapset_path: dir.join(format!("step{step}")),
        tmpdir_path: dir.join(format!("tmpdir{step}")),
        additional_mapsets_path: additional.is_dir().then_some(additional),
    })
}
