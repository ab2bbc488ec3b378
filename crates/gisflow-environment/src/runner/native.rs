// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Native runner: every job in its own OS process.
//!
//! The job is written to `{job_dir}/{resource_id}-{iteration}.json` and the
//! worker binary is started as `<binary> worker <job-file>`. Stopping sends
//! SIGTERM so the worker can clean up, then SIGKILL after a grace period.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use gisflow_core::queue::QueuedJob;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::traits::*;

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

struct RunningChild {
    child: Child,
    job_file: PathBuf,
}

/// Runs jobs as child processes of the worker binary.
pub struct NativeRunner {
    binary: PathBuf,
    job_dir: PathBuf,
    grace_period: Duration,
    children: Mutex<HashMap<String, RunningChild>>,
}

impl NativeRunner {
    /// Runner spawning `binary`, with job files in `job_dir`.
    pub fn new(binary: impl Into<PathBuf>, job_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            job_dir: job_dir.into(),
            grace_period: DEFAULT_GRACE_PERIOD,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Runner spawning the current executable.
    pub fn current_exe(job_dir: impl Into<PathBuf>) -> Result<Self> {
        let binary = std::env::current_exe()?;
        Ok(Self::new(binary, job_dir))
    }

    /// Set how long a stopped job may take to exit before it is killed.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

#[async_trait]
impl JobRunner for NativeRunner {
    fn runner_type(&self) -> &'static str {
        "native"
    }

    async fn launch(&self, job: &QueuedJob) -> Result<JobHandle> {
        if !self.binary.exists() {
            return Err(RunnerError::BinaryNotFound(self.binary.display().to_string()));
        }
        tokio::fs::create_dir_all(&self.job_dir).await?;
        let job_file = self.job_dir.join(format!(
            "{}-{}.json",
            job.resource.resource_id, job.resource.iteration
        ));
        tokio::fs::write(&job_file, serde_json::to_vec(job)?).await?;

        let child = Command::new(&self.binary)
            .arg("worker")
            .arg(&job_file)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::StartFailed(e.to_string()))?;
        let pid = child.id();
        let handle_id = pid.map(|p| p.to_string()).unwrap_or_else(|| job.resource.resource_id.clone());

        info!(
            resource_id = %job.resource.resource_id,
            pid = ?pid,
            "Job process started"
        );
        self.children
            .lock()
            .await
            .insert(handle_id.clone(), RunningChild { child, job_file });
        Ok(JobHandle::for_job(job, handle_id, pid))
    }

    async fn exit_code(&self, handle: &JobHandle) -> Option<i32> {
        let mut children = self.children.lock().await;
        let running = children.get_mut(&handle.handle_id)?;
        let code = match running.child.try_wait() {
            Ok(None) => return None,
            Ok(Some(status)) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!(handle_id = %handle.handle_id, error = %e, "Failed to poll job process");
                -1
            }
        };
        if let Some(done) = children.remove(&handle.handle_id) {
            let _ = tokio::fs::remove_file(&done.job_file).await;
        }
        debug!(resource_id = %handle.resource_id, code, "Job process exited");
        Some(code)
    }

    async fn stop(&self, handle: &JobHandle) -> Result<()> {
        let Some(mut running) = self.children.lock().await.remove(&handle.handle_id) else {
            return Ok(());
        };

        if let Some(pid) = handle.pid {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => debug!(pid, "Sent SIGTERM to job process"),
                Err(nix::errno::Errno::ESRCH) => debug!(pid, "Job process already dead (ESRCH)"),
                Err(e) => warn!(pid, error = %e, "Failed to send SIGTERM to job process"),
            }
        }

        match tokio::time::timeout(self.grace_period, running.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(resource_id = %handle.resource_id, "Job process ignored SIGTERM, killing");
                running.child.kill().await?;
            }
        }
        let _ = tokio::fs::remove_file(&running.job_file).await;
        info!(resource_id = %handle.resource_id, "Job process stopped");
        Ok(())
    }
}
