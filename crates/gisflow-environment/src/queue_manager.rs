// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process queue manager: a bounded pool of job processes.
//!
//! A listener task drains the shared submission queue into a bounded
//! channel so no submission is lost while the main loop is busy. Each tick
//! of the main loop then:
//!
//! 1. moves newly arrived jobs into the FIFO `waiting` list
//! 2. on `Stop`, terminates every running and waiting job and exits
//! 3. starts one waiting job if fewer than `number_of_workers` are running
//! 4. every `purge_every` ticks, reaps exited jobs; a job that exited
//!    without a terminal status record gets an `error` record
//! 5. stops running jobs past `max_job_runtime` with a `timeout` record
//! 6. drops waiting jobs past their queue-wait timeout with a `timeout`
//!    record, without ever starting them
//!
//! ```text
//! WAITING ──start──▶ RUNNING ──▶ FINISHED | ERROR-DETECTED | TIMEOUT | TERMINATED
//!    │
//!    └──wait timeout / shutdown──▶ TIMEOUT | TERMINATED
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gisflow_core::queue::{JobQueue, QueueMessage, QueuedJob};
use gisflow_core::{Config, ResourceLogger, ResourceStatus, ResourceStatusRecord};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};

use crate::runner::{JobHandle, JobRunner};

/// Jobs buffered between the listener and the main loop.
const INTAKE_CAPACITY: usize = 256;

/// Configuration for the queue manager.
#[derive(Debug, Clone)]
pub struct QueueManagerConfig {
    /// Maximum number of concurrently running jobs.
    pub number_of_workers: usize,
    /// Main loop tick.
    pub poll_interval: Duration,
    /// Reap exited jobs every this many ticks.
    pub purge_every: u64,
    /// Run-time limit of a started job.
    pub max_job_runtime: Option<Duration>,
    /// How long one queue poll of the listener may block.
    pub listen_wait: Duration,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            number_of_workers: 3,
            poll_interval: Duration::from_millis(50),
            purge_every: 20,
            max_job_runtime: None,
            listen_wait: Duration::from_millis(200),
        }
    }
}

impl QueueManagerConfig {
    /// Settings from the global configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            number_of_workers: config.number_of_workers.max(1),
            max_job_runtime: config.max_job_runtime,
            ..Self::default()
        }
    }
}

/// A job known to the manager.
#[derive(Debug)]
pub struct EnqueuedProcess {
    /// The submitted job.
    pub job: QueuedJob,
    /// When the job entered the waiting list.
    pub enqueued_at: Instant,
    /// When the job was started.
    pub started_at: Option<Instant>,
    /// Runner handle once started.
    pub handle: Option<JobHandle>,
}

impl EnqueuedProcess {
    fn new(job: QueuedJob) -> Self {
        Self {
            job,
            enqueued_at: Instant::now(),
            started_at: None,
            handle: None,
        }
    }

    fn resource_id(&self) -> &str {
        &self.job.resource.resource_id
    }

    fn wait_expired(&self) -> bool {
        self.enqueued_at.elapsed() > self.job.wait_timeout()
    }
}

/// Supervisor of queued and running jobs.
pub struct ProcessQueueManager {
    queue: Arc<dyn JobQueue>,
    runner: Arc<dyn JobRunner>,
    logger: ResourceLogger,
    config: QueueManagerConfig,
    shutdown: Arc<Notify>,
}

impl ProcessQueueManager {
    /// Create a manager.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        runner: Arc<dyn JobRunner>,
        logger: ResourceLogger,
        config: QueueManagerConfig,
    ) -> Self {
        Self {
            queue,
            runner,
            logger,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    ///
    /// Shutdown terminates every running and waiting job, like `Stop`.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    fn spawn_listener(&self) -> mpsc::Receiver<QueueMessage> {
        let (tx, rx) = mpsc::channel(INTAKE_CAPACITY);
        let queue = self.queue.clone();
        let wait = self.config.listen_wait;
        tokio::spawn(async move {
            loop {
                match queue.pop(wait).await {
                    Ok(Some(message)) => {
                        let stop = matches!(message, QueueMessage::Stop);
                        if tx.send(message).await.is_err() || stop {
                            break;
                        }
                    }
                    Ok(None) => {
                        if tx.is_closed() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to read the job queue");
                        tokio::time::sleep(wait).await;
                    }
                }
            }
            debug!("Queue listener stopped");
        });
        rx
    }

    /// Run the supervisor loop until `Stop` or shutdown.
    pub async fn run(&self) {
        info!(
            number_of_workers = self.config.number_of_workers,
            runner = self.runner.runner_type(),
            "Process queue manager started"
        );

        let mut intake = self.spawn_listener();
        let mut waiting: VecDeque<EnqueuedProcess> = VecDeque::new();
        let mut running: Vec<EnqueuedProcess> = Vec::new();
        let mut tick: u64 = 0;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Process queue manager received shutdown signal");
                    self.terminate_all(&mut waiting, &mut running, "Process queue manager was shut down")
                        .await;
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let mut stop = false;
            while let Ok(message) = intake.try_recv() {
                match message {
                    QueueMessage::Job(job) => {
                        info!(resource_id = %job.resource.resource_id, "Job queued");
                        waiting.push_back(EnqueuedProcess::new(job));
                    }
                    QueueMessage::Stop => stop = true,
                }
            }
            if stop {
                info!("Stop message received");
                self.terminate_all(&mut waiting, &mut running, "Process queue manager was stopped")
                    .await;
                break;
            }

            if running.len() < self.config.number_of_workers
                && let Some(process) = waiting.pop_front()
            {
                if let Some(started) = self.start(process).await {
                    running.push(started);
                }
            }

            tick += 1;
            if tick % self.config.purge_every.max(1) == 0 {
                self.purge_running(&mut running).await;
            }
            self.enforce_runtime(&mut running).await;
            self.purge_waiting(&mut waiting).await;
        }

        info!("Process queue manager stopped");
    }

    async fn start(&self, mut process: EnqueuedProcess) -> Option<EnqueuedProcess> {
        match self.runner.launch(&process.job).await {
            Ok(handle) => {
                info!(
                    resource_id = %process.resource_id(),
                    handle_id = %handle.handle_id,
                    waited_ms = process.enqueued_at.elapsed().as_millis() as u64,
                    "Job started"
                );
                process.handle = Some(handle);
                process.started_at = Some(Instant::now());
                Some(process)
            }
            Err(e) => {
                error!(resource_id = %process.resource_id(), error = %e, "Failed to start job");
                self.write_status(
                    &process.job,
                    ResourceStatus::Error,
                    format!("Unable to start the job: {e}"),
                    Some("RunnerError"),
                )
                .await;
                None
            }
        }
    }

    async fn purge_running(&self, running: &mut Vec<EnqueuedProcess>) {
        let mut still_running = Vec::with_capacity(running.len());
        for process in running.drain(..) {
            let Some(handle) = &process.handle else {
                continue;
            };
            let Some(code) = self.runner.exit_code(handle).await else {
                still_running.push(process);
                continue;
            };
            debug!(resource_id = %process.resource_id(), code, "Job exited");

            let reported = self.current_record(&process.job).await;
            if reported.as_ref().is_some_and(|r| r.status.is_terminal()) {
                continue;
            }
            warn!(
                resource_id = %process.resource_id(),
                code,
                "Job exited without reporting a final status"
            );
            self.write_status(
                &process.job,
                ResourceStatus::Error,
                format!("The job process exited unexpectedly with exit code {code}"),
                Some("UnexpectedExit"),
            )
            .await;
        }
        *running = still_running;
    }

    async fn enforce_runtime(&self, running: &mut Vec<EnqueuedProcess>) {
        let Some(limit) = self.config.max_job_runtime else {
            return;
        };
        let mut kept = Vec::with_capacity(running.len());
        for process in running.drain(..) {
            let expired = process.started_at.is_some_and(|t| t.elapsed() > limit);
            if !expired || self.has_ended(&process).await {
                // exited jobs are left to the reap pass
                kept.push(process);
                continue;
            }
            warn!(resource_id = %process.resource_id(), limit_secs = limit.as_secs(), "Job exceeded its run-time limit");
            self.terminate(
                &process,
                ResourceStatus::Timeout,
                &format!(
                    "Terminated while running: exceeded the run-time limit of {}s",
                    limit.as_secs_f64()
                ),
            )
            .await;
        }
        *running = kept;
    }

    /// Whether a started job already exited or reported a final status.
    async fn has_ended(&self, process: &EnqueuedProcess) -> bool {
        if let Some(handle) = &process.handle
            && self.runner.exit_code(handle).await.is_some()
        {
            return true;
        }
        self.current_record(&process.job)
            .await
            .is_some_and(|r| r.status.is_terminal())
    }

    async fn purge_waiting(&self, waiting: &mut VecDeque<EnqueuedProcess>) {
        let (expired, kept): (Vec<_>, Vec<_>) = waiting.drain(..).partition(|p| p.wait_expired());
        waiting.extend(kept);
        for process in expired {
            warn!(
                resource_id = %process.resource_id(),
                wait_timeout_secs = process.job.wait_timeout_secs,
                "Job waited too long in the queue"
            );
            self.terminate(
                &process,
                ResourceStatus::Timeout,
                &format!(
                    "Terminated while waiting: not started within {}s",
                    process.job.wait_timeout_secs
                ),
            )
            .await;
        }
    }

    async fn terminate_all(
        &self,
        waiting: &mut VecDeque<EnqueuedProcess>,
        running: &mut Vec<EnqueuedProcess>,
        reason: &str,
    ) {
        for process in running.drain(..) {
            if self.has_ended(&process).await {
                continue;
            }
            self.terminate(&process, ResourceStatus::Terminated, &format!("{reason}: terminated while running"))
                .await;
        }
        for process in waiting.drain(..) {
            self.terminate(&process, ResourceStatus::Terminated, &format!("{reason}: terminated while waiting"))
                .await;
        }
    }

    /// Stop a job if it was started, then write its status unconditionally.
    async fn terminate(&self, process: &EnqueuedProcess, status: ResourceStatus, message: &str) {
        if let Some(handle) = &process.handle
            && let Err(e) = self.runner.stop(handle).await
        {
            error!(resource_id = %process.resource_id(), error = %e, "Failed to stop job");
        }
        info!(resource_id = %process.resource_id(), status = %status, "Job terminated");
        self.write_status(&process.job, status, message.to_string(), None).await;
    }

    async fn current_record(&self, job: &QueuedJob) -> Option<ResourceStatusRecord> {
        let rdc = &job.resource;
        match self.logger.get(&rdc.user_id, &rdc.resource_id, rdc.iteration).await {
            Ok(record) => record,
            Err(e) => {
                error!(resource_id = %rdc.resource_id, error = %e, "Failed to read status record");
                None
            }
        }
    }

    async fn write_status(
        &self,
        job: &QueuedJob,
        status: ResourceStatus,
        message: String,
        exception: Option<&str>,
    ) {
        let base = self
            .current_record(job)
            .await
            .unwrap_or_else(|| ResourceStatusRecord::accepted(&job.resource));
        let mut record = base.transition(status, message.clone());
        if let Some(kind) = exception {
            record = record.with_exception(kind, message);
        }
        if let Err(e) = self.logger.commit(&record).await {
            error!(resource_id = %job.resource.resource_id, error = %e, "Failed to write status record");
        }
    }
}
