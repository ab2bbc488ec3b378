// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource data container and status records.
//!
//! A resource is one asynchronous job. Its [`ResourceDataContainer`] carries
//! everything a worker process needs to run it; its [`ResourceStatusRecord`]
//! is the authoritative status object stored under
//! `{user_id}/{resource_id}/{iteration}`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Enqueued, not yet started.
    Accepted,
    /// A worker is executing the job.
    Running,
    /// Completed successfully.
    Finished,
    /// Failed.
    Error,
    /// Stopped on request or by server shutdown.
    Terminated,
    /// Exceeded a queue-wait or run-time limit.
    Timeout,
}

impl ResourceStatus {
    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Error | Self::Terminated | Self::Timeout
        )
    }

    /// String form used in records and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Terminated => "terminated",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(Self::Accepted),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "error" => Ok(Self::Error),
            "terminated" => Ok(Self::Terminated),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown resource status '{other}'")),
        }
    }
}

/// Log entry of one executed process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessLogEntry {
    /// Process id within the chain.
    pub id: String,
    /// Program name.
    pub executable: String,
    /// Arguments.
    pub parameter: Vec<String>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Exit code (-1 when killed by a signal).
    pub return_code: i32,
    /// Wall-clock run time in seconds.
    pub run_time: f64,
    /// Size of the working mapset in bytes after the step (interim saving only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapset_size: Option<u64>,
}

/// Step progress of a running job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Completed steps.
    pub step: usize,
    /// Total steps of the compiled chain.
    pub num_of_steps: usize,
}

/// URLs attached to a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUrls {
    /// Where clients poll the status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Exported resources.
    #[serde(default)]
    pub resources: Vec<String>,
}

/// Error details of a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    /// Error kind (e.g. `LockUnavailable`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

/// Authoritative status object of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatusRecord {
    /// Current status.
    pub status: ResourceStatus,
    /// Owner.
    pub user_id: String,
    /// Resource id.
    pub resource_id: String,
    /// Iteration (incremented on every resume).
    pub iteration: u32,
    /// Endpoint that accepted the job.
    #[serde(default)]
    pub endpoint: String,
    /// When the job was accepted.
    pub accept_datetime: DateTime<Utc>,
    /// Accept time as unix seconds.
    pub accept_timestamp: f64,
    /// When this record was written.
    pub datetime: DateTime<Utc>,
    /// Write time as unix seconds.
    pub timestamp: f64,
    /// Seconds between accept and this write.
    pub time_delta: f64,
    /// Human-readable message.
    pub message: String,
    /// Step progress.
    #[serde(default)]
    pub progress: Progress,
    /// Per-process log up to now.
    #[serde(default)]
    pub process_log: Vec<ProcessLogEntry>,
    /// Parsed stdout results keyed by process id.
    #[serde(default)]
    pub process_results: BTreeMap<String, Value>,
    /// Status and resource URLs.
    #[serde(default)]
    pub urls: ResourceUrls,
    /// Error details for `error` records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionInfo>,
}

fn unix_seconds(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0
}

impl ResourceStatusRecord {
    /// Initial record for a freshly accepted job.
    pub fn accepted(rdc: &ResourceDataContainer) -> Self {
        let now = Utc::now();
        Self {
            status: ResourceStatus::Accepted,
            user_id: rdc.user_id.clone(),
            resource_id: rdc.resource_id.clone(),
            iteration: rdc.iteration,
            endpoint: rdc.endpoint.clone(),
            accept_datetime: rdc.accept_datetime,
            accept_timestamp: unix_seconds(rdc.accept_datetime),
            datetime: now,
            timestamp: unix_seconds(now),
            time_delta: (now - rdc.accept_datetime).num_milliseconds() as f64 / 1000.0,
            message: "Resource accepted".to_string(),
            progress: Progress::default(),
            process_log: Vec::new(),
            process_results: BTreeMap::new(),
            urls: ResourceUrls {
                status: rdc.status_url.clone(),
                resources: Vec::new(),
            },
            exception: None,
        }
    }

    /// Copy of this record in a new state, with fresh timestamps.
    pub fn transition(&self, status: ResourceStatus, message: impl Into<String>) -> Self {
        let now = Utc::now();
        let mut next = self.clone();
        next.status = status;
        next.message = message.into();
        next.datetime = now;
        next.timestamp = unix_seconds(now);
        next.time_delta = (now - self.accept_datetime).num_milliseconds() as f64 / 1000.0;
        next
    }

    /// Attach error details.
    pub fn with_exception(mut self, kind: impl Into<String>, message: impl Into<String>) -> Self {
        self.exception = Some(ExceptionInfo {
            kind: kind.into(),
            message: message.into(),
        });
        self
    }
}

/// Which engine a queued job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entrypoint {
    /// Throwaway copy, results discarded (exports kept).
    Ephemeral,
    /// Results merged back into the user's mapset.
    Persistent,
}

impl Entrypoint {
    /// Endpoint name used for interim result configuration.
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::Ephemeral => "ephemeral",
            Self::Persistent => "persistent",
        }
    }
}

/// Starting point of a resumed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    /// Steps already completed (execution continues with step + 1).
    pub step: usize,
    /// Saved mapset snapshot.
    pub mapset_path: PathBuf,
    /// Saved temporary file directory snapshot.
    pub tmpdir_path: PathBuf,
    /// Saved additional mapsets, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_mapsets_path: Option<PathBuf>,
}

/// Everything a worker needs to run one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDataContainer {
    /// Owner.
    pub user_id: String,
    /// Group whose database holds the user's locations.
    pub user_group: String,
    /// Resource id.
    pub resource_id: String,
    /// Iteration (1 for the first run).
    pub iteration: u32,
    /// Location (project) the chain runs in.
    pub location_name: String,
    /// Target mapset of persistent jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapset_name: Option<String>,
    /// Raw process-chain document.
    pub request_data: Value,
    /// Endpoint that accepted the job.
    pub endpoint: String,
    /// Status URL reported to clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_url: Option<String>,
    /// Per-process time limit in seconds.
    pub process_time_limit: u64,
    /// Maximum number of processes.
    pub process_num_limit: usize,
    /// When the job was accepted.
    pub accept_datetime: DateTime<Utc>,
    /// Set when the job resumes from a checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumePoint>,
}

impl ResourceDataContainer {
    /// New container with a fresh resource id.
    pub fn new(
        user_id: impl Into<String>,
        user_group: impl Into<String>,
        location_name: impl Into<String>,
        request_data: Value,
        entrypoint: Entrypoint,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_group: user_group.into(),
            resource_id: format!("resource_id-{}", uuid::Uuid::new_v4()),
            iteration: 1,
            location_name: location_name.into(),
            mapset_name: None,
            request_data,
            endpoint: entrypoint.endpoint().to_string(),
            status_url: None,
            process_time_limit: 630,
            process_num_limit: 1000,
            accept_datetime: Utc::now(),
            resume: None,
        }
    }

    /// Set the target mapset.
    pub fn with_mapset(mut self, mapset: impl Into<String>) -> Self {
        self.mapset_name = Some(mapset.into());
        self
    }

    /// Set the process limits.
    pub fn with_limits(mut self, process_time_limit: Duration, process_num_limit: usize) -> Self {
        self.process_time_limit = process_time_limit.as_secs().max(1);
        self.process_num_limit = process_num_limit;
        self
    }

    /// Per-process time limit.
    pub fn process_time_limit(&self) -> Duration {
        Duration::from_secs(self.process_time_limit)
    }

    /// Upper bound on the total job duration.
    pub fn total_time_limit(&self) -> Duration {
        self.process_time_limit() * self.process_num_limit.max(1) as u32
    }

    /// Container for the next iteration, starting from a checkpoint.
    pub fn resumed(&self, resume: ResumePoint) -> Self {
        let mut next = self.clone();
        next.iteration = self.iteration + 1;
        next.accept_datetime = Utc::now();
        next.resume = Some(resume);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_strings() {
        for status in [
            ResourceStatus::Accepted,
            ResourceStatus::Running,
            ResourceStatus::Finished,
            ResourceStatus::Error,
            ResourceStatus::Terminated,
            ResourceStatus::Timeout,
        ] {
            assert_eq!(status.as_str().parse::<ResourceStatus>().unwrap(), status);
        }
        assert!(!ResourceStatus::Running.is_terminal());
        assert!(ResourceStatus::Timeout.is_terminal());
    }

    #[test]
    fn test_transition_keeps_accept_time() {
        let rdc = ResourceDataContainer::new(
            "user",
            "group",
            "nc_spm_08",
            serde_json::json!({}),
            Entrypoint::Ephemeral,
        );
        let accepted = ResourceStatusRecord::accepted(&rdc);
        let running = accepted.transition(ResourceStatus::Running, "Running");
        assert_eq!(running.accept_datetime, accepted.accept_datetime);
        assert_eq!(running.status, ResourceStatus::Running);
        assert!(running.time_delta >= accepted.time_delta);
    }

    #[test]
    fn test_total_time_limit() {
        let rdc = ResourceDataContainer::new("u", "g", "l", serde_json::json!({}), Entrypoint::Persistent)
            .with_limits(Duration::from_secs(10), 5);
        assert_eq!(rdc.total_time_limit(), Duration::from_secs(50));
    }

    #[test]
    fn test_resumed_increments_iteration() {
        let rdc = ResourceDataContainer::new("u", "g", "l", serde_json::json!({}), Entrypoint::Ephemeral);
        let next = rdc.resumed(ResumePoint {
            step: 2,
            mapset_path: PathBuf::from("/i/step2"),
            tmpdir_path: PathBuf::from("/i/tmpdir2"),
            additional_mapsets_path: None,
        });
        assert_eq!(next.iteration, 2);
        assert_eq!(next.resource_id, rdc.resource_id);
        assert_eq!(next.resume.unwrap().step, 2);
    }
}
