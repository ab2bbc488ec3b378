// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// When interim results are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InterimMode {
    /// Never save interim results.
    #[default]
    Off,
    /// Save after every successful step.
    Always,
    /// Save only the last successful step when the job fails.
    OnError,
}

impl FromStr for InterimMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "false" | "False" | "0" | "" => Ok(Self::Off),
            "true" | "True" | "1" => Ok(Self::Always),
            "onError" | "on_error" => Ok(Self::OnError),
            _ => Err(ConfigError::Invalid(
                "GISFLOW_SAVE_INTERIM_RESULTS",
                "must be one of false, true, onError",
            )),
        }
    }
}

/// Interim result (checkpoint) settings.
#[derive(Debug, Clone)]
pub struct InterimConfig {
    /// Whether and when checkpoints are written.
    pub mode: InterimMode,
    /// Root directory of the interim result tree.
    pub root: PathBuf,
    /// Endpoints for which checkpointing is enabled.
    pub endpoints: BTreeSet<String>,
    /// Glob pattern selecting extra mapsets of the temporary location to save.
    pub additional_mapsets_pattern: Option<String>,
}

impl Default for InterimConfig {
    fn default() -> Self {
        Self {
            mode: InterimMode::Off,
            root: PathBuf::from(".data/interim"),
            endpoints: ["ephemeral", "persistent"]
                .into_iter()
                .map(String::from)
                .collect(),
            additional_mapsets_pattern: None,
        }
    }
}

/// gisflow configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection URL (status records, locks, job queue)
    pub redis_url: String,
    /// Redis list used as the job submission queue
    pub queue_name: String,
    /// Global, read-only GRASS database
    pub grass_database: PathBuf,
    /// Per-group persistent GRASS database
    pub grass_user_database: PathBuf,
    /// Root for temporary databases and working directories
    pub grass_tmp_database: PathBuf,
    /// GRASS installation (GISBASE)
    pub grass_gis_base: PathBuf,
    /// Where exported resources are stored
    pub download_cache: PathBuf,
    /// Maximum number of concurrently running jobs
    pub number_of_workers: usize,
    /// Default time a job may wait in the queue before it is dropped
    pub queue_wait_timeout: Duration,
    /// Maximum wall-clock time of a running job (enforced by the queue manager)
    pub max_job_runtime: Option<Duration>,
    /// Time limit of a single process
    pub process_time_limit: Duration,
    /// Maximum number of processes in a chain
    pub process_num_limit: usize,
    /// Expiration of status records
    pub resource_expire_time: Duration,
    /// Modules a chain may run (None = all)
    pub allowed_modules: Option<BTreeSet<String>>,
    /// Timeout of webhook probes and notifications
    pub webhook_timeout: Duration,
    /// Interim result settings
    pub interim: InterimConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            queue_name: "gisflow_job_queue".to_string(),
            grass_database: PathBuf::from(".data/grassdb"),
            grass_user_database: PathBuf::from(".data/userdata"),
            grass_tmp_database: PathBuf::from(".data/workspace"),
            grass_gis_base: PathBuf::from("/usr/local/grass"),
            download_cache: PathBuf::from(".data/download_cache"),
            number_of_workers: 3,
            queue_wait_timeout: Duration::from_secs(3600),
            max_job_runtime: None,
            process_time_limit: Duration::from_secs(630),
            process_num_limit: 1000,
            resource_expire_time: Duration::from_secs(864_000),
            allowed_modules: None,
            webhook_timeout: Duration::from_secs(10),
            interim: InterimConfig::default(),
        }
    }
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(var: &'static str, default: T, hint: &'static str) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(v) => v.parse().map_err(|_| ConfigError::Invalid(var, hint)),
        Err(_) => Ok(default),
    }
}

fn env_secs(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(v) => v
            .parse::<f64>()
            .ok()
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64)
            .ok_or(ConfigError::Invalid(var, "must be a non-negative number of seconds")),
        Err(_) => Ok(default),
    }
}

fn env_list(var: &str) -> Option<BTreeSet<String>> {
    let raw = std::env::var(var).ok()?;
    let items: BTreeSet<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    (!items.is_empty()).then_some(items)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unset variables fall back to [`Config::default`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let number_of_workers: usize = env_parse(
            "GISFLOW_NUMBER_OF_WORKERS",
            defaults.number_of_workers,
            "must be a positive integer",
        )?;
        if number_of_workers == 0 {
            return Err(ConfigError::Invalid(
                "GISFLOW_NUMBER_OF_WORKERS",
                "must be a positive integer",
            ));
        }

        let max_job_runtime = match std::env::var("GISFLOW_MAX_JOB_RUNTIME") {
            Ok(_) => Some(env_secs("GISFLOW_MAX_JOB_RUNTIME", Duration::ZERO)?),
            Err(_) => None,
        };

        let interim = InterimConfig {
            mode: env_or("GISFLOW_SAVE_INTERIM_RESULTS", "false").parse()?,
            root: PathBuf::from(env_or("GISFLOW_INTERIM_RESULTS_DIR", ".data/interim")),
            endpoints: env_list("GISFLOW_INTERIM_ENDPOINTS")
                .unwrap_or(defaults.interim.endpoints),
            additional_mapsets_pattern: std::env::var("GISFLOW_INTERIM_ADDITIONAL_MAPSETS")
                .ok()
                .filter(|p| !p.is_empty()),
        };

        Ok(Self {
            redis_url: env_or("GISFLOW_REDIS_URL", &defaults.redis_url),
            queue_name: env_or("GISFLOW_QUEUE_NAME", &defaults.queue_name),
            grass_database: PathBuf::from(env_or("GISFLOW_GRASS_DATABASE", ".data/grassdb")),
            grass_user_database: PathBuf::from(env_or(
                "GISFLOW_GRASS_USER_DATABASE",
                ".data/userdata",
            )),
            grass_tmp_database: PathBuf::from(env_or(
                "GISFLOW_GRASS_TMP_DATABASE",
                ".data/workspace",
            )),
            grass_gis_base: PathBuf::from(env_or("GISFLOW_GRASS_GIS_BASE", "/usr/local/grass")),
            download_cache: PathBuf::from(env_or(
                "GISFLOW_DOWNLOAD_CACHE",
                ".data/download_cache",
            )),
            number_of_workers,
            queue_wait_timeout: env_secs("GISFLOW_QUEUE_WAIT_TIMEOUT", defaults.queue_wait_timeout)?,
            max_job_runtime,
            process_time_limit: env_secs("GISFLOW_PROCESS_TIME_LIMIT", defaults.process_time_limit)?,
            process_num_limit: env_parse(
                "GISFLOW_PROCESS_NUM_LIMIT",
                defaults.process_num_limit,
                "must be a positive integer",
            )?,
            resource_expire_time: env_secs(
                "GISFLOW_RESOURCE_EXPIRE_TIME",
                defaults.resource_expire_time,
            )?,
            allowed_modules: env_list("GISFLOW_ALLOWED_MODULES"),
            webhook_timeout: env_secs("GISFLOW_WEBHOOK_TIMEOUT", defaults.webhook_timeout)?,
            interim,
        })
    }

    /// Build a config rooted in one directory (tests, local development).
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            grass_database: root.join("grassdb"),
            grass_user_database: root.join("userdata"),
            grass_tmp_database: root.join("workspace"),
            download_cache: root.join("download_cache"),
            interim: InterimConfig {
                root: root.join("interim"),
                ..InterimConfig::default()
            },
            ..Self::default()
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
