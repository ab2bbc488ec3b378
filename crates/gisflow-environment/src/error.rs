// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for gisflow-environment.

use gisflow_core::ResourceStatus;
use thiserror::Error;

/// Environment errors.
///
/// Every error ends a job attempt with exactly one terminal status, see
/// [`Error::terminal_status`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] gisflow_core::config::ConfigError),

    /// Store, queue or record serialization failed.
    #[error("Core error: {0}")]
    Core(#[from] gisflow_core::CoreError),

    /// The process chain did not compile.
    #[error("Process chain error: {0}")]
    Chain(#[from] gisflow_core::ChainError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Job runner failed.
    #[error("Runner error: {0}")]
    Runner(#[from] crate::runner::RunnerError),

    /// Target or temporary mapset is locked by another job.
    #[error("Mapset <{0}> is already locked by another job")]
    LockUnavailable(String),

    /// A module or executable returned non-zero.
    #[error("Process '{process_id}' ({executable}) failed with return code {return_code}: {stderr}")]
    ProcessFailure {
        /// Process id within the chain.
        process_id: String,
        /// Program name.
        executable: String,
        /// Exit code.
        return_code: i32,
        /// Captured stderr.
        stderr: String,
    },

    /// Copying or syncing a checkpoint failed.
    #[error("Interim result sync failed: {0}")]
    Sync(String),

    /// Termination was requested.
    #[error("Processing was terminated: {0}")]
    Terminated(String),

    /// A time limit was exceeded.
    #[error("Processing timed out: {0}")]
    Timeout(String),

    /// The mapset lives in the global read-only database.
    #[error("Mapset <{mapset}> of location <{location}> is read only")]
    ReadOnlyMapset {
        /// Location name.
        location: String,
        /// Mapset name.
        mapset: String,
    },

    /// A mapset does not exist.
    #[error("Mapset <{0}> does not exist")]
    MapsetNotFound(String),

    /// A location does not exist.
    #[error("Location <{0}> does not exist")]
    LocationNotFound(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Terminal status of a job that ended with this error.
    pub fn terminal_status(&self) -> ResourceStatus {
        match self {
            Self::Terminated(_) => ResourceStatus::Terminated,
            Self::Timeout(_) => ResourceStatus::Timeout,
            _ => ResourceStatus::Error,
        }
    }

    /// Short error kind for status records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Core(_) => "CoreError",
            Self::Chain(_) => "CompileError",
            Self::Io(_) => "IOError",
            Self::Json(_) => "JsonError",
            Self::Runner(_) => "RunnerError",
            Self::LockUnavailable(_) => "LockUnavailable",
            Self::ProcessFailure { .. } => "ExternalProcessFailure",
            Self::Sync(_) => "SyncError",
            Self::Terminated(_) => "Termination",
            Self::Timeout(_) => "Timeout",
            Self::ReadOnlyMapset { .. } => "ReadOnlyMapset",
            Self::MapsetNotFound(_) => "MapsetNotFound",
            Self::LocationNotFound(_) => "LocationNotFound",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::Other(_) => "Error",
        }
    }
}

/// Result type using Environment Error.
pub type Result<T> = std::result::Result<T, Error>;
