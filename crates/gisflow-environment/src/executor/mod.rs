// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process executors.
//!
//! An executor runs one program with an argument list (never through a
//! shell) and returns its exit code, captured output and wall time.

pub mod mock;
pub mod system;

pub use mock::MockExecutor;
pub use system::SystemExecutor;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from process execution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// The program could not be found.
    #[error("Program not found: {0}")]
    NotFound(String),

    /// The program could not be started.
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// I/O with the running program failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One program invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    /// Program name or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Data written to stdin.
    pub stdin: Option<String>,
    /// Working directory.
    pub working_dir: Option<PathBuf>,
}

/// Result of an invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code; -1 when killed by a signal.
    pub return_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Wall-clock time.
    pub run_time: Duration,
}

impl ExecOutput {
    /// Successful output with the given stdout.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// Failed output with the given code and stderr.
    pub fn failure(return_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            return_code,
            stderr: stderr.into(),
            ..Self::default()
        }
    }
}

/// Runs external programs.
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    /// Run a program to completion.
    async fn execute(&self, request: &ExecRequest) -> Result<ExecOutput, ExecutorError>;
}
