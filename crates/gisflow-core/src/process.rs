// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One external command invocation.

use serde::{Deserialize, Serialize};

/// Whether a process is a GRASS module or a plain executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    /// GRASS GIS module, resolved inside the GRASS session.
    Module,
    /// Arbitrary UNIX executable.
    Executable,
}

/// Which captured stream of another process feeds stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdStream {
    /// Captured standard output.
    Stdout,
    /// Captured standard error.
    Stderr,
}

/// Reference to another process's captured output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdinSource {
    /// Id of the earlier process.
    pub process_id: String,
    /// Stream to read.
    pub stream: StdStream,
}

/// An external invocation compiled from a process chain.
///
/// Created by the chain compiler, filled in once with the captured output
/// after execution and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    /// Unique id within the chain.
    pub id: String,
    /// Module or executable.
    pub kind: ProcessKind,
    /// Program name.
    pub name: String,
    /// Argument list, passed without a shell.
    pub args: Vec<String>,
    /// Optional stdin source.
    pub stdin_source: Option<StdinSource>,
    /// Generated processes (imports, exports) bypass the module allow-list.
    pub skip_permission_check: bool,
    /// Captured stdout after execution.
    pub stdout: Option<String>,
    /// Captured stderr after execution.
    pub stderr: Option<String>,
    /// Set once the process has run.
    pub finished: bool,
}

impl Process {
    /// Create a GRASS module invocation.
    pub fn module(id: impl Into<String>, name: impl Into<String>, args: Vec<String>) -> Self {
        Self::new(ProcessKind::Module, id, name, args)
    }

    /// Create an executable invocation.
    pub fn executable(id: impl Into<String>, name: impl Into<String>, args: Vec<String>) -> Self {
        Self::new(ProcessKind::Executable, id, name, args)
    }

    fn new(kind: ProcessKind, id: impl Into<String>, name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            args,
            stdin_source: None,
            skip_permission_check: false,
            stdout: None,
            stderr: None,
            finished: false,
        }
    }

    /// Mark the process as generated (no allow-list check).
    pub fn skipping_permission_check(mut self) -> Self {
        self.skip_permission_check = true;
        self
    }

    /// Attach a stdin source.
    pub fn with_stdin(mut self, source: StdinSource) -> Self {
        self.stdin_source = Some(source);
        self
    }

    /// Record the captured output. Only the first call has an effect.
    pub fn set_output(&mut self, stdout: String, stderr: String) {
        if self.finished {
            return;
        }
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
        self.finished = true;
    }

    /// The captured stream selected by `stream`, if the process has run.
    pub fn captured(&self, stream: StdStream) -> Option<&str> {
        match stream {
            StdStream::Stdout => self.stdout.as_deref(),
            StdStream::Stderr => self.stderr.as_deref(),
        }
    }

    /// Command line for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.name.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
