// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor backed by OS processes.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{ExecOutput, ExecRequest, ExecutorError, ProcessExecutor};

/// Runs programs with `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor;

#[async_trait]
impl ProcessExecutor for SystemExecutor {
    async fn execute(&self, request: &ExecRequest) -> Result<ExecOutput, ExecutorError> {
        let start = Instant::now();

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .envs(&request.env)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecutorError::NotFound(request.program.clone())
            } else {
                ExecutorError::Spawn {
                    program: request.program.clone(),
                    source: e,
                }
            }
        })?;
        debug!(program = %request.program, pid = ?child.id(), "Process spawned");

        // stdin must be fed while stdout and stderr are drained
        let stdin = child.stdin.take();
        let feed = async move {
            if let (Some(input), Some(mut stdin)) = (request.stdin.as_deref(), stdin) {
                stdin.write_all(input.as_bytes()).await?;
                // dropping closes the pipe
                drop(stdin);
            }
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        match fed {
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!(program = %request.program, "Process exited before reading all of stdin");
            }
            other => other?,
        }
        Ok(ExecOutput {
            return_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            run_time: start.elapsed(),
        })
    }
}
