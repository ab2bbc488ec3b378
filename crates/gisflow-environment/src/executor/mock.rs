// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock executor for testing.
//!
//! Simulates module execution without GRASS installed. A handler closure
//! decides each invocation's output and may touch the filesystem to mimic
//! what a module would write into the mapset.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ExecOutput, ExecRequest, ExecutorError, ProcessExecutor};

type Handler = dyn Fn(&ExecRequest) -> ExecOutput + Send + Sync;

/// Mock executor for testing.
#[derive(Clone)]
pub struct MockExecutor {
    handler: Arc<Handler>,
    calls: Arc<Mutex<Vec<ExecRequest>>>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    /// Executor where every program succeeds with empty output.
    pub fn new() -> Self {
        Self::with_handler(|_| ExecOutput::default())
    }

    /// Executor whose output is decided by `handler`.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&ExecRequest) -> ExecOutput + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Executor where the named program fails with `return_code`.
    pub fn failing_on(program: &str, return_code: i32) -> Self {
        let program = program.to_string();
        Self::with_handler(move |request| {
            if request.program == program {
                ExecOutput::failure(return_code, format!("{program} failed"))
            } else {
                ExecOutput::default()
            }
        })
    }

    /// Every invocation so far, in order.
    pub async fn calls(&self) -> Vec<ExecRequest> {
        self.calls.lock().await.clone()
    }

    /// Program names invoked so far, in order.
    pub async fn programs(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .map(|c| c.program.clone())
            .collect()
    }
}

#[async_trait]
impl ProcessExecutor for MockExecutor {
    async fn execute(&self, request: &ExecRequest) -> Result<ExecOutput, ExecutorError> {
        self.calls.lock().await.push(request.clone());
        Ok((self.handler)(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls() {
        let executor = MockExecutor::failing_on("r.slope.aspect", 1);
        let ok = executor
            .execute(&ExecRequest {
                program: "g.region".into(),
                ..ExecRequest::default()
            })
            .await
            .unwrap();
        let failed = executor
            .execute(&ExecRequest {
                program: "r.slope.aspect".into(),
                ..ExecRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(ok.return_code, 0);
        assert_eq!(failed.return_code, 1);
        assert_eq!(executor.programs().await, vec!["g.region", "r.slope.aspect"]);
    }
}
