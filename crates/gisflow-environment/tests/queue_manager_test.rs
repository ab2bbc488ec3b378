// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue manager tests with the mock runner and the in-process task runner.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestEnv, USER};
use gisflow_core::queue::{JobQueue, MemoryJobQueue, QueueMessage, QueuedJob};
use gisflow_core::resource::Entrypoint;
use gisflow_core::{ResourceStatus, ResourceStatusRecord};
use gisflow_environment::runner::{JobRunner, MockJobRunner, TaskRunner};
use gisflow_environment::{ProcessQueueManager, QueueManagerConfig};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

fn manager_config(workers: usize) -> QueueManagerConfig {
    QueueManagerConfig {
        number_of_workers: workers,
        poll_interval: Duration::from_millis(5),
        purge_every: 1,
        max_job_runtime: None,
        listen_wait: Duration::from_millis(10),
    }
}

struct Harness {
    env: TestEnv,
    queue: MemoryJobQueue,
    manager: Arc<ProcessQueueManager>,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(env: TestEnv, runner: Arc<dyn JobRunner>, config: QueueManagerConfig) -> Self {
        let queue = MemoryJobQueue::new();
        let manager = Arc::new(ProcessQueueManager::new(
            Arc::new(queue.clone()),
            runner,
            env.ctx.logger.clone(),
            config,
        ));
        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run().await }
        });
        Self {
            env,
            queue,
            manager,
            task,
        }
    }

    async fn submit(&self, chain: Value, wait_timeout: Duration) -> String {
        let rdc = self.env.rdc(chain, Entrypoint::Ephemeral);
        let resource_id = rdc.resource_id.clone();
        let job = QueuedJob::new(Entrypoint::Ephemeral, rdc, wait_timeout);
        self.queue.push(QueueMessage::Job(job)).await.unwrap();
        resource_id
    }

    async fn record(&self, resource_id: &str) -> Option<ResourceStatusRecord> {
        self.env.ctx.logger.get(USER, resource_id, 1).await.unwrap()
    }

    async fn wait_for(&self, resource_id: &str, status: ResourceStatus) -> ResourceStatusRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(record) = self.record(resource_id).await
                && record.status == status
            {
                return record;
            }
            assert!(tokio::time::Instant::now() < deadline, "{resource_id} never reached {status}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn stop(self) -> TestEnv {
        self.queue.push(QueueMessage::Stop).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("manager did not stop")
            .unwrap();
        self.env
    }
}

fn region_chain() -> Value {
    json!({"1": {"module": "g.region", "flags": "p"}})
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_waiting_job_times_out_without_starting() {
    let runner = MockJobRunner::never_completing();
    let h = Harness::start(TestEnv::new(), Arc::new(runner.clone()), manager_config(1));

    let first = h.submit(region_chain(), Duration::from_secs(60)).await;
    let second = h.submit(region_chain(), Duration::from_millis(50)).await;

    let record = h.wait_for(&second, ResourceStatus::Timeout).await;
    assert!(record.message.contains("Terminated while waiting"));
    assert_eq!(runner.launched().await, vec![first.clone()]);

    let env = h.stop().await;
    let record = env.ctx.logger.get(USER, &first, 1).await.unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::Terminated);
    assert_eq!(runner.stopped().await, vec![first]);
}

#[tokio::test]
async fn test_unexpected_exit_is_recorded_as_error() {
    let h = Harness::start(TestEnv::new(), Arc::new(MockJobRunner::crashing(2)), manager_config(1));

    let id = h.submit(region_chain(), Duration::from_secs(60)).await;
    let record = h.wait_for(&id, ResourceStatus::Error).await;
    let exception = record.exception.unwrap();
    assert_eq!(exception.kind, "UnexpectedExit");
    assert!(exception.message.contains("exit code 2"));

    h.stop().await;
}

#[tokio::test]
async fn test_run_time_limit_stops_job() {
    let runner = MockJobRunner::never_completing();
    let config = QueueManagerConfig {
        max_job_runtime: Some(Duration::from_millis(50)),
        ..manager_config(2)
    };
    let h = Harness::start(TestEnv::new(), Arc::new(runner.clone()), config);

    let id = h.submit(region_chain(), Duration::from_secs(60)).await;
    let record = h.wait_for(&id, ResourceStatus::Timeout).await;
    assert!(record.message.contains("Terminated while running"));
    assert_eq!(runner.stopped().await, vec![id]);

    h.stop().await;
}

#[tokio::test]
async fn test_run_time_limit_keeps_finished_status() {
    let mut runner = MockJobRunner::new();
    runner.execution_delay_ms = 150;
    let config = QueueManagerConfig {
        poll_interval: Duration::from_millis(50),
        purge_every: 20,
        max_job_runtime: Some(Duration::from_millis(300)),
        ..manager_config(1)
    };
    let h = Harness::start(TestEnv::new(), Arc::new(runner.clone()), config);

    // The worker reports its own final status before exiting
    let rdc = h.env.rdc(region_chain(), Entrypoint::Ephemeral);
    let id = rdc.resource_id.clone();
    let finished = ResourceStatusRecord::accepted(&rdc)
        .transition(ResourceStatus::Finished, "Processing successfully finished");
    h.env.ctx.logger.commit(&finished).await.unwrap();
    let job = QueuedJob::new(Entrypoint::Ephemeral, rdc, Duration::from_secs(60));
    h.queue.push(QueueMessage::Job(job)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.record(&id).await.unwrap().status, ResourceStatus::Finished);

    let env = h.stop().await;
    let record = env.ctx.logger.get(USER, &id, 1).await.unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::Finished);
    assert!(runner.stopped().await.is_empty());
    assert_eq!(runner.launched().await, vec![id]);
}

#[tokio::test]
async fn test_jobs_start_in_submission_order() {
    let runner = MockJobRunner::new();
    let h = Harness::start(TestEnv::new(), Arc::new(runner.clone()), manager_config(1));

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(h.submit(region_chain(), Duration::from_secs(60)).await);
    }
    wait_until(|| {
        let runner = runner.clone();
        async move { runner.launched().await.len() == 3 }
    })
    .await;
    assert_eq!(runner.launched().await, ids);

    h.stop().await;
}

#[tokio::test]
async fn test_shutdown_terminates_running_and_waiting() {
    let runner = MockJobRunner::never_completing();
    let h = Harness::start(TestEnv::new(), Arc::new(runner.clone()), manager_config(1));

    let running = h.submit(region_chain(), Duration::from_secs(60)).await;
    let waiting = h.submit(region_chain(), Duration::from_secs(60)).await;
    wait_until(|| {
        let runner = runner.clone();
        async move { runner.launched().await.len() == 1 }
    })
    .await;

    h.manager.shutdown_handle().notify_one();
    tokio::time::timeout(Duration::from_secs(5), h.task)
        .await
        .expect("manager did not stop")
        .unwrap();

    for id in [&running, &waiting] {
        let record = h.env.ctx.logger.get(USER, id, 1).await.unwrap().unwrap();
        assert_eq!(record.status, ResourceStatus::Terminated);
    }
    assert_eq!(runner.stopped().await, vec![running]);
}

#[tokio::test]
async fn test_task_runner_runs_jobs_end_to_end() {
    let env = TestEnv::new();
    let runner = TaskRunner::new(env.ctx.clone()).with_grace_period(Duration::from_millis(50));
    let h = Harness::start(env, Arc::new(runner), manager_config(2));

    let ok = h.submit(region_chain(), Duration::from_secs(60)).await;
    let broken = h
        .submit(json!({"1": {"module": "g.region", "flags": "p&"}}), Duration::from_secs(60))
        .await;

    let record = h.wait_for(&ok, ResourceStatus::Finished).await;
    assert_eq!(record.process_log.len(), 1);

    let record = h.wait_for(&broken, ResourceStatus::Error).await;
    // The job reported its own failure; reaping must not overwrite it
    tokio::time::sleep(Duration::from_millis(50)).await;
    let record_after = h.record(&broken).await.unwrap();
    assert_eq!(record_after.exception.unwrap().kind, "CompileError");
    assert_eq!(record.status, ResourceStatus::Error);

    let env = h.stop().await;
    assert!(env.leftover_jobs().is_empty());
}
