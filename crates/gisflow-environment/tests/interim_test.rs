// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint tests: snapshot promotion, save modes and resume.

mod common;

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{TestEnv, USER, write, writing_outputs};
use gisflow_core::ResourceStatus;
use gisflow_core::config::InterimMode;
use gisflow_core::queue::{JobQueue, MemoryJobQueue, QueueMessage, QueuedJob};
use gisflow_core::resource::Entrypoint;
use gisflow_environment::executor::{ExecOutput, MockExecutor};
use gisflow_environment::handlers::{
    EnqueueRequest, EnvironmentHandlerState, ResumeRequest, handle_enqueue, handle_get_status, handle_resume,
    run_ephemeral,
};
use gisflow_environment::interim::{SnapshotAction, latest_checkpoint};
use gisflow_environment::{Error, InterimResult, worker};
use serde_json::{Value, json};

fn three_step_chain() -> Value {
    json!({
        "version": "1",
        "list": [
            {"id": "A", "module": "r.neighbors",
             "inputs": [{"param": "input", "value": "elevation"}],
             "outputs": [{"param": "output", "value": "a"}]},
            {"id": "B", "module": "r.univar",
             "inputs": [{"param": "map", "value": "a"}]},
            {"id": "C", "module": "r.neighbors",
             "inputs": [{"param": "input", "value": "a"}],
             "outputs": [{"param": "output", "value": "c"}]}
        ]
    })
}

async fn next_job(queue: &MemoryJobQueue) -> QueuedJob {
    match queue.pop(Duration::from_millis(100)).await.unwrap() {
        Some(QueueMessage::Job(job)) => job,
        other => panic!("expected a job, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unchanged_step_promotes_previous_snapshot() {
    let env = TestEnv::with_interim(InterimMode::Always);
    let rdc = env.rdc(json!({}), Entrypoint::Ephemeral);
    let mut interim = InterimResult::new(&env.config.interim, env.ctx.lock.clone(), &rdc);

    let mapset = env.tmp.path().join("work/mapset");
    let files = env.tmp.path().join("work/files");
    write(&mapset.join("cell/a"), "a");
    write(&files.join("out.txt"), "1");

    let action = interim.save_interim_results(1, &mapset, &files, None, false).await.unwrap();
    assert_eq!(action, SnapshotAction::Copied);
    let inode = fs::metadata(interim.step_dir(1).join("cell/a")).unwrap().ino();

    let action = interim.save_interim_results(2, &mapset, &files, None, false).await.unwrap();
    assert_eq!(action, SnapshotAction::Promoted);
    assert!(!interim.step_dir(1).exists());
    assert!(!interim.tmpdir(1).exists());
    assert_eq!(fs::metadata(interim.step_dir(2).join("cell/a")).unwrap().ino(), inode);
    assert_eq!(fs::read_to_string(interim.tmpdir(2).join("out.txt")).unwrap(), "1");

    write(&mapset.join("cell/b"), "b");
    let action = interim.save_interim_results(3, &mapset, &files, None, false).await.unwrap();
    assert_eq!(action, SnapshotAction::Synced);
    assert!(!interim.step_dir(2).exists());
    assert!(interim.step_dir(3).join("cell/b").exists());
    assert_eq!(interim.saved_step(), Some(3));

    let point = latest_checkpoint(&env.config.interim, USER, &rdc.resource_id).unwrap();
    assert_eq!(point.step, 3);
    assert_eq!(point.mapset_path, interim.step_dir(3));
    assert!(point.additional_mapsets_path.is_none());
}

#[tokio::test]
async fn test_checkpoint_lease_is_exclusive() {
    let env = TestEnv::with_interim(InterimMode::Always);
    let rdc = env.rdc(json!({}), Entrypoint::Ephemeral);
    let mut interim = InterimResult::new(&env.config.interim, env.ctx.lock.clone(), &rdc);
    let mapset = env.tmp.path().join("work/mapset");
    write(&mapset.join("WIND"), "north: 1\n");

    let lease = format!("interim/{USER}/{}", rdc.resource_id);
    assert!(env.ctx.lock.lock(&lease, Duration::from_secs(60)).await.unwrap());

    let err = interim
        .save_interim_results(1, &mapset, &mapset, None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Sync(_)));
    assert!(!interim.step_dir(1).exists());
    assert_eq!(interim.saved_step(), None);
}

#[tokio::test]
async fn test_always_mode_keeps_newest_step_only() {
    let env = TestEnv::with_interim(InterimMode::Always);
    let chain = json!({
        "version": "1",
        "list": [
            {"id": "A", "module": "r.neighbors",
             "inputs": [{"param": "input", "value": "elevation"}],
             "outputs": [{"param": "output", "value": "a"}]},
            {"id": "B", "module": "r.neighbors",
             "inputs": [{"param": "input", "value": "a"}],
             "outputs": [{"param": "output", "value": "b"}]}
        ]
    });
    let rdc = env.rdc(chain, Entrypoint::Ephemeral);

    let status = run_ephemeral(env.ctx.clone(), rdc.clone()).await;
    assert_eq!(status, ResourceStatus::Finished);

    let point = latest_checkpoint(&env.config.interim, USER, &rdc.resource_id).unwrap();
    assert_eq!(point.step, 2);
    assert!(point.mapset_path.join("cell/a").exists());
    assert!(point.mapset_path.join("cell/b").exists());
    assert!(!point.mapset_path.with_file_name("step1").exists());

    let record = env.ctx.logger.get(USER, &rdc.resource_id, 1).await.unwrap().unwrap();
    assert!(record.process_log.iter().all(|e| e.mapset_size.is_some()));
}

#[tokio::test]
async fn test_off_mode_writes_nothing() {
    let env = TestEnv::new();
    let rdc = env.rdc(three_step_chain(), Entrypoint::Ephemeral);

    let status = run_ephemeral(env.ctx.clone(), rdc.clone()).await;
    assert_eq!(status, ResourceStatus::Finished);
    assert!(latest_checkpoint(&env.config.interim, USER, &rdc.resource_id).is_none());
}

#[tokio::test]
async fn test_on_error_checkpoint_and_resume() {
    let univar_calls = Arc::new(AtomicUsize::new(0));
    let counter = univar_calls.clone();
    let executor = MockExecutor::with_handler(move |request| {
        if request.program == "r.univar" && counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return ExecOutput::failure(1, "ERROR: out of memory");
        }
        writing_outputs(request)
    });
    let env = TestEnv::build(executor, |config| config.interim.mode = InterimMode::OnError);
    let queue = MemoryJobQueue::new();
    let state = EnvironmentHandlerState::new(env.ctx.clone(), Arc::new(queue.clone()));

    let rdc = env.rdc(three_step_chain(), Entrypoint::Ephemeral);
    let resource_id = rdc.resource_id.clone();
    handle_enqueue(
        &state,
        EnqueueRequest {
            entrypoint: Entrypoint::Ephemeral,
            resource: rdc,
            wait_timeout: None,
        },
    )
    .await
    .unwrap();

    let first = next_job(&queue).await;
    assert_eq!(worker::run_job(env.ctx.clone(), first).await, ResourceStatus::Error);

    let point = latest_checkpoint(&env.config.interim, USER, &resource_id).unwrap();
    assert_eq!(point.step, 1);
    assert_eq!(fs::read_to_string(point.mapset_path.join("cell/a")).unwrap(), "r.neighbors a");

    let response = handle_resume(
        &state,
        ResumeRequest {
            user_id: USER.to_string(),
            resource_id: resource_id.clone(),
            request_data: None,
            wait_timeout: None,
        },
    )
    .await
    .unwrap();
    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.iteration, Some(2));
    assert_eq!(response.resume_step, Some(1));

    let second = next_job(&queue).await;
    assert_eq!(second.resource.iteration, 2);
    assert_eq!(second.resource.resume.as_ref().unwrap().step, 1);
    assert_eq!(worker::run_job(env.ctx.clone(), second).await, ResourceStatus::Finished);

    assert_eq!(
        env.executor.programs().await,
        vec!["r.neighbors", "r.univar", "r.univar", "r.neighbors"]
    );
    let latest = handle_get_status(&state, USER, &resource_id, None).await.unwrap().unwrap();
    assert_eq!(latest.iteration, 2);
    assert_eq!(latest.status, ResourceStatus::Finished);
    let ids: Vec<_> = latest.process_log.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["B", "C"]);

    let first_record = env.ctx.logger.get(USER, &resource_id, 1).await.unwrap().unwrap();
    assert_eq!(first_record.status, ResourceStatus::Error);
}

#[tokio::test]
async fn test_resume_rejected_without_checkpoint() {
    let env = TestEnv::with_executor(MockExecutor::failing_on("r.neighbors", 1));
    let queue = MemoryJobQueue::new();
    let state = EnvironmentHandlerState::new(env.ctx.clone(), Arc::new(queue.clone()));
    let rdc = env.rdc(three_step_chain(), Entrypoint::Ephemeral);
    let resource_id = rdc.resource_id.clone();
    handle_enqueue(
        &state,
        EnqueueRequest {
            entrypoint: Entrypoint::Ephemeral,
            resource: rdc,
            wait_timeout: None,
        },
    )
    .await
    .unwrap();
    let job = next_job(&queue).await;
    assert_eq!(worker::run_job(env.ctx.clone(), job).await, ResourceStatus::Error);

    let response = handle_resume(
        &state,
        ResumeRequest {
            user_id: USER.to_string(),
            resource_id,
            request_data: None,
            wait_timeout: None,
        },
    )
    .await
    .unwrap();
    assert!(!response.success);
    assert!(response.error.unwrap().contains("No interim results"));
    assert!(queue.is_empty().await);
}
