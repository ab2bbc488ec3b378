// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handler tests: enqueue, termination, status, resume and unlock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{GROUP, LOCATION, TestEnv, USER, write};
use gisflow_core::config::InterimMode;
use gisflow_core::lock::mapset_lock_id;
use gisflow_core::queue::{JobQueue, MemoryJobQueue, QueueMessage, QueuedJob};
use gisflow_core::resource::Entrypoint;
use gisflow_core::{ResourceDataContainer, ResourceStatus, ResourceStatusRecord};
use gisflow_environment::handlers::{
    EnqueueRequest, EnvironmentHandlerState, ResumeRequest, TerminationRequest, checkpoint, handle_compile,
    handle_enqueue, handle_get_status, handle_request_termination, handle_resume, handle_unlock_mapset,
    resume_from_checkpoint,
};
use gisflow_environment::{Error, worker};
use serde_json::json;

fn state(env: &TestEnv, queue: &MemoryJobQueue) -> EnvironmentHandlerState {
    EnvironmentHandlerState::new(env.ctx.clone(), Arc::new(queue.clone()))
        .with_stale_check_delay(Duration::from_millis(150))
}

async fn enqueue(state: &EnvironmentHandlerState, rdc: ResourceDataContainer) -> String {
    let resource_id = rdc.resource_id.clone();
    handle_enqueue(
        state,
        EnqueueRequest {
            entrypoint: Entrypoint::Ephemeral,
            resource: rdc,
            wait_timeout: Some(Duration::from_secs(30)),
        },
    )
    .await
    .unwrap();
    resource_id
}

async fn next_job(queue: &MemoryJobQueue) -> QueuedJob {
    match queue.pop(Duration::from_millis(100)).await.unwrap() {
        Some(QueueMessage::Job(job)) => job,
        other => panic!("expected a job, got {other:?}"),
    }
}

fn resume_request(resource_id: &str) -> ResumeRequest {
    ResumeRequest {
        user_id: USER.to_string(),
        resource_id: resource_id.to_string(),
        request_data: None,
        wait_timeout: None,
    }
}

#[tokio::test]
async fn test_enqueue_writes_accepted_record() {
    let env = TestEnv::new();
    let queue = MemoryJobQueue::new();
    let state = state(&env, &queue);

    let rdc = env.rdc(json!({"1": {"module": "g.region", "flags": "p"}}), Entrypoint::Ephemeral);
    let response = handle_enqueue(
        &state,
        EnqueueRequest {
            entrypoint: Entrypoint::Ephemeral,
            resource: rdc.clone(),
            wait_timeout: Some(Duration::from_secs(30)),
        },
    )
    .await
    .unwrap();
    assert_eq!(response.iteration, 1);
    assert_eq!(response.record.status, ResourceStatus::Accepted);

    let stored = handle_get_status(&state, USER, &rdc.resource_id, None).await.unwrap().unwrap();
    assert_eq!(stored.status, ResourceStatus::Accepted);

    let job = next_job(&queue).await;
    assert_eq!(job.resource, rdc);
    assert_eq!(job.wait_timeout(), Duration::from_secs(30));
}

#[tokio::test]
async fn test_termination_flag_stops_job_at_next_step() {
    let env = TestEnv::new();
    let queue = MemoryJobQueue::new();
    let state = state(&env, &queue);
    let id = enqueue(&state, env.rdc(json!({"1": {"module": "g.region"}}), Entrypoint::Ephemeral)).await;

    let response = handle_request_termination(
        &state,
        TerminationRequest {
            user_id: USER.to_string(),
            resource_id: id.clone(),
        },
    )
    .await
    .unwrap();
    assert!(response.success);
    assert_eq!(response.iteration, Some(1));
    assert!(env.ctx.logger.get_termination(USER, &id, 1).await.unwrap());

    let job = next_job(&queue).await;
    assert_eq!(worker::run_job(env.ctx.clone(), job).await, ResourceStatus::Terminated);
    assert!(env.executor.calls().await.is_empty());

    let again = handle_request_termination(
        &state,
        TerminationRequest {
            user_id: USER.to_string(),
            resource_id: id,
        },
    )
    .await
    .unwrap();
    assert!(!again.success);
    assert!(again.error.unwrap().contains("already finished"));
}

#[tokio::test]
async fn test_termination_of_unknown_resource() {
    let env = TestEnv::new();
    let queue = MemoryJobQueue::new();
    let response = handle_request_termination(
        &state(&env, &queue),
        TerminationRequest {
            user_id: USER.to_string(),
            resource_id: "resource_id-missing".to_string(),
        },
    )
    .await
    .unwrap();
    assert!(!response.success);
    assert_eq!(response.iteration, None);
}

#[tokio::test]
async fn test_resume_of_stale_running_job() {
    let env = TestEnv::with_interim(InterimMode::Always);
    let queue = MemoryJobQueue::new();
    let state = state(&env, &queue);
    let rdc = env.rdc(json!({"1": {"module": "g.region"}}), Entrypoint::Ephemeral);
    let id = enqueue(&state, rdc.clone()).await;
    next_job(&queue).await;

    let mapset = env.tmp.path().join("work/mapset");
    let files = env.tmp.path().join("work/files");
    write(&mapset.join("WIND"), "north: 1\n");
    write(&files.join("out.txt"), "x");
    checkpoint(&env.ctx, &rdc, 1, &mapset, &files).await.unwrap();
    let (saved_mapset, saved_files) = resume_from_checkpoint(&env.ctx, USER, &id).unwrap();
    assert!(saved_mapset.join("WIND").is_file());
    assert!(saved_files.join("out.txt").is_file());

    // A worker that died mid-run leaves a running record behind
    let running = ResourceStatusRecord::accepted(&rdc).transition(ResourceStatus::Running, "Running process 1 of 2");
    env.ctx.logger.commit(&running).await.unwrap();

    let response = handle_resume(&state, resume_request(&id)).await.unwrap();
    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.iteration, Some(2));
    assert_eq!(response.resume_step, Some(1));

    let first = env.ctx.logger.get(USER, &id, 1).await.unwrap().unwrap();
    assert_eq!(first.status, ResourceStatus::Error);
    let latest = handle_get_status(&state, USER, &id, None).await.unwrap().unwrap();
    assert_eq!(latest.iteration, 2);
    assert_eq!(latest.status, ResourceStatus::Accepted);
    assert_eq!(next_job(&queue).await.resource.resume.unwrap().step, 1);
}

#[tokio::test]
async fn test_resume_rejected_while_job_reports_progress() {
    let env = TestEnv::with_interim(InterimMode::Always);
    let queue = MemoryJobQueue::new();
    let state = state(&env, &queue);
    let rdc = env.rdc(json!({"1": {"module": "g.region"}}), Entrypoint::Ephemeral);
    let id = enqueue(&state, rdc.clone()).await;
    next_job(&queue).await;

    let running = ResourceStatusRecord::accepted(&rdc).transition(ResourceStatus::Running, "Running process 1 of 2");
    env.ctx.logger.commit(&running).await.unwrap();

    let logger = env.ctx.logger.clone();
    let progress = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let next = running.transition(ResourceStatus::Running, "Running process 2 of 2");
        logger.commit(&next).await.unwrap();
    });

    let response = handle_resume(&state, resume_request(&id)).await.unwrap();
    progress.await.unwrap();
    assert!(!response.success);
    assert!(response.error.unwrap().contains("still running"));
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn test_resume_rejected_for_finished_job() {
    let env = TestEnv::with_interim(InterimMode::Always);
    let queue = MemoryJobQueue::new();
    let state = state(&env, &queue);
    let id = enqueue(&state, env.rdc(json!({"1": {"module": "g.region"}}), Entrypoint::Ephemeral)).await;
    let job = next_job(&queue).await;
    assert_eq!(worker::run_job(env.ctx.clone(), job).await, ResourceStatus::Finished);

    let response = handle_resume(&state, resume_request(&id)).await.unwrap();
    assert!(!response.success);
    assert!(response.error.unwrap().contains("finished"));
}

#[tokio::test]
async fn test_checkpoints_replace_the_previous_step() {
    let env = TestEnv::with_interim(InterimMode::Always);
    let rdc = env.rdc(json!({"1": {"module": "g.region"}}), Entrypoint::Ephemeral);
    let mapset = env.tmp.path().join("work/mapset");
    let files = env.tmp.path().join("work/files");
    write(&mapset.join("WIND"), "north: 1\n");
    write(&files.join("out.txt"), "x");

    checkpoint(&env.ctx, &rdc, 1, &mapset, &files).await.unwrap();
    let (step1, _) = resume_from_checkpoint(&env.ctx, USER, &rdc.resource_id).unwrap();
    let inode = std::os::unix::fs::MetadataExt::ino(&std::fs::metadata(&step1).unwrap());

    checkpoint(&env.ctx, &rdc, 2, &mapset, &files).await.unwrap();
    let (step2, tmpdir2) = resume_from_checkpoint(&env.ctx, USER, &rdc.resource_id).unwrap();
    assert!(step2.ends_with("step2"));
    assert!(tmpdir2.join("out.txt").is_file());
    assert!(!step1.exists());
    // Unchanged content is renamed forward, not copied
    assert_eq!(std::os::unix::fs::MetadataExt::ino(&std::fs::metadata(&step2).unwrap()), inode);

    write(&mapset.join("cell/dem"), "changed");
    checkpoint(&env.ctx, &rdc, 3, &mapset, &files).await.unwrap();
    let (step3, _) = resume_from_checkpoint(&env.ctx, USER, &rdc.resource_id).unwrap();
    assert!(step3.join("cell/dem").is_file());
    assert!(!step2.exists());
    assert!(!tmpdir2.exists());
}

#[tokio::test]
async fn test_checkpoint_requires_interim_results() {
    let env = TestEnv::new();
    let rdc = env.rdc(json!({}), Entrypoint::Ephemeral);
    let dir = env.tmp.path().join("work");
    write(&dir.join("WIND"), "north: 1\n");

    let err = checkpoint(&env.ctx, &rdc, 1, &dir, &dir).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
    assert!(resume_from_checkpoint(&env.ctx, USER, &rdc.resource_id).is_none());
}

#[tokio::test]
async fn test_unlock_mapset() {
    let env = TestEnv::new();
    let queue = MemoryJobQueue::new();
    let state = state(&env, &queue);
    let id = mapset_lock_id(GROUP, LOCATION, "user_ms");
    assert!(env.ctx.lock.lock(&id, Duration::from_secs(60)).await.unwrap());

    assert!(handle_unlock_mapset(&state, GROUP, LOCATION, "user_ms").await.unwrap());
    assert!(!env.ctx.lock.get(&id).await.unwrap());
    assert!(!handle_unlock_mapset(&state, GROUP, LOCATION, "user_ms").await.unwrap());
}

#[tokio::test]
async fn test_compile_reports_processes() {
    let env = TestEnv::new();
    let queue = MemoryJobQueue::new();
    let chain = json!({
        "version": "1",
        "list": [
            {"id": "info", "module": "r.info", "inputs": [{"param": "map", "value": "elevation@PERMANENT"}]}
        ]
    });

    let compiled = handle_compile(&state(&env, &queue), &chain).await.unwrap();
    assert_eq!(compiled.processes.len(), 1);
    assert_eq!(compiled.processes[0].name, "r.info");
    assert!(compiled.required_mapsets.contains("PERMANENT"));
}
