// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ephemeral processing tests with a mock executor.

mod common;

use common::{TestEnv, USER};
use gisflow_core::ResourceStatus;
use gisflow_core::resource::Entrypoint;
use gisflow_environment::executor::{ExecOutput, MockExecutor};
use gisflow_environment::handlers::run_ephemeral;
use serde_json::json;

#[tokio::test]
async fn test_single_module_finishes() {
    let env = TestEnv::new();
    let rdc = env.rdc(json!({"1": {"module": "g.region", "flags": "p"}}), Entrypoint::Ephemeral);

    let status = run_ephemeral(env.ctx.clone(), rdc.clone()).await;
    assert_eq!(status, ResourceStatus::Finished);

    let record = env.ctx.logger.get(USER, &rdc.resource_id, 1).await.unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::Finished);
    assert_eq!(record.process_log.len(), 1);
    assert_eq!(record.process_log[0].executable, "g.region");
    assert_eq!(record.process_log[0].parameter, vec!["-p"]);
    assert_eq!(record.progress.step, 1);
    assert_eq!(record.progress.num_of_steps, 1);
    assert!(env.leftover_jobs().is_empty());
}

#[tokio::test]
async fn test_failing_step_short_circuits_chain() {
    let env = TestEnv::with_executor(MockExecutor::failing_on("r.slope.aspect", 1));
    let chain = json!({
        "version": "1",
        "list": [
            {"id": "A", "module": "g.region", "flags": "p"},
            {"id": "B", "module": "r.slope.aspect",
             "inputs": [{"param": "elevation", "value": "elevation"}],
             "outputs": [{"param": "slope", "value": "slope"}]},
            {"id": "C", "module": "r.univar",
             "inputs": [{"param": "map", "value": "slope"}]}
        ]
    });
    let rdc = env.rdc(chain, Entrypoint::Ephemeral);

    let status = run_ephemeral(env.ctx.clone(), rdc.clone()).await;
    assert_eq!(status, ResourceStatus::Error);
    assert_eq!(env.executor.programs().await, vec!["g.region", "r.slope.aspect"]);

    let record = env.ctx.logger.get(USER, &rdc.resource_id, 1).await.unwrap().unwrap();
    let ids: Vec<_> = record.process_log.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["A", "B"]);
    assert_eq!(record.process_log[1].return_code, 1);
    assert_eq!(record.exception.unwrap().kind, "ExternalProcessFailure");
    assert!(env.leftover_jobs().is_empty());
}

#[tokio::test]
async fn test_compile_error_runs_nothing() {
    let env = TestEnv::new();
    let rdc = env.rdc(json!({"1": {"module": "g.region", "flags": "p&"}}), Entrypoint::Ephemeral);

    let status = run_ephemeral(env.ctx.clone(), rdc.clone()).await;
    assert_eq!(status, ResourceStatus::Error);
    assert!(env.executor.calls().await.is_empty());

    let record = env.ctx.logger.get(USER, &rdc.resource_id, 1).await.unwrap().unwrap();
    assert_eq!(record.exception.unwrap().kind, "CompileError");
}

#[tokio::test]
async fn test_missing_required_mapset() {
    let env = TestEnv::new();
    let chain = json!({"1": {"module": "r.info", "inputs": {"map": "elevation@nowhere"}}});
    let rdc = env.rdc(chain, Entrypoint::Ephemeral);

    let status = run_ephemeral(env.ctx.clone(), rdc.clone()).await;
    assert_eq!(status, ResourceStatus::Error);
    assert!(env.executor.calls().await.is_empty());

    let record = env.ctx.logger.get(USER, &rdc.resource_id, 1).await.unwrap().unwrap();
    assert_eq!(record.exception.unwrap().kind, "MapsetNotFound");
}

#[tokio::test]
async fn test_global_mapset_is_linked() {
    let env = TestEnv::new();
    let chain = json!({"1": {"module": "r.info", "inputs": {"map": "lsat7_2002_10@landsat"}, "flags": "g"}});
    let rdc = env.rdc(chain, Entrypoint::Ephemeral);

    let status = run_ephemeral(env.ctx.clone(), rdc).await;
    assert_eq!(status, ResourceStatus::Finished);
    let calls = env.executor.calls().await;
    assert_eq!(calls[0].args, vec!["map=lsat7_2002_10@landsat", "-g"]);
}

#[tokio::test]
async fn test_stdin_wiring_and_stdout_parsing() {
    let executor = MockExecutor::with_handler(|request| match request.program.as_str() {
        "/bin/echo" => ExecOutput::success("a=1\nb=2.5\nname=dem\n"),
        _ => ExecOutput::success(request.stdin.clone().unwrap_or_default()),
    });
    let env = TestEnv::with_executor(executor);
    let chain = json!({
        "version": "1",
        "list": [
            {"id": "info", "exe": "/bin/echo", "params": ["ignored"],
             "stdout": {"format": "kv", "delimiter": "="}},
            {"id": "copy", "exe": "/bin/cat", "stdin": "info::stdout"}
        ]
    });
    let rdc = env.rdc(chain, Entrypoint::Ephemeral);

    let status = run_ephemeral(env.ctx.clone(), rdc.clone()).await;
    assert_eq!(status, ResourceStatus::Finished);

    let calls = env.executor.calls().await;
    assert_eq!(calls[1].stdin.as_deref(), Some("a=1\nb=2.5\nname=dem\n"));

    let record = env.ctx.logger.get(USER, &rdc.resource_id, 1).await.unwrap().unwrap();
    assert_eq!(
        record.process_results["info"],
        json!({"a": 1, "b": 2.5, "name": "dem"})
    );
}

#[tokio::test]
async fn test_termination_requested_before_start() {
    let env = TestEnv::new();
    let rdc = env.rdc(json!({"1": {"module": "g.region", "flags": "p"}}), Entrypoint::Ephemeral);
    env.ctx
        .logger
        .commit_termination(USER, &rdc.resource_id, 1)
        .await
        .unwrap();

    let status = run_ephemeral(env.ctx.clone(), rdc).await;
    assert_eq!(status, ResourceStatus::Terminated);
    assert!(env.executor.calls().await.is_empty());
    assert!(env.leftover_jobs().is_empty());
}

#[tokio::test]
async fn test_file_export_lands_in_download_cache() {
    let executor = MockExecutor::with_handler(|request| {
        for arg in &request.args {
            if let Some(path) = arg.strip_prefix("output=") {
                common::write(std::path::Path::new(path), "1 2 3\n");
            }
        }
        ExecOutput::default()
    });
    let env = TestEnv::with_executor(executor);
    let chain = json!({
        "1": {
            "module": "r.out.ascii",
            "inputs": {"input": "elevation@PERMANENT"},
            "outputs": {"output": {
                "name": "$file::out1",
                "export": {"type": "file", "format": "TXT"}
            }}
        }
    });
    let rdc = env.rdc(chain, Entrypoint::Ephemeral);

    let status = run_ephemeral(env.ctx.clone(), rdc.clone()).await;
    assert_eq!(status, ResourceStatus::Finished);

    let record = env.ctx.logger.get(USER, &rdc.resource_id, 1).await.unwrap().unwrap();
    assert_eq!(record.urls.resources.len(), 1);
    let exported = std::path::PathBuf::from(&record.urls.resources[0]);
    assert!(exported.starts_with(env.config.download_cache.join(USER).join(&rdc.resource_id)));
    assert!(exported.to_string_lossy().ends_with("file_out1.txt"));
    assert_eq!(std::fs::read_to_string(exported).unwrap(), "1 2 3\n");
}

#[tokio::test]
async fn test_webhooks_receive_updates_and_final_record() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/update"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/finished"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let chain = json!({
        "version": "1",
        "list": [
            {"id": "A", "module": "g.region", "flags": "p"},
            {"id": "B", "module": "g.region", "flags": "g"}
        ],
        "webhooks": {
            "update": format!("{}/update", server.uri()),
            "finished": format!("{}/finished", server.uri())
        }
    });
    let rdc = env.rdc(chain, Entrypoint::Ephemeral);

    let status = run_ephemeral(env.ctx.clone(), rdc).await;
    assert_eq!(status, ResourceStatus::Finished);

    let requests = server.received_requests().await.unwrap();
    let finished = requests
        .iter()
        .find(|r| r.method.as_str() == "POST" && r.url.path() == "/finished")
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&finished.body).unwrap();
    assert_eq!(body["status"], "finished");
}
