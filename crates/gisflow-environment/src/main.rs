// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gisflow Environment - process queue manager and job worker
//!
//! Without arguments, runs the process queue manager: jobs are read from the
//! Redis submission queue and each one is started as
//! `gisflow-environment worker <job-file>` in its own OS process.

use std::path::PathBuf;
use std::sync::Arc;

use gisflow_core::Config;
use gisflow_core::queue::{JobQueue, RedisJobQueue};
use gisflow_core::store::RedisStore;
use gisflow_environment::ProcessingContext;
use gisflow_environment::executor::SystemExecutor;
use gisflow_environment::queue_manager::{ProcessQueueManager, QueueManagerConfig};
use gisflow_environment::runner::{JobRunner, NativeRunner};
use gisflow_environment::worker;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gisflow_environment=info,gisflow_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Arc::new(Config::from_env()?);

    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let ctx = ProcessingContext::new(config.clone(), store.clone(), Arc::new(SystemExecutor));

    let mut args = std::env::args().skip(1);
    if let Some(command) = args.next() {
        if command != "worker" {
            anyhow::bail!("unknown command '{command}', expected 'worker <job-file>'");
        }
        let job_file = args
            .next()
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("missing job file"))?;
        let status = worker::run_job_file(ctx, &job_file).await?;
        info!(status = %status, "Worker finished");
        return Ok(());
    }

    info!(
        redis_url = %config.redis_url,
        queue = %config.queue_name,
        number_of_workers = config.number_of_workers,
        "Starting gisflow Environment"
    );

    let queue: Arc<dyn JobQueue> = Arc::new(RedisJobQueue::new(store.connection(), &config.queue_name));
    let runner = Arc::new(NativeRunner::current_exe(config.grass_tmp_database.join("jobs"))?);
    info!(runner_type = runner.runner_type(), "Runner initialized");

    let manager = Arc::new(ProcessQueueManager::new(
        queue.clone(),
        runner,
        ctx.logger.clone(),
        QueueManagerConfig::from_config(&config),
    ));
    let mut manager_task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run().await })
    };

    info!("Process queue manager ready");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received");
            // Running and waiting jobs are terminated before the manager exits
            manager.shutdown_handle().notify_one();
            manager_task.await?;
        }
        result = &mut manager_task => {
            result?;
            info!("Process queue manager stopped by a stop message");
        }
    }

    info!("gisflow Environment shut down");

    Ok(())
}
