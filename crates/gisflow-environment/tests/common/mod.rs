// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures: an on-disk GRASS database tree, an in-memory store and
//! a mock executor that writes module outputs into the current mapset.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gisflow_core::config::InterimMode;
use gisflow_core::resource::Entrypoint;
use gisflow_core::store::MemoryStore;
use gisflow_core::{Config, ResourceDataContainer};
use gisflow_environment::ProcessingContext;
use gisflow_environment::executor::{ExecOutput, ExecRequest, MockExecutor};
use gisflow_environment::grass_env::GrassSession;
use serde_json::Value;
use tempfile::TempDir;

pub const USER: &str = "user1";
pub const GROUP: &str = "group1";
pub const LOCATION: &str = "nc_spm_08";

pub fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Mock handler: every `output=<name>` argument becomes `cell/<name>` in
/// the session's current mapset.
pub fn writing_outputs(request: &ExecRequest) -> ExecOutput {
    if let Ok(mapset) = GrassSession::mapset_path_from_env(&request.env) {
        for arg in &request.args {
            if let Some(name) = arg.strip_prefix("output=") {
                write(&mapset.join("cell").join(name), &format!("{} {}", request.program, name));
            }
        }
    }
    ExecOutput::success(format!("{} done\n", request.program))
}

pub struct TestEnv {
    pub tmp: TempDir,
    pub config: Arc<Config>,
    pub store: Arc<MemoryStore>,
    pub executor: MockExecutor,
    pub ctx: ProcessingContext,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::build(MockExecutor::with_handler(writing_outputs), |_| {})
    }

    pub fn with_executor(executor: MockExecutor) -> Self {
        Self::build(executor, |_| {})
    }

    pub fn with_interim(mode: InterimMode) -> Self {
        Self::build(MockExecutor::with_handler(writing_outputs), |config| {
            config.interim.mode = mode;
        })
    }

    pub fn build(executor: MockExecutor, configure: impl FnOnce(&mut Config)) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::rooted_at(tmp.path());
        configure(&mut config);

        let global = config.grass_database.join(LOCATION);
        write(&global.join("PERMANENT/DEFAULT_WIND"), "north: 10\nsouth: 0\n");
        write(&global.join("PERMANENT/PROJ_INFO"), "name: Lambert\n");
        write(&global.join("landsat/cell/lsat7_2002_10"), "band");

        let user = config.grass_user_database.join(GROUP).join(LOCATION);
        write(&user.join("PERMANENT/DEFAULT_WIND"), "north: 10\nsouth: 0\n");
        write(&user.join("PERMANENT/PROJ_INFO"), "name: Lambert\n");
        fs::create_dir_all(&config.grass_tmp_database).unwrap();

        let config = Arc::new(config);
        let store = Arc::new(MemoryStore::new());
        let ctx = ProcessingContext::new(config.clone(), store.clone(), Arc::new(executor.clone()));
        Self {
            tmp,
            config,
            store,
            executor,
            ctx,
        }
    }

    pub fn user_location(&self) -> PathBuf {
        self.config.grass_user_database.join(GROUP).join(LOCATION)
    }

    /// Create a mapset in the user database with a region and one raster.
    pub fn create_user_mapset(&self, name: &str, raster: &str) -> PathBuf {
        let mapset = self.user_location().join(name);
        write(&mapset.join("WIND"), "north: 5\nsouth: 0\n");
        write(&mapset.join("cell").join(raster), "existing");
        mapset
    }

    pub fn rdc(&self, chain: Value, entrypoint: Entrypoint) -> ResourceDataContainer {
        ResourceDataContainer::new(USER, GROUP, LOCATION, chain, entrypoint)
    }

    /// Entries left in the temporary database (job directories).
    pub fn leftover_jobs(&self) -> Vec<String> {
        fs::read_dir(&self.config.grass_tmp_database)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }
}
