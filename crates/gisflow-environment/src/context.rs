// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared dependencies of the processing engines.

use std::path::Path;
use std::sync::Arc;

use gisflow_core::chain::{ChainSettings, DirectUrlResolver, ImportResolver};
use gisflow_core::{Config, KeyValueStore, MapsetLock, ProcessChainConverter, ResourceLogger};

use crate::executor::ProcessExecutor;

/// Everything a job needs besides its own data.
///
/// Built once per worker process and passed into every engine; nothing is
/// read from ambient global state.
#[derive(Clone)]
pub struct ProcessingContext {
    /// Immutable configuration.
    pub config: Arc<Config>,
    /// Shared key-value store.
    pub store: Arc<dyn KeyValueStore>,
    /// Status records and termination flags.
    pub logger: ResourceLogger,
    /// Mapset locks.
    pub lock: MapsetLock,
    /// Module/executable runner.
    pub executor: Arc<dyn ProcessExecutor>,
    /// Import source resolver.
    pub resolver: Arc<dyn ImportResolver>,
    /// HTTP client for webhooks.
    pub http: reqwest::Client,
}

impl ProcessingContext {
    /// Create a context.
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn KeyValueStore>,
        executor: Arc<dyn ProcessExecutor>,
    ) -> Self {
        Self {
            logger: ResourceLogger::new(store.clone(), config.resource_expire_time),
            lock: MapsetLock::new(store.clone()),
            config,
            store,
            executor,
            resolver: Arc::new(DirectUrlResolver),
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom import resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn ImportResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Use a custom HTTP client.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Chain compiler writing `$file::` paths into `temp_file_dir`.
    pub fn chain_converter(&self, temp_file_dir: &Path) -> ProcessChainConverter {
        ProcessChainConverter::new(ChainSettings::from_config(&self.config), temp_file_dir)
            .with_resolver(self.resolver.clone())
            .with_http_client(self.http.clone())
    }
}
