// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistent processing: run a chain and keep the results in a user mapset.
//!
//! The target mapset is locked for the whole job. Work happens in a
//! temporary mapset inside the job's own database:
//!
//! - target missing: the temporary mapset carries the target's name and is
//!   moved into the user database at the end
//! - target present: a uniquely named temporary mapset (locked too) starts
//!   from the target's region, the target is linked read-only, and on
//!   success the new data directories are merged into the target
//!
//! On failure the target is never touched.

use std::path::PathBuf;

use async_trait::async_trait;
use gisflow_core::ResourceDataContainer;
use gisflow_core::lock::mapset_lock_id;
use tracing::{info, warn};

use crate::context::ProcessingContext;
use crate::engine::{COPY_LOCK_TTL, Processing, ProcessingEngine};
use crate::error::{Error, Result};
use crate::fsops::{self, GISLOCK};

/// Mapset element directories merged into an existing target.
pub const MERGE_ELEMENTS: [&str; 11] = [
    "cell", "misc", "fcell", "cats", "cellhd", "cell_misc", "colr", "colr2", "hist", "vector",
    "group",
];

/// Persistent processing job.
pub struct PersistentProcessing {
    engine: ProcessingEngine,
    merge_copy: Option<PathBuf>,
}

impl PersistentProcessing {
    /// Job for `rdc`; `rdc.mapset_name` is the target mapset.
    pub fn new(ctx: ProcessingContext, rdc: ResourceDataContainer) -> Self {
        Self {
            engine: ProcessingEngine::new(ctx, rdc),
            merge_copy: None,
        }
    }

    fn target(&self) -> Result<String> {
        self.engine
            .rdc()
            .mapset_name
            .clone()
            .ok_or_else(|| Error::InvalidRequest("persistent processing needs a target mapset".into()))
    }

    fn check_target_location(&self, target: &str) -> Result<()> {
        let rdc = self.engine.rdc();
        if self.engine.global_location_dir().join(target).is_dir() {
            return Err(Error::ReadOnlyMapset {
                location: rdc.location_name.clone(),
                mapset: target.to_string(),
            });
        }
        if !self.engine.user_location_dir().is_dir() {
            return Err(Error::LocationNotFound(rdc.location_name.clone()));
        }
        Ok(())
    }

    async fn copy_back(&mut self, temp_name: &str, target: &str, target_exists: bool) -> Result<()> {
        let source = self
            .engine
            .temp_mapset_path()
            .ok_or_else(|| Error::Other("temporary mapset was not created".into()))?;
        let user_loc = self.engine.user_location_dir();
        let target_path = user_loc.join(target);

        if !target_exists {
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                let _ = std::fs::remove_file(source.join(GISLOCK));
                fsops::move_dir(&source, &target_path)
            })
            .await
            .map_err(|e| Error::Other(e.to_string()))??;
            info!(mapset = %target, "New mapset moved into the user database");
            return Ok(());
        }

        let staging = user_loc.join(temp_name);
        self.merge_copy = Some(staging.clone());
        tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
            fsops::copy_dir(&source, &staging, &[GISLOCK])?;
            let mut merged = 0;
            for element in MERGE_ELEMENTS {
                let dir = staging.join(element);
                if dir.is_dir() {
                    merged += fsops::merge_dir(&dir, &target_path.join(element))?;
                }
            }
            fsops::remove_dir_if_exists(&staging)?;
            Ok(merged)
        })
        .await
        .map_err(|e| Error::Other(e.to_string()))??;
        self.merge_copy = None;
        info!(mapset = %target, "Results merged into the existing mapset");
        Ok(())
    }
}

#[async_trait]
impl Processing for PersistentProcessing {
    fn engine(&mut self) -> &mut ProcessingEngine {
        &mut self.engine
    }

    async fn execute(&mut self) -> Result<()> {
        let target = self.target()?;
        let mut chain = self.engine.compile().await?;
        self.check_target_location(&target)?;

        let rdc = self.engine.rdc().clone();
        let user_loc = self.engine.user_location_dir();
        let ttl = rdc.total_time_limit();
        self.engine
            .acquire_lock(mapset_lock_id(&rdc.user_group, &rdc.location_name, &target), ttl)
            .await?;
        // only decided under the target lock
        let target_exists = user_loc.join(&target).is_dir();

        let temp_name = if target_exists {
            let name = format!("{target}_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
            self.engine
                .acquire_lock(mapset_lock_id(&rdc.user_group, &rdc.location_name, &name), ttl)
                .await?;
            name
        } else {
            target.clone()
        };

        let mut required = chain.required_mapsets.clone();
        if target_exists {
            required.insert(target.clone());
        }
        self.engine.link_mapsets(&required, Some(&temp_name))?;

        let region = if target_exists {
            user_loc.join(&target).join("WIND")
        } else {
            self.engine.temp_location_dir().join("PERMANENT").join("DEFAULT_WIND")
        };
        self.engine.create_temp_mapset(&temp_name, Some(region)).await?;

        self.engine.execute_process_list(&mut chain).await?;
        self.engine.export_results(&chain.exports).await?;

        self.engine.extend_locks(COPY_LOCK_TTL).await?;
        self.copy_back(&temp_name, &target, target_exists).await
    }

    async fn final_cleanup(&mut self) {
        if let Some(staging) = self.merge_copy.take() {
            let result = tokio::task::spawn_blocking(move || fsops::remove_dir_if_exists(&staging)).await;
            if !matches!(result, Ok(Ok(()))) {
                warn!("Failed to remove merge staging mapset");
            }
        }
        self.engine.final_cleanup().await;
    }
}
