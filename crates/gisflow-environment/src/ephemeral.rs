// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ephemeral processing: run a chain in a throwaway mapset.
//!
//! The location's PERMANENT and every referenced mapset are linked read-only
//! into a temporary database; results vanish with the job directory except
//! for exports.

use async_trait::async_trait;
use gisflow_core::ResourceDataContainer;

use crate::context::ProcessingContext;
use crate::engine::{Processing, ProcessingEngine};
use crate::error::Result;

/// Ephemeral processing job.
pub struct EphemeralProcessing {
    engine: ProcessingEngine,
}

impl EphemeralProcessing {
    /// Job for `rdc`.
    pub fn new(ctx: ProcessingContext, rdc: ResourceDataContainer) -> Self {
        Self {
            engine: ProcessingEngine::new(ctx, rdc),
        }
    }
}

#[async_trait]
impl Processing for EphemeralProcessing {
    fn engine(&mut self) -> &mut ProcessingEngine {
        &mut self.engine
    }

    async fn execute(&mut self) -> Result<()> {
        let engine = &mut self.engine;
        let mut chain = engine.compile().await?;

        let mut required = chain.required_mapsets.clone();
        if let Some(mapset) = &engine.rdc().mapset_name {
            required.insert(mapset.clone());
        }
        engine.link_mapsets(&required, None)?;

        let name = format!("tmp_mapset_{}", uuid::Uuid::new_v4().simple());
        let region = engine.temp_location_dir().join("PERMANENT").join("DEFAULT_WIND");
        engine.create_temp_mapset(&name, Some(region)).await?;

        engine.execute_process_list(&mut chain).await?;
        engine.export_results(&chain.exports).await
    }
}
