// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gisflow Environment - GRASS GIS job execution
//!
//! This crate runs compiled process chains against GRASS mapsets. It
//! supervises a bounded pool of job processes, runs each job in an isolated
//! temporary database, checkpoints progress, and merges persistent results
//! back into the user's mapsets under a lease-based lock.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                   Operational layer (HTTP, excluded)                   │
//! └───────────────────────────────────────────────────────────────────────┘
//!                                    │ handlers
//!                                    ▼
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                 gisflow-environment (This Crate)                       │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────────┐   │
//! │  │ JobQueue     │──▶│ ProcessQueue │──▶│ JobRunner                │   │
//! │  │ (Redis/mem)  │   │ Manager      │   │ (native process / task)  │   │
//! │  └──────────────┘   └──────────────┘   └──────────────────────────┘   │
//! │                                                     │ worker           │
//! │                                                     ▼                  │
//! │  ┌──────────────────────────────────────────────────────────────────┐ │
//! │  │ Ephemeral / Persistent processing engine                          │ │
//! │  │ compile → lock → link mapsets → run processes → export → merge    │ │
//! │  └──────────────────────────────────────────────────────────────────┘ │
//! └───────────────────────────────────────────────────────────────────────┘
//!           │ status / locks                         │ checkpoints
//!           ▼                                        ▼
//! ┌──────────────────────────┐          ┌───────────────────────────────┐
//! │ KeyValueStore            │          │ {interim_root}/{user}/{res}/  │
//! └──────────────────────────┘          └───────────────────────────────┘
//! ```
//!
//! # Binary
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gisflow-environment` | Run the process queue manager |
//! | `gisflow-environment worker <job-file>` | Run one job (spawned by the native runner) |
//!
//! Cancellation is cooperative and happens between steps: a running external
//! process is never interrupted by a termination request.

#![warn(missing_docs)]

/// Shared dependencies of the processing engines.
pub mod context;

/// Processing engine and the `Processing` entrypoint trait.
pub mod engine;

/// Ephemeral processing.
pub mod ephemeral;

/// Error types.
pub mod error;

/// Process executors.
pub mod executor;

/// Export of chain outputs.
pub mod export;

/// Filesystem helpers.
pub mod fsops;

/// GRASS session environment.
pub mod grass_env;

/// Operational handlers.
pub mod handlers;

/// Interim results (checkpoints).
pub mod interim;

/// Persistent processing.
pub mod persistent;

/// Process queue manager.
pub mod queue_manager;

/// Job runners.
pub mod runner;

/// Webhook notifications.
pub mod webhook;

/// Worker entry point.
pub mod worker;

pub use context::ProcessingContext;
pub use engine::{EngineState, Processing, ProcessingEngine};
pub use ephemeral::EphemeralProcessing;
pub use error::{Error, Result};
pub use interim::InterimResult;
pub use persistent::PersistentProcessing;
pub use queue_manager::{ProcessQueueManager, QueueManagerConfig};
