// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gisflow Core - process chains, mapset locks and resource status
//!
//! This crate holds everything the processing environment shares across
//! worker processes: the process-chain compiler, the lease-based mapset lock,
//! the resource status store and the job submission queue. All cross-process
//! state lives in a key-value service (Redis in production, an in-memory
//! store in tests).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐      ┌───────────────────────────────────┐
//! │  Operational layer (API) │─────▶│  JobQueue (enqueue / STOP)        │
//! └──────────────────────────┘      └───────────────────────────────────┘
//!              │                                     │
//!              │ compile()                           ▼
//!              ▼                     ┌───────────────────────────────────┐
//! ┌──────────────────────────┐      │  gisflow-environment              │
//! │  ProcessChainConverter   │─────▶│  queue manager → worker processes │
//! │  (this crate)            │      └───────────────────────────────────┘
//! └──────────────────────────┘          │ lock/extend/unlock   │ status
//!                                       ▼                      ▼
//!                              ┌──────────────────────────────────────┐
//!                              │  KeyValueStore (Redis / in-memory)   │
//!                              └──────────────────────────────────────┘
//! ```
//!
//! # Resource Status State Machine
//!
//! ```text
//!   ┌──────────┐     ┌─────────┐     ┌──────────────────────────────────┐
//!   │ ACCEPTED │────▶│ RUNNING │────▶│ FINISHED | ERROR | TERMINATED |  │
//!   └──────────┘     └─────────┘     │ TIMEOUT                          │
//!        │                           └──────────────────────────────────┘
//!        │ queue-wait timeout / shutdown          ▲
//!        └────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`chain`]: process-chain document model and compiler
//! - [`config`]: configuration from environment variables
//! - [`error`]: core error types
//! - [`lock`]: lease-based mapset lock
//! - [`process`]: one external command invocation
//! - [`queue`]: job submission queue
//! - [`resource`]: resource data container and status records
//! - [`status`]: resource status logger
//! - [`store`]: key-value store backends

#![warn(missing_docs)]

/// Process-chain document model and compiler.
pub mod chain;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for core operations.
pub mod error;

/// Lease-based distributed mapset lock.
pub mod lock;

/// External command invocation value object.
pub mod process;

/// Job submission queue.
pub mod queue;

/// Resource data container and status records.
pub mod resource;

/// Resource status logger (status records and termination flags).
pub mod status;

/// Key-value store backends.
pub mod store;

pub use chain::{ChainError, CompiledChain, ProcessChainConverter};
pub use config::Config;
pub use error::CoreError;
pub use lock::MapsetLock;
pub use process::{Process, ProcessKind};
pub use resource::{ResourceDataContainer, ResourceStatus, ResourceStatusRecord};
pub use status::ResourceLogger;
pub use store::KeyValueStore;
