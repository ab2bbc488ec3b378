// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-chain compile errors.

use thiserror::Error;

/// A malformed or unacceptable process-chain document.
///
/// Always fatal to the job attempt and reported before any lock is taken or
/// any process spawned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// A required field is missing.
    #[error("Missing field '{field}' in {context}")]
    MissingField {
        /// Field name.
        field: &'static str,
        /// Where it was expected (e.g. `step 'r1'`).
        context: String,
    },

    /// The document has an unexpected shape or value.
    #[error("Invalid process chain: {0}")]
    InvalidDocument(String),

    /// An argument value contains a forbidden character.
    #[error("Character '{character}' is not allowed in value '{value}' of step '{step}'")]
    ForbiddenCharacter {
        /// Step id.
        step: String,
        /// Offending character.
        character: char,
        /// Offending value.
        value: String,
    },

    /// An output carries a `@mapset` suffix.
    #[error("Output '{value}' of step '{step}' must not name a mapset")]
    OutputWithMapset {
        /// Step id.
        step: String,
        /// Offending value.
        value: String,
    },

    /// `stdin` refers to a step that does not appear earlier in the chain.
    #[error("Step '{step}' reads stdin from unknown process '{reference}'")]
    UnknownStdinReference {
        /// Step id.
        step: String,
        /// The reference as written.
        reference: String,
    },

    /// An export block is invalid.
    #[error("Invalid export in step '{step}': {reason}")]
    InvalidExport {
        /// Step id.
        step: String,
        /// What is wrong.
        reason: String,
    },

    /// A webhook did not answer the reachability probe.
    #[error("Webhook '{url}' is not reachable: {reason}")]
    WebhookUnreachable {
        /// Webhook URL.
        url: String,
        /// Probe failure.
        reason: String,
    },

    /// The module or executable is not on the allow-list.
    #[error("Module '{0}' is not allowed")]
    ModuleNotAllowed(String),

    /// The chain compiles to more processes than allowed.
    #[error("Process chain has {count} processes, the limit is {limit}")]
    TooManyProcesses {
        /// Compiled process count.
        count: usize,
        /// Configured limit.
        limit: usize,
    },

    /// An import description could not be resolved.
    #[error("Import failed in step '{step}': {reason}")]
    ImportFailed {
        /// Step id.
        step: String,
        /// Resolver failure.
        reason: String,
    },

    /// A `$file::` placeholder has an empty or invalid id.
    #[error("Invalid file id in '{0}'")]
    InvalidFileId(String),
}

impl ChainError {
    pub(crate) fn missing(field: &'static str, context: impl Into<String>) -> Self {
        Self::MissingField {
            field,
            context: context.into(),
        }
    }
}
