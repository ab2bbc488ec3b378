// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner module - job execution backends.

pub mod mock;
pub mod native;
pub mod task;
mod traits;

pub use mock::MockJobRunner;
pub use native::NativeRunner;
pub use task::TaskRunner;
pub use traits::*;
