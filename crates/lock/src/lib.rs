// Copyright 2024 GridStore Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Client-side half of GridStore's cluster-wide locking service.
//!
//! Application tasks acquire mutually-exclusive or shared named locks that
//! are arbitrated by the remote lock authority shared by the whole cluster.
//! The per-lock state machine tracks re-entrant holds per requesting thread,
//! elides network round trips whenever local knowledge already proves the
//! outcome, caches node-wide greedy grants, answers recalls, and implements
//! distributed wait/notify on top of the asynchronous award protocol.

// Application layer
pub mod manager;

// Core state machine
pub mod lock;

// Consumed interface to the remote authority
pub mod remote;

// Core modules
pub mod config;
pub mod error;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main types for easy access
pub use crate::{
    config::LockManagerConfig,
    error::{LockError, Result},
    lock::ClientLock,
    manager::ClientLockManager,
    remote::{FlushCallback, RemoteLockManager, WaitListener},
    types::{LockContext, LockHolder, LockId, LockLevel, LockStats, ServerLockLevel, ThreadId},
};

/// Current version of the lock crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
