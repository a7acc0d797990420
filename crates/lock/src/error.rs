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

use crate::types::{LockId, LockLevel, ThreadId};
use thiserror::Error;

/// Lock operation related error types
#[derive(Error, Debug)]
pub enum LockError {
    /// The lock object has been reclaimed; the id must be re-resolved to get
    /// a fresh instance.
    #[error("lock '{lock}' has been garbage collected")]
    GarbageLock { lock: LockId },

    /// A thread holding only a read-class level requested a write-class level
    #[error("{thread} cannot upgrade its read hold on '{lock}' to {requested:?}")]
    UpgradeUnsupported {
        lock: LockId,
        thread: ThreadId,
        requested: LockLevel,
    },

    /// Monitor discipline violated: wait/notify without a write-class hold,
    /// or release of a level not held
    #[error("illegal monitor state on '{lock}' for {thread}: {reason}")]
    MonitorState {
        lock: LockId,
        thread: ThreadId,
        reason: String,
    },

    /// A suspended caller was cooperatively cancelled
    #[error("operation on '{lock}' cancelled for {thread}")]
    Cancelled { lock: LockId, thread: ThreadId },

    /// Network error surfaced by the remote gateway
    #[error("network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl LockError {
    /// Create garbage lock error
    pub fn garbage_lock(lock: &LockId) -> Self {
        Self::GarbageLock { lock: lock.clone() }
    }

    /// Create lock upgrade error
    pub fn upgrade_unsupported(lock: &LockId, thread: ThreadId, requested: LockLevel) -> Self {
        Self::UpgradeUnsupported {
            lock: lock.clone(),
            thread,
            requested,
        }
    }

    /// Create monitor state violation error
    pub fn monitor_state(lock: &LockId, thread: ThreadId, reason: impl Into<String>) -> Self {
        Self::MonitorState {
            lock: lock.clone(),
            thread,
            reason: reason.into(),
        }
    }

    /// Create cancellation error
    pub fn cancelled(lock: &LockId, thread: ThreadId) -> Self {
        Self::Cancelled { lock: lock.clone(), thread }
    }

    /// Create network error
    pub fn network(message: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Network {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// Create internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Create configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether the error reports misuse of the API rather than runtime state
    pub fn is_programming_error(&self) -> bool {
        matches!(self, Self::UpgradeUnsupported { .. } | Self::MonitorState { .. })
    }

    /// Whether retrying the same call can succeed without re-resolving the lock
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Internal { .. })
    }

    /// Whether the lock instance is permanently unusable
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::GarbageLock { .. })
    }
}

/// Lock operation Result type
pub type Result<T> = std::result::Result<T, LockError>;

/// Convert from std::io::Error
impl From<std::io::Error> for LockError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::Internal {
                message: "IO timeout".to_string(),
            },
            _ => Self::network(err.to_string(), err),
        }
    }
}
