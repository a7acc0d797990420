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

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster-wide name identifying one lockable resource.
///
/// Lock ids are opaque to this subsystem: equality and ordering are by value
/// and carry no routing information.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockId(String);

impl LockId {
    /// Create a lock id from a cluster-wide name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LockId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for LockId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Identity of one local requesting thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Create a thread id from its raw value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread-{}", self.0)
    }
}

/// Identity a grant is made to: one local thread, or the whole node.
///
/// `Node` is the identity greedy grants are awarded to. It is never a valid
/// requester for the ordinary acquisition operations, which is why it is a
/// separate variant rather than a reserved [`ThreadId`] value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockHolder {
    /// A specific local requesting thread
    Thread(ThreadId),
    /// The whole node, on behalf of any local thread
    Node,
}

impl LockHolder {
    /// The thread behind this holder, if it is not the node-wide identity
    pub fn thread(&self) -> Option<ThreadId> {
        match self {
            Self::Thread(thread) => Some(*thread),
            Self::Node => None,
        }
    }

    /// Whether this is the node-wide identity
    pub fn is_node(&self) -> bool {
        matches!(self, Self::Node)
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread(thread) => write!(f, "{thread}"),
            Self::Node => f.write_str("node"),
        }
    }
}

/// Client-visible lock access level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockLevel {
    /// Shared read access
    Read,
    /// Exclusive write access
    Write,
    /// Exclusive write access whose transactions are flushed synchronously on release
    SynchronousWrite,
    /// Non-excluding access, compatible with every other level
    Concurrent,
}

impl LockLevel {
    /// Whether this is the shared read level
    pub const fn is_read(&self) -> bool {
        matches!(self, Self::Read)
    }

    /// Whether this is a write-class level
    pub const fn is_write(&self) -> bool {
        matches!(self, Self::Write | Self::SynchronousWrite)
    }

    /// The coarser view of this level seen by the remote authority
    pub const fn server_level(&self) -> ServerLockLevel {
        match self {
            Self::Write | Self::SynchronousWrite => ServerLockLevel::Write,
            Self::Read | Self::Concurrent => ServerLockLevel::Read,
        }
    }

    /// Whether a hold at `self` lets the same thread nest a hold at `other`
    /// without consulting the cluster.
    pub(crate) const fn covers(&self, other: LockLevel) -> bool {
        match self {
            Self::Write | Self::SynchronousWrite => true,
            Self::Read => matches!(other, Self::Read | Self::Concurrent),
            Self::Concurrent => matches!(other, Self::Concurrent),
        }
    }

    pub(crate) const fn index(&self) -> usize {
        match self {
            Self::Read => 0,
            Self::Write => 1,
            Self::SynchronousWrite => 2,
            Self::Concurrent => 3,
        }
    }

    pub(crate) const ALL: [LockLevel; 4] = [Self::Read, Self::Write, Self::SynchronousWrite, Self::Concurrent];
}

/// The coarser lock level the remote authority arbitrates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerLockLevel {
    /// Shared
    Read,
    /// Exclusive
    Write,
}

/// One holder-level pair as known to this node.
///
/// Contexts are the unit of recall commits and of handshake replay: the
/// remote authority re-establishes its view of the node from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockContext {
    /// Who holds or requested the lock
    pub holder: LockHolder,
    /// The level the authority arbitrates for this context
    pub level: ServerLockLevel,
}

impl LockContext {
    /// Create a new context
    pub fn new(holder: LockHolder, level: ServerLockLevel) -> Self {
        Self { holder, level }
    }
}

/// Point-in-time accounting across a manager's live locks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    /// Number of lock objects in the registry
    pub total_locks: usize,
    /// Locks with at least one established hold
    pub held_locks: usize,
    /// Requests suspended awaiting an award
    pub pending_requests: usize,
    /// Threads parked in a distributed wait
    pub waiting_threads: usize,
    /// Locks currently covered by a node-wide greedy grant
    pub greedy_grants: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_level_mapping() {
        assert_eq!(LockLevel::Read.server_level(), ServerLockLevel::Read);
        assert_eq!(LockLevel::Concurrent.server_level(), ServerLockLevel::Read);
        assert_eq!(LockLevel::Write.server_level(), ServerLockLevel::Write);
        assert_eq!(LockLevel::SynchronousWrite.server_level(), ServerLockLevel::Write);
    }

    #[test]
    fn test_level_classification() {
        assert!(LockLevel::Read.is_read());
        assert!(!LockLevel::Read.is_write());
        assert!(LockLevel::Write.is_write());
        assert!(LockLevel::SynchronousWrite.is_write());
        assert!(!LockLevel::Concurrent.is_read());
        assert!(!LockLevel::Concurrent.is_write());
    }

    #[test]
    fn test_nesting_coverage() {
        // write-class covers everything for the same thread
        for level in LockLevel::ALL {
            assert!(LockLevel::Write.covers(level));
            assert!(LockLevel::SynchronousWrite.covers(level));
        }

        // read covers read and concurrent, never write-class
        assert!(LockLevel::Read.covers(LockLevel::Read));
        assert!(LockLevel::Read.covers(LockLevel::Concurrent));
        assert!(!LockLevel::Read.covers(LockLevel::Write));
        assert!(!LockLevel::Read.covers(LockLevel::SynchronousWrite));

        // a concurrent hold proves nothing beyond more concurrents
        assert!(LockLevel::Concurrent.covers(LockLevel::Concurrent));
        assert!(!LockLevel::Concurrent.covers(LockLevel::Read));
    }

    #[test]
    fn test_lock_id_value_semantics() {
        let a = LockId::new("orders/42");
        let b = LockId::from("orders/42");
        let c = LockId::new("orders/43");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < c);
        assert_eq!(a.to_string(), "orders/42");
    }

    #[test]
    fn test_holder_identity() {
        let thread = ThreadId::new(7);
        assert_eq!(LockHolder::Thread(thread).thread(), Some(thread));
        assert!(LockHolder::Node.thread().is_none());
        assert!(LockHolder::Node.is_node());
        assert_eq!(LockHolder::Node.to_string(), "node");
    }
}
