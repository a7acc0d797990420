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

//! Shared fakes for exercising the lock state machine without a cluster.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::manager::ClientLockManager;
use crate::remote::{FlushCallback, RemoteLockManager};
use crate::types::{LockContext, LockHolder, LockId, ServerLockLevel, ThreadId};

/// How the fake authority answers lock requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AwardPolicy {
    /// Award the requested level to the requesting holder. Only sound for
    /// uncontended traffic; a real authority would queue conflicting awards.
    Specific,
    /// Answer the first request with a node-wide greedy grant at the
    /// requested level.
    Greedy,
    /// Leave requests pending until the test fires awards by hand.
    Manual,
}

/// One recorded call into the fake authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RemoteCall {
    Lock {
        lock: LockId,
        holder: LockHolder,
        level: ServerLockLevel,
    },
    TryLock {
        lock: LockId,
        holder: LockHolder,
        level: ServerLockLevel,
        timeout: Duration,
    },
    Unlock {
        lock: LockId,
        holder: LockHolder,
        level: ServerLockLevel,
    },
    Wait {
        lock: LockId,
        thread: ThreadId,
    },
    RecallCommit {
        lock: LockId,
        contexts: Vec<LockContext>,
        batch: bool,
    },
    Flush {
        lock: LockId,
    },
    AsyncFlush {
        lock: LockId,
    },
    Query {
        lock: LockId,
        thread: ThreadId,
    },
    Interrupt {
        lock: LockId,
        thread: ThreadId,
    },
}

/// Recording [`RemoteLockManager`] double with scripted award behavior.
///
/// Awards are delivered through the attached manager on a spawned task, so
/// they arrive asynchronously the way real callbacks do.
#[derive(Debug)]
pub(crate) struct FakeAuthority {
    policy: AwardPolicy,
    calls: Mutex<Vec<RemoteCall>>,
    manager: Mutex<Option<Arc<ClientLockManager>>>,
}

impl FakeAuthority {
    pub(crate) fn new(policy: AwardPolicy) -> Self {
        Self {
            policy,
            calls: Mutex::new(Vec::new()),
            manager: Mutex::new(None),
        }
    }

    /// Wire the callback path; awards route through this manager.
    pub(crate) fn attach(&self, manager: &Arc<ClientLockManager>) {
        *self.manager.lock() = Some(Arc::clone(manager));
    }

    pub(crate) fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: RemoteCall) {
        self.calls.lock().push(call);
    }

    fn answer(&self, lock: &LockId, holder: &LockHolder, level: ServerLockLevel) {
        let awarded = match self.policy {
            AwardPolicy::Specific => Some((*holder, level)),
            AwardPolicy::Greedy => Some((LockHolder::Node, level)),
            AwardPolicy::Manual => None,
        };
        let Some((holder, level)) = awarded else { return };
        let Some(manager) = self.manager.lock().clone() else { return };
        let lock = lock.clone();
        tokio::spawn(async move {
            manager.award(&lock, holder, level).await;
        });
    }
}

#[async_trait]
impl RemoteLockManager for FakeAuthority {
    async fn lock(&self, lock: &LockId, holder: &LockHolder, level: ServerLockLevel) -> Result<()> {
        self.record(RemoteCall::Lock {
            lock: lock.clone(),
            holder: *holder,
            level,
        });
        self.answer(lock, holder, level);
        Ok(())
    }

    async fn try_lock(&self, lock: &LockId, holder: &LockHolder, level: ServerLockLevel, timeout: Duration) -> Result<()> {
        self.record(RemoteCall::TryLock {
            lock: lock.clone(),
            holder: *holder,
            level,
            timeout,
        });
        self.answer(lock, holder, level);
        Ok(())
    }

    async fn unlock(&self, lock: &LockId, holder: &LockHolder, level: ServerLockLevel) -> Result<()> {
        self.record(RemoteCall::Unlock {
            lock: lock.clone(),
            holder: *holder,
            level,
        });
        Ok(())
    }

    async fn wait(&self, lock: &LockId, thread: ThreadId, _wait_time: Option<Duration>) -> Result<()> {
        self.record(RemoteCall::Wait {
            lock: lock.clone(),
            thread,
        });
        Ok(())
    }

    async fn recall_commit(&self, lock: &LockId, contexts: Vec<LockContext>, batch: bool) -> Result<()> {
        self.record(RemoteCall::RecallCommit {
            lock: lock.clone(),
            contexts,
            batch,
        });
        Ok(())
    }

    async fn flush(&self, lock: &LockId) -> Result<()> {
        self.record(RemoteCall::Flush { lock: lock.clone() });
        Ok(())
    }

    fn async_flush(&self, lock: &LockId, callback: FlushCallback) {
        self.record(RemoteCall::AsyncFlush { lock: lock.clone() });
        callback();
    }

    async fn query(&self, lock: &LockId, thread: ThreadId) -> Result<()> {
        self.record(RemoteCall::Query {
            lock: lock.clone(),
            thread,
        });
        Ok(())
    }

    async fn interrupt(&self, lock: &LockId, thread: ThreadId) -> Result<()> {
        self.record(RemoteCall::Interrupt {
            lock: lock.clone(),
            thread,
        });
        Ok(())
    }
}

/// Manager wired to a fresh [`FakeAuthority`], sweeping disabled so tests
/// drive garbage collection explicitly.
pub(crate) fn harness(policy: AwardPolicy) -> (Arc<ClientLockManager>, Arc<FakeAuthority>) {
    let remote = Arc::new(FakeAuthority::new(policy));
    let manager = Arc::new(ClientLockManager::new(
        Arc::clone(&remote) as Arc<dyn RemoteLockManager>,
        crate::config::LockManagerConfig::without_gc(),
    ));
    remote.attach(&manager);
    (manager, remote)
}

/// Poll `cond` until it holds, failing the test after a generous deadline.
pub(crate) async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time: {what}");
}

/// Install a test subscriber once so failing runs show the tracing output.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
