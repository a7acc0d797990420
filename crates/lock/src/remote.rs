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

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::types::{LockContext, LockHolder, LockId, ServerLockLevel, ThreadId};

/// Completion callback for [`RemoteLockManager::async_flush`].
pub type FlushCallback = Box<dyn FnOnce() + Send + 'static>;

/// Gateway to the remote lock authority.
///
/// Every method either hands the message to the transport or surfaces the
/// transport's failure; the lock state machine never retries a call on its
/// own initiative. The authority answers later through the callback surface
/// on [`ClientLock`](crate::lock::ClientLock): `award`, `notified` and
/// `recall`, all invoked from the remote layer's own execution context.
///
/// Wire format, transport and session lifecycle live behind this trait and
/// are of no concern to the lock core.
#[async_trait]
pub trait RemoteLockManager: Send + Sync + std::fmt::Debug {
    /// Fire an asynchronous lock request; the grant arrives later as an award.
    async fn lock(&self, lock: &LockId, holder: &LockHolder, level: ServerLockLevel) -> Result<()>;

    /// Like [`lock`](Self::lock); the caller enforces `timeout` locally.
    async fn try_lock(&self, lock: &LockId, holder: &LockHolder, level: ServerLockLevel, timeout: Duration) -> Result<()>;

    /// Fire-and-forget release notification.
    async fn unlock(&self, lock: &LockId, holder: &LockHolder, level: ServerLockLevel) -> Result<()>;

    /// Inform the authority that `thread` has entered a distributed wait.
    async fn wait(&self, lock: &LockId, thread: ThreadId, wait_time: Option<Duration>) -> Result<()>;

    /// Answer a recall with the contexts that need individual re-award.
    async fn recall_commit(&self, lock: &LockId, contexts: Vec<LockContext>, batch: bool) -> Result<()>;

    /// Push transactional work tied to `lock`, waiting for the authority's ack.
    async fn flush(&self, lock: &LockId) -> Result<()>;

    /// Push transactional work without waiting; `callback` runs once the push
    /// has completed.
    fn async_flush(&self, lock: &LockId, callback: FlushCallback);

    /// Best-effort diagnostic query; no guaranteed effect.
    async fn query(&self, lock: &LockId, thread: ThreadId) -> Result<()>;

    /// Best-effort interrupt signal; no guaranteed effect.
    async fn interrupt(&self, lock: &LockId, thread: ThreadId) -> Result<()>;
}

/// Advisory observer invoked synchronously the instant a thread begins
/// blocking in `wait`.
///
/// Implementations must not block; the callback runs on the waiting task
/// right before it parks.
pub trait WaitListener: Send + Sync {
    /// `thread` is about to park waiting on `lock`
    fn on_wait(&self, lock: &LockId, thread: ThreadId);
}
