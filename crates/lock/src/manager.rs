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

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::LockManagerConfig;
use crate::error::Result;
use crate::lock::ClientLock;
use crate::remote::{RemoteLockManager, WaitListener};
use crate::types::{LockContext, LockHolder, LockId, LockLevel, LockStats, ServerLockLevel, ThreadId};

/// Gate deferring remote-bound calls while the cluster session is paused.
///
/// Callbacks from the remote layer are never gated; only new outbound
/// traffic waits here, so a disconnect defers every fresh remote call
/// consistently.
#[derive(Debug, Clone)]
pub(crate) struct PauseGate {
    rx: watch::Receiver<bool>,
}

impl PauseGate {
    pub(crate) fn new_running() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(true);
        (tx, Self { rx })
    }

    pub(crate) async fn wait_running(&self) {
        let mut rx = self.rx.clone();
        // a dropped sender means the manager is gone; let the call proceed
        // and fail at the transport instead of parking forever
        let _ = rx.wait_for(|running| *running).await;
    }
}

/// Registry and orchestrator owning one [`ClientLock`] per live [`LockId`].
///
/// Exposes the node-wide lock API, participates in cluster pause/unpause and
/// handshake replay, and periodically sweeps idle locks out of the registry.
pub struct ClientLockManager {
    locks: Arc<DashMap<LockId, Arc<ClientLock>>>,
    remote: Arc<dyn RemoteLockManager>,
    wait_listener: Option<Arc<dyn WaitListener>>,
    config: LockManagerConfig,
    pause_tx: watch::Sender<bool>,
    gate: PauseGate,
    sweeper: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl fmt::Debug for ClientLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientLockManager")
            .field("locks", &self.locks.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ClientLockManager {
    /// Create a manager talking to `remote`.
    pub fn new(remote: Arc<dyn RemoteLockManager>, config: LockManagerConfig) -> Self {
        Self::with_wait_listener(remote, config, None)
    }

    /// Create a manager with an advisory [`WaitListener`].
    pub fn with_wait_listener(
        remote: Arc<dyn RemoteLockManager>,
        config: LockManagerConfig,
        wait_listener: Option<Arc<dyn WaitListener>>,
    ) -> Self {
        let (pause_tx, gate) = PauseGate::new_running();
        let manager = Self {
            locks: Arc::new(DashMap::new()),
            remote,
            wait_listener,
            config,
            pause_tx,
            gate,
            sweeper: parking_lot::Mutex::new(None),
        };
        if manager.config.gc_enabled {
            manager.start_sweeper();
        }
        manager
    }

    fn start_sweeper(&self) {
        let locks = Arc::clone(&self.locks);
        let interval = self.config.gc_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let collected = Self::sweep(&locks).await;
                if collected > 0 {
                    tracing::debug!(collected, "gc sweep evicted idle locks");
                }
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    async fn sweep(locks: &DashMap<LockId, Arc<ClientLock>>) -> usize {
        let candidates: Vec<(LockId, Arc<ClientLock>)> =
            locks.iter().map(|entry| (entry.key().clone(), entry.value().clone())).collect();
        let mut collected = 0;
        for (id, lock) in candidates {
            if lock.try_garbage_collect().await {
                locks.remove_if(&id, |_, current| Arc::ptr_eq(current, &lock));
                collected += 1;
            }
        }
        collected
    }

    /// Run one garbage-collection sweep now, returning how many locks were
    /// evicted. The periodic task does exactly this on its own schedule.
    pub async fn collect_garbage(&self) -> usize {
        Self::sweep(&self.locks).await
    }

    /// Resolve the live lock object for `id`, creating one on first
    /// reference. An instance already marked garbage is evicted and replaced
    /// by a fresh one.
    pub fn lookup(&self, id: &LockId) -> Arc<ClientLock> {
        loop {
            let lock = self
                .locks
                .entry(id.clone())
                .or_insert_with(|| {
                    Arc::new(ClientLock::new(
                        id.clone(),
                        Arc::clone(&self.remote),
                        self.gate.clone(),
                        self.wait_listener.clone(),
                    ))
                })
                .clone();
            if !lock.is_garbage() {
                return lock;
            }
            self.locks.remove_if(id, |_, current| Arc::ptr_eq(current, &lock));
        }
    }

    // ------------------------------------------------------------------
    // Node-wide lock API
    // ------------------------------------------------------------------

    /// See [`ClientLock::lock`]
    pub async fn lock(&self, id: &LockId, thread: ThreadId, level: LockLevel) -> Result<()> {
        self.lookup(id).lock(thread, level).await
    }

    /// See [`ClientLock::lock_interruptibly`]
    pub async fn lock_interruptibly(&self, id: &LockId, thread: ThreadId, level: LockLevel, token: &CancellationToken) -> Result<()> {
        self.lookup(id).lock_interruptibly(thread, level, token).await
    }

    /// See [`ClientLock::try_lock`]
    pub fn try_lock(&self, id: &LockId, thread: ThreadId, level: LockLevel) -> Result<bool> {
        self.lookup(id).try_lock(thread, level)
    }

    /// See [`ClientLock::try_lock_timeout`]
    pub async fn try_lock_timeout(&self, id: &LockId, thread: ThreadId, level: LockLevel, timeout: Duration) -> Result<bool> {
        self.lookup(id).try_lock_timeout(thread, level, timeout).await
    }

    /// See [`ClientLock::unlock`]
    pub async fn unlock(&self, id: &LockId, thread: ThreadId, level: LockLevel) -> Result<()> {
        self.lookup(id).unlock(thread, level).await
    }

    /// See [`ClientLock::wait`]
    pub async fn wait(&self, id: &LockId, thread: ThreadId) -> Result<()> {
        self.lookup(id).wait(thread).await
    }

    /// See [`ClientLock::wait_timeout`]
    pub async fn wait_timeout(&self, id: &LockId, thread: ThreadId, timeout: Duration) -> Result<bool> {
        self.lookup(id).wait_timeout(thread, timeout).await
    }

    /// See [`ClientLock::wait_interruptibly`]
    pub async fn wait_interruptibly(&self, id: &LockId, thread: ThreadId, token: &CancellationToken) -> Result<()> {
        self.lookup(id).wait_interruptibly(thread, token).await
    }

    /// See [`ClientLock::notify`]
    pub async fn notify(&self, id: &LockId, thread: ThreadId) -> Result<()> {
        self.lookup(id).notify(thread).await
    }

    /// See [`ClientLock::notify_all`]
    pub async fn notify_all(&self, id: &LockId, thread: ThreadId) -> Result<()> {
        self.lookup(id).notify_all(thread).await
    }

    /// Best-effort diagnostic query against the authority; no guaranteed effect
    pub async fn query_lock(&self, id: &LockId, thread: ThreadId) -> Result<()> {
        self.gate.wait_running().await;
        self.remote.query(id, thread).await
    }

    /// Best-effort attempt to interrupt a waiter; no guaranteed effect
    pub async fn interrupt_wait(&self, id: &LockId, thread: ThreadId) -> Result<()> {
        self.gate.wait_running().await;
        self.remote.interrupt(id, thread).await
    }

    /// Protect `id` from garbage collection across a multi-step protocol
    pub fn pin_lock(&self, id: &LockId) {
        self.lookup(id).pin();
    }

    /// Release one pin on `id`
    pub fn unpin_lock(&self, id: &LockId) {
        self.lookup(id).unpin();
    }

    // ------------------------------------------------------------------
    // Callback surface invoked by the remote layer
    // ------------------------------------------------------------------

    /// Route an award to its lock. Awards for unknown locks are stale (the
    /// request was rolled back and the instance collected) and are handed
    /// straight back.
    pub async fn award(&self, id: &LockId, holder: LockHolder, level: ServerLockLevel) {
        let existing = self.locks.get(id).map(|entry| entry.value().clone());
        match existing {
            Some(lock) => lock.award(holder, level).await,
            None => {
                tracing::debug!(lock = %id, %holder, "award for unknown lock returned");
                if let Err(err) = self.remote.unlock(id, &holder, level).await {
                    tracing::warn!(lock = %id, "failed to return stale award: {err}");
                }
            }
        }
    }

    /// Route a cluster-wide notification to its lock.
    pub fn notified(&self, id: &LockId, thread: ThreadId) {
        match self.locks.get(id).map(|entry| entry.value().clone()) {
            Some(lock) => lock.notified(thread),
            None => tracing::debug!(lock = %id, %thread, "notification for unknown lock dropped"),
        }
    }

    /// Route a recall to its lock.
    pub async fn recall(&self, id: &LockId, level: ServerLockLevel, lease: Option<Duration>, batch: bool) {
        match self.locks.get(id).map(|entry| entry.value().clone()) {
            Some(lock) => lock.recall(level, lease, batch).await,
            None => tracing::debug!(lock = %id, "recall for unknown lock dropped"),
        }
    }

    // ------------------------------------------------------------------
    // Cluster session participation
    // ------------------------------------------------------------------

    /// Defer every new remote-bound call until [`unpause`](Self::unpause).
    pub fn pause(&self) {
        let _ = self.pause_tx.send(false);
        tracing::info!("client lock manager paused");
    }

    /// Resume remote traffic after a pause.
    pub fn unpause(&self) {
        let _ = self.pause_tx.send(true);
        tracing::info!("client lock manager resumed");
    }

    /// Whether remote traffic is currently deferred
    pub fn is_paused(&self) -> bool {
        !*self.pause_tx.borrow()
    }

    /// Snapshot of every lock's held and pending contexts, for the
    /// reconnection layer to replay so the authority can reconstruct its
    /// view of this node.
    pub fn outstanding_contexts(&self) -> Vec<(LockId, Vec<LockContext>)> {
        self.locks
            .iter()
            .filter_map(|entry| {
                let contexts = entry.value().outstanding_contexts();
                if contexts.is_empty() {
                    None
                } else {
                    Some((entry.key().clone(), contexts))
                }
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Observability and lifecycle
    // ------------------------------------------------------------------

    /// Aggregate accounting across all live locks
    pub fn stats(&self) -> LockStats {
        let mut stats = LockStats::default();
        for entry in self.locks.iter() {
            let lock = entry.value();
            stats.total_locks += 1;
            if lock.is_locked() {
                stats.held_locks += 1;
            }
            stats.pending_requests += lock.pending_count();
            stats.waiting_threads += lock.waiting_count();
            if lock.has_greedy_grant() {
                stats.greedy_grants += 1;
            }
        }
        stats
    }

    /// Number of lock objects in the registry
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Stop the sweeper, poison every registered lock and fail all suspended
    /// callers with the garbage-lock error.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        for entry in self.locks.iter() {
            entry.value().abandon();
        }
        self.locks.clear();
        tracing::debug!("client lock manager shut down");
    }
}

impl Drop for ClientLockManager {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}
