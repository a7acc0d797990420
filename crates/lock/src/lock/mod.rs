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

mod state;


use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{LockError, Result};
use crate::manager::PauseGate;
use crate::remote::{RemoteLockManager, WaitListener};
use crate::types::{LockContext, LockHolder, LockId, LockLevel, ServerLockLevel, ThreadId};

use state::{GreedyState, LockState, RecallState, WaitWake, strongest_saved};

/// How an acquisition call is willing to suspend.
enum AcquireMode<'a> {
    /// Suspend until award or teardown
    Blocking,
    /// Suspend at most this long, enforced locally
    Timed(Duration),
    /// Suspend until award, teardown or cooperative cancellation
    Interruptible(&'a CancellationToken),
}

/// Result of a suspension inside [`ClientLock::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acquired {
    Granted,
    TimedOut,
}

/// Flush flavor owed after a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushKind {
    Sync,
    Async,
}

/// Per-lock client state machine.
///
/// Tracks re-entrant holds per requesting thread, elides network round trips
/// whenever local knowledge already proves the outcome, caches a node-wide
/// greedy grant across local threads, surrenders it on recall, and implements
/// distributed wait/notify on top of the asynchronous award protocol.
///
/// All state transitions are serialized under one internal mutex which is
/// never held across a suspension point; remote traffic happens strictly
/// outside it. The authority's `award` / `notified` / `recall` callbacks only
/// mutate state and wake suspended callers, so they never block on
/// application-task progress.
pub struct ClientLock {
    id: LockId,
    state: Mutex<LockState>,
    remote: Arc<dyn RemoteLockManager>,
    gate: PauseGate,
    wait_listener: Option<Arc<dyn WaitListener>>,
}

impl fmt::Debug for ClientLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientLock").field("id", &self.id).finish_non_exhaustive()
    }
}

impl ClientLock {
    pub(crate) fn new(
        id: LockId,
        remote: Arc<dyn RemoteLockManager>,
        gate: PauseGate,
        wait_listener: Option<Arc<dyn WaitListener>>,
    ) -> Self {
        Self {
            id,
            state: Mutex::new(LockState::new()),
            remote,
            gate,
            wait_listener,
        }
    }

    /// The cluster-wide name of this lock
    pub fn id(&self) -> &LockId {
        &self.id
    }

    // ------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------

    /// Acquire `level` for `thread`, suspending until the grant is
    /// established. Not cancellable; tears down with a garbage-lock error if
    /// the lock is destroyed mid-wait.
    pub async fn lock(&self, thread: ThreadId, level: LockLevel) -> Result<()> {
        self.acquire(thread, level, AcquireMode::Blocking).await.map(|_| ())
    }

    /// Like [`lock`](Self::lock), but cooperatively cancellable through
    /// `token`. Cancellation rolls back exactly this caller's bookkeeping.
    pub async fn lock_interruptibly(&self, thread: ThreadId, level: LockLevel, token: &CancellationToken) -> Result<()> {
        self.acquire(thread, level, AcquireMode::Interruptible(token)).await.map(|_| ())
    }

    /// Acquire `level` if local knowledge already proves the outcome.
    ///
    /// Never suspends and never touches the network: when the request
    /// conflicts with other threads, or the outcome cannot be proven without
    /// asking the authority, it returns `false` immediately.
    pub fn try_lock(&self, thread: ThreadId, level: LockLevel) -> Result<bool> {
        let mut st = self.state.lock();
        if st.garbage {
            return Err(LockError::garbage_lock(&self.id));
        }
        st.check_upgrade(&self.id, thread, level)?;
        if st.locally_grantable(thread, level) {
            st.record_hold(thread, level);
            tracing::trace!(lock = %self.id, %thread, ?level, "try_lock granted locally");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Acquire `level`, waiting at most `timeout`. The deadline is enforced
    /// locally; expiry rolls back this caller's pending entry and returns
    /// `false`.
    pub async fn try_lock_timeout(&self, thread: ThreadId, level: LockLevel, timeout: Duration) -> Result<bool> {
        self.acquire(thread, level, AcquireMode::Timed(timeout))
            .await
            .map(|outcome| outcome == Acquired::Granted)
    }

    async fn acquire(&self, thread: ThreadId, level: LockLevel, mode: AcquireMode<'_>) -> Result<Acquired> {
        let (seq, rx, needs_remote) = {
            let mut st = self.state.lock();
            if st.garbage {
                return Err(LockError::garbage_lock(&self.id));
            }
            st.check_upgrade(&self.id, thread, level)?;
            if st.locally_grantable(thread, level) {
                st.record_hold(thread, level);
                tracing::trace!(lock = %self.id, %thread, ?level, "acquired locally");
                return Ok(Acquired::Granted);
            }
            // A greedy grant that covers the level means the wait is purely
            // local; everything else needs the authority's award.
            let needs_remote = !st.greedy_covers(level);
            let (seq, rx) = st.push_pending(thread, level, needs_remote);
            (seq, rx, needs_remote)
        };

        if needs_remote {
            self.gate.wait_running().await;
            let holder = LockHolder::Thread(thread);
            let sent = match &mode {
                AcquireMode::Timed(timeout) => self.remote.try_lock(&self.id, &holder, level.server_level(), *timeout).await,
                _ => self.remote.lock(&self.id, &holder, level.server_level()).await,
            };
            if let Err(err) = sent {
                self.state.lock().remove_pending(seq);
                return Err(err);
            }
            tracing::debug!(lock = %self.id, %thread, ?level, "lock request sent, suspending");
        }

        match mode {
            AcquireMode::Blocking => match rx.await {
                Ok(result) => result.map(|()| Acquired::Granted),
                Err(_) => Err(LockError::internal("award channel closed while suspended")),
            },
            AcquireMode::Timed(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(result)) => result.map(|()| Acquired::Granted),
                Ok(Err(_)) => Err(LockError::internal("award channel closed while suspended")),
                Err(_elapsed) => {
                    let mut st = self.state.lock();
                    if st.remove_pending(seq) {
                        tracing::debug!(lock = %self.id, %thread, "timed acquisition expired");
                        Ok(Acquired::TimedOut)
                    } else {
                        // the award won the race; the hold is already recorded
                        Ok(Acquired::Granted)
                    }
                }
            },
            AcquireMode::Interruptible(token) => {
                tokio::select! {
                    result = rx => match result {
                        Ok(result) => result.map(|()| Acquired::Granted),
                        Err(_) => Err(LockError::internal("award channel closed while suspended")),
                    },
                    _ = token.cancelled() => {
                        let mut st = self.state.lock();
                        if st.remove_pending(seq) {
                            Err(LockError::cancelled(&self.id, thread))
                        } else {
                            Ok(Acquired::Granted)
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------

    /// Release one hold of `level` for `thread`.
    ///
    /// On the thread's last hold, outside greedy mode, the unlock
    /// notification goes to the authority; on the lock's last hold the
    /// transactional work performed under it is flushed as part of this call.
    pub async fn unlock(&self, thread: ThreadId, level: LockLevel) -> Result<()> {
        let (flush, notify_unlock) = {
            let mut st = self.state.lock();
            if st.garbage {
                return Err(LockError::garbage_lock(&self.id));
            }
            let Some(info) = st.release_hold(&self.id, thread, level)? else {
                return Ok(());
            };
            let woken = st.wake_pass();
            if woken > 0 {
                tracing::trace!(lock = %self.id, woken, "release granted queued requests");
            }

            let greedy_active = matches!(st.greedy, GreedyState::Granted(_)) && st.recall.is_none();
            let flush = if info.lock_drained && info.had_write_class {
                Some(if info.flush_sync { FlushKind::Sync } else { FlushKind::Async })
            } else {
                None
            };
            let notify_unlock = if info.thread_drained && info.server_known && !greedy_active {
                Some(info.server_level)
            } else {
                None
            };
            (flush, notify_unlock)
        };

        if flush.is_none() && notify_unlock.is_none() {
            return Ok(());
        }
        self.gate.wait_running().await;

        // transactions must reach the authority before the release does
        match flush {
            Some(FlushKind::Sync) => self.remote.flush(&self.id).await?,
            Some(FlushKind::Async) => {
                let id = self.id.clone();
                self.remote
                    .async_flush(&self.id, Box::new(move || tracing::trace!(lock = %id, "unlock flush completed")));
            }
            None => {}
        }
        if let Some(server_level) = notify_unlock {
            self.remote.unlock(&self.id, &LockHolder::Thread(thread), server_level).await?;
            tracing::trace!(lock = %self.id, %thread, "unlock notified");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Distributed wait / notify
    // ------------------------------------------------------------------

    /// Release the calling thread's write-class hold stack and suspend until
    /// a notification arrives, then re-acquire the original level before
    /// returning. Not cancellable; tears down with a garbage-lock error if
    /// the lock is destroyed mid-wait.
    pub async fn wait(&self, thread: ThreadId) -> Result<()> {
        self.wait_inner(thread, None, None).await.map(|_| ())
    }

    /// Like [`wait`](Self::wait) with a timeout. Returns `false` when the
    /// timeout elapsed without a notification; the original level is
    /// re-acquired either way.
    pub async fn wait_timeout(&self, thread: ThreadId, timeout: Duration) -> Result<bool> {
        self.wait_inner(thread, Some(timeout), None).await
    }

    /// Like [`wait`](Self::wait), cooperatively cancellable through `token`.
    /// Cancellation removes this thread from the waiting set and propagates;
    /// no re-acquisition is attempted.
    pub async fn wait_interruptibly(&self, thread: ThreadId, token: &CancellationToken) -> Result<()> {
        self.wait_inner(thread, None, Some(token)).await.map(|_| ())
    }

    async fn wait_inner(&self, thread: ThreadId, timeout: Option<Duration>, token: Option<&CancellationToken>) -> Result<bool> {
        // validate monitor discipline while the hold is still in place
        {
            let st = self.state.lock();
            if st.garbage {
                return Err(LockError::garbage_lock(&self.id));
            }
            let holds_write = st.hold_entry(thread).is_some_and(|e| e.has_write_class());
            if !holds_write {
                return Err(LockError::monitor_state(&self.id, thread, "wait() requires a write-class hold"));
            }
        }

        // transactions performed under the hold reach the authority first
        self.gate.wait_running().await;
        self.remote.flush(&self.id).await?;

        // release the full re-entrant stack and park
        let (seq, rx, saved) = {
            let mut st = self.state.lock();
            if st.garbage {
                return Err(LockError::garbage_lock(&self.id));
            }
            let Some(saved) = st.take_holds(thread) else {
                return Err(LockError::monitor_state(&self.id, thread, "hold vanished during wait setup"));
            };
            let (seq, rx) = st.push_waiter(thread);
            st.wake_pass();
            (seq, rx, saved)
        };
        let relock_level = strongest_saved(&saved).unwrap_or(LockLevel::Write);

        if let Err(err) = self.remote.wait(&self.id, thread, timeout).await {
            // never lose the hold over a failed send: leave the waiting set
            // and re-acquire before surfacing the failure
            self.state.lock().remove_waiter(seq);
            self.relock(thread, relock_level, saved).await?;
            return Err(err);
        }

        if let Some(listener) = &self.wait_listener {
            listener.on_wait(&self.id, thread);
        }
        tracing::debug!(lock = %self.id, %thread, ?timeout, "entered distributed wait");

        enum Outcome {
            Notified,
            TimedOut,
            Cancelled,
            Garbage,
        }

        let outcome = match (timeout, token) {
            (None, None) => match rx.await {
                Ok(WaitWake::Notified) => Outcome::Notified,
                Ok(WaitWake::Garbage) | Err(_) => Outcome::Garbage,
            },
            (Some(timeout), _) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(WaitWake::Notified)) => Outcome::Notified,
                Ok(Ok(WaitWake::Garbage)) | Ok(Err(_)) => Outcome::Garbage,
                Err(_elapsed) => {
                    let mut st = self.state.lock();
                    if st.remove_waiter(seq) {
                        Outcome::TimedOut
                    } else {
                        // a signal won the race against the timer
                        Outcome::Notified
                    }
                }
            },
            (None, Some(token)) => {
                tokio::select! {
                    wake = rx => match wake {
                        Ok(WaitWake::Notified) => Outcome::Notified,
                        Ok(WaitWake::Garbage) | Err(_) => Outcome::Garbage,
                    },
                    _ = token.cancelled() => {
                        let mut st = self.state.lock();
                        if st.remove_waiter(seq) {
                            Outcome::Cancelled
                        } else {
                            Outcome::Notified
                        }
                    }
                }
            }
        };

        match outcome {
            Outcome::Garbage => Err(LockError::garbage_lock(&self.id)),
            Outcome::Cancelled => Err(LockError::cancelled(&self.id, thread)),
            Outcome::Notified => {
                self.relock(thread, relock_level, saved).await?;
                Ok(true)
            }
            Outcome::TimedOut => {
                tracing::debug!(lock = %self.id, %thread, "wait timed out, re-acquiring");
                self.relock(thread, relock_level, saved).await?;
                Ok(false)
            }
        }
    }

    /// Re-acquire the strongest saved level through the normal blocking path,
    /// then reinstate the full saved re-entrant stack.
    async fn relock(&self, thread: ThreadId, level: LockLevel, saved: [u32; 4]) -> Result<()> {
        self.acquire(thread, level, AcquireMode::Blocking).await?;
        self.state.lock().restore_holds(thread, saved);
        Ok(())
    }

    /// Wake one local waiter and forward the signal cluster-wide.
    pub async fn notify(&self, thread: ThreadId) -> Result<()> {
        self.notify_n(thread, 1).await
    }

    /// Wake every local waiter and forward the signal cluster-wide.
    pub async fn notify_all(&self, thread: ThreadId) -> Result<()> {
        self.notify_n(thread, usize::MAX).await
    }

    async fn notify_n(&self, thread: ThreadId, limit: usize) -> Result<()> {
        {
            let mut st = self.state.lock();
            if st.garbage {
                return Err(LockError::garbage_lock(&self.id));
            }
            let holds_write = st.hold_entry(thread).is_some_and(|e| e.has_write_class());
            if !holds_write {
                return Err(LockError::monitor_state(&self.id, thread, "notify() requires a write-class hold"));
            }
            let woken = st.notify_local(limit);
            tracing::debug!(lock = %self.id, %thread, woken, "notified local waiters");
        }

        // remote waiters learn of the signal through the transaction it rides
        // on; the commit pipeline carries it to the authority
        self.gate.wait_running().await;
        let id = self.id.clone();
        self.remote
            .async_flush(&self.id, Box::new(move || tracing::trace!(lock = %id, "notify flush completed")));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Callback surface invoked by the remote layer
    // ------------------------------------------------------------------

    /// An award arrived from the authority for `holder` at `level`.
    ///
    /// A node-wide holder installs the greedy grant; a thread holder resumes
    /// that thread's first pending request. Awards this node can no longer
    /// use are handed straight back.
    pub async fn award(&self, holder: LockHolder, level: ServerLockLevel) {
        let give_back = {
            let mut st = self.state.lock();
            match holder {
                LockHolder::Node => {
                    if st.garbage || st.recall.is_some() {
                        tracing::debug!(lock = %self.id, "greedy award not accepted, returning");
                        true
                    } else {
                        st.set_greedy(level);
                        let woken = st.wake_pass();
                        tracing::debug!(lock = %self.id, ?level, woken, "greedy grant installed");
                        false
                    }
                }
                LockHolder::Thread(thread) => {
                    if st.garbage {
                        true
                    } else if st.award_thread(thread) {
                        tracing::trace!(lock = %self.id, %thread, "award resumed pending request");
                        false
                    } else if st.hold_entry(thread).is_some() {
                        // replayed award for an established hold
                        tracing::debug!(lock = %self.id, %thread, "duplicate award ignored");
                        false
                    } else {
                        // the request was rolled back (timeout or cancellation)
                        tracing::debug!(lock = %self.id, %thread, "stale award returned");
                        true
                    }
                }
            }
        };

        if give_back {
            if let Err(err) = self.remote.unlock(&self.id, &holder, level).await {
                tracing::warn!(lock = %self.id, %holder, "failed to return unusable award: {err}");
            }
        }
    }

    /// A cluster-wide notification arrived for `thread`.
    pub fn notified(&self, thread: ThreadId) {
        let mut st = self.state.lock();
        if !st.notify_thread(thread) {
            // the waiter already timed out or was cancelled
            tracing::debug!(lock = %self.id, %thread, "notification for absent waiter dropped");
        }
    }

    /// The authority reclaims the greedy grant.
    ///
    /// With a lease the grant stays usable until the lease elapses; the
    /// commit then collects every held and pending context and hands them
    /// back for individual re-award.
    pub async fn recall(self: Arc<Self>, level: ServerLockLevel, lease: Option<Duration>, batch: bool) {
        if let Some(lease) = lease.filter(|l| !l.is_zero()) {
            tracing::debug!(lock = %self.id, ?level, ?lease, "recall deferred for lease");
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                tokio::time::sleep(lease).await;
                this.recall_now(level, batch).await;
            });
            return;
        }
        self.recall_now(level, batch).await;
    }

    async fn recall_now(&self, level: ServerLockLevel, batch: bool) {
        let contexts = {
            let mut st = self.state.lock();
            if st.garbage || st.recall.is_some() {
                return;
            }
            if !matches!(st.greedy, GreedyState::Granted(_)) {
                tracing::debug!(lock = %self.id, "recall without an active greedy grant");
                return;
            }
            st.recall = Some(RecallState { level, batch });
            st.commit_contexts()
        };
        tracing::debug!(lock = %self.id, ?level, batch, contexts = contexts.len(), "answering recall");

        // flush first so re-awarded contexts observe committed work
        if let Err(err) = self.remote.flush(&self.id).await {
            tracing::warn!(lock = %self.id, "flush before recall commit failed: {err}");
        }
        if let Err(err) = self.remote.recall_commit(&self.id, contexts, batch).await {
            tracing::warn!(lock = %self.id, "recall commit failed: {err}");
        }

        let mut st = self.state.lock();
        st.greedy = GreedyState::None;
        st.recall = None;
    }

    // ------------------------------------------------------------------
    // Garbage collection and pinning
    // ------------------------------------------------------------------

    /// Attempt to reclaim this instance. Succeeds only when holds, pending
    /// requests and wait entries are all empty and the lock is not pinned;
    /// success is terminal and a still-cached greedy grant is returned to the
    /// authority. Failure changes nothing, so speculative retries are safe.
    pub async fn try_garbage_collect(&self) -> bool {
        let returned_grant = {
            let mut st = self.state.lock();
            if st.garbage {
                return true;
            }
            if !st.gc_eligible() {
                return false;
            }
            st.garbage = true;
            match st.greedy {
                GreedyState::Granted(level) => {
                    st.greedy = GreedyState::None;
                    Some(level)
                }
                GreedyState::None => None,
            }
        };
        tracing::debug!(lock = %self.id, "lock garbage collected");

        if let Some(level) = returned_grant {
            self.gate.wait_running().await;
            if let Err(err) = self.remote.unlock(&self.id, &LockHolder::Node, level).await {
                tracing::warn!(lock = %self.id, "failed to return greedy grant on gc: {err}");
            }
        }
        true
    }

    /// Block garbage collection regardless of idle state.
    pub fn pin(&self) {
        self.state.lock().pin();
    }

    /// Release one [`pin`](Self::pin).
    pub fn unpin(&self) {
        self.state.lock().unpin();
    }

    /// Terminal teardown without authority interaction: poison the instance
    /// and fail every suspended caller with the garbage-lock error.
    pub(crate) fn abandon(&self) {
        self.state.lock().abandon(&self.id);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Whether any thread currently holds this lock
    pub fn is_locked(&self) -> bool {
        self.state.lock().is_locked()
    }

    /// Whether `thread` currently holds `level`
    pub fn is_locked_by(&self, thread: ThreadId, level: LockLevel) -> bool {
        self.state.lock().is_locked_by(thread, level)
    }

    /// Outstanding acquisitions minus releases at `level`, across threads
    pub fn hold_count(&self, level: LockLevel) -> usize {
        self.state.lock().hold_count(level)
    }

    /// Requests suspended awaiting an award
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending_count()
    }

    /// Threads parked in a distributed wait
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiting_count()
    }

    /// Whether this instance has been reclaimed
    pub fn is_garbage(&self) -> bool {
        self.state.lock().garbage
    }

    /// Whether a node-wide greedy grant is cached
    pub fn has_greedy_grant(&self) -> bool {
        self.state.lock().has_greedy()
    }

    /// Everything the authority should know about this lock, for handshake
    /// replay after a reconnect.
    pub fn outstanding_contexts(&self) -> Vec<LockContext> {
        self.state.lock().outstanding_contexts()
    }
}
