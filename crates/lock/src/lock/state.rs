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

use smallvec::SmallVec;
use std::collections::VecDeque;
use tokio::sync::oneshot;

use crate::error::{LockError, Result};
use crate::types::{LockContext, LockHolder, LockId, LockLevel, ServerLockLevel, ThreadId};

/// Re-entrancy counts one thread has on one lock, indexed by level.
#[derive(Debug)]
pub(crate) struct HoldEntry {
    pub(crate) thread: ThreadId,
    counts: [u32; 4],
}

impl HoldEntry {
    fn new(thread: ThreadId) -> Self {
        Self { thread, counts: [0; 4] }
    }

    pub(crate) fn count(&self, level: LockLevel) -> u32 {
        self.counts[level.index()]
    }

    fn add(&mut self, level: LockLevel) {
        self.counts[level.index()] += 1;
    }

    fn remove(&mut self, level: LockLevel) -> bool {
        let slot = &mut self.counts[level.index()];
        if *slot == 0 {
            return false;
        }
        *slot -= 1;
        true
    }

    fn total(&self) -> u32 {
        self.counts.iter().sum()
    }

    fn non_concurrent(&self) -> u32 {
        self.total() - self.count(LockLevel::Concurrent)
    }

    pub(crate) fn has_write_class(&self) -> bool {
        self.count(LockLevel::Write) > 0 || self.count(LockLevel::SynchronousWrite) > 0
    }

    /// Strongest level held, write-class before read before concurrent
    pub(crate) fn strongest(&self) -> Option<LockLevel> {
        for level in [
            LockLevel::SynchronousWrite,
            LockLevel::Write,
            LockLevel::Read,
            LockLevel::Concurrent,
        ] {
            if self.count(level) > 0 {
                return Some(level);
            }
        }
        None
    }

    fn is_empty(&self) -> bool {
        self.counts.iter().all(|&c| c == 0)
    }
}

/// Strongest level recorded in a saved hold snapshot.
pub(crate) fn strongest_saved(counts: &[u32; 4]) -> Option<LockLevel> {
    for level in [
        LockLevel::SynchronousWrite,
        LockLevel::Write,
        LockLevel::Read,
        LockLevel::Concurrent,
    ] {
        if counts[level.index()] > 0 {
            return Some(level);
        }
    }
    None
}

/// A request suspended awaiting an award.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) seq: u64,
    pub(crate) thread: ThreadId,
    pub(crate) level: LockLevel,
    /// Whether a request for this entry has gone out to the authority
    pub(crate) remote_sent: bool,
    tx: Option<oneshot::Sender<Result<()>>>,
}

/// Outcome delivered to a parked wait entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitWake {
    Notified,
    Garbage,
}

/// A thread that released its write-class hold and parked in wait().
#[derive(Debug)]
pub(crate) struct WaitEntry {
    pub(crate) seq: u64,
    pub(crate) thread: ThreadId,
    tx: Option<oneshot::Sender<WaitWake>>,
}

/// Whether the node holds a cluster-wide grant usable by any local thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GreedyState {
    None,
    Granted(ServerLockLevel),
}

/// A recall is being answered; no new greedy use is permitted.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecallState {
    pub(crate) level: ServerLockLevel,
    pub(crate) batch: bool,
}

/// What a release changed, for the caller to derive follow-up network calls.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReleaseInfo {
    /// The releasing thread no longer holds anything on this lock
    pub(crate) thread_drained: bool,
    /// No thread holds anything on this lock any more
    pub(crate) lock_drained: bool,
    /// The thread's holds included a write-class level
    pub(crate) had_write_class: bool,
    /// The released level demands a synchronous flush
    pub(crate) flush_sync: bool,
    /// Strongest server-side level the thread was established at
    pub(crate) server_level: ServerLockLevel,
    /// The thread held more than concurrent levels, so the authority knows it
    pub(crate) server_known: bool,
}

/// Mutable core of one [`ClientLock`](super::ClientLock).
///
/// Every transition happens under the owning mutex; nothing in here blocks
/// or touches the network. Suspension is expressed through the oneshot
/// senders stored in pending and wait entries.
#[derive(Debug)]
pub(crate) struct LockState {
    holds: SmallVec<[HoldEntry; 4]>,
    pending: VecDeque<PendingRequest>,
    waiters: Vec<WaitEntry>,
    pub(crate) greedy: GreedyState,
    pub(crate) recall: Option<RecallState>,
    pub(crate) garbage: bool,
    pins: u32,
    next_seq: u64,
}

impl LockState {
    pub(crate) fn new() -> Self {
        Self {
            holds: SmallVec::new(),
            pending: VecDeque::new(),
            waiters: Vec::new(),
            greedy: GreedyState::None,
            recall: None,
            garbage: false,
            pins: 0,
            next_seq: 0,
        }
    }

    fn alloc_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub(crate) fn hold_entry(&self, thread: ThreadId) -> Option<&HoldEntry> {
        self.holds.iter().find(|e| e.thread == thread)
    }

    fn hold_entry_mut(&mut self, thread: ThreadId) -> Option<&mut HoldEntry> {
        self.holds.iter_mut().find(|e| e.thread == thread)
    }

    // ------------------------------------------------------------------
    // Compatibility
    // ------------------------------------------------------------------

    /// Whether a request at `requested` conflicts with `other` (a hold or
    /// pending level of a different thread).
    fn level_conflicts(requested: LockLevel, other: LockLevel) -> bool {
        if matches!(requested, LockLevel::Concurrent) || matches!(other, LockLevel::Concurrent) {
            return false;
        }
        !(requested.is_read() && other.is_read())
    }

    fn conflicts_with_holds(&self, thread: ThreadId, level: LockLevel) -> bool {
        self.holds.iter().filter(|e| e.thread != thread).any(|e| {
            LockLevel::ALL
                .iter()
                .any(|&held| e.count(held) > 0 && Self::level_conflicts(level, held))
        })
    }

    /// Conflict against holds of other threads plus the first `queued_ahead`
    /// pending entries of other threads.
    fn conflicts_before(&self, queued_ahead: usize, thread: ThreadId, level: LockLevel) -> bool {
        if self.conflicts_with_holds(thread, level) {
            return true;
        }
        self.pending
            .iter()
            .take(queued_ahead)
            .filter(|p| p.thread != thread)
            .any(|p| Self::level_conflicts(level, p.level))
    }

    fn self_authority(&self, thread: ThreadId, level: LockLevel) -> bool {
        self.hold_entry(thread)
            .and_then(HoldEntry::strongest)
            .is_some_and(|s| s.covers(level))
    }

    /// Whether an active, un-recalled greedy grant proves the outcome of a
    /// request at `level`.
    pub(crate) fn greedy_covers(&self, level: LockLevel) -> bool {
        if self.recall.is_some() {
            return false;
        }
        match self.greedy {
            GreedyState::Granted(ServerLockLevel::Write) => true,
            GreedyState::Granted(ServerLockLevel::Read) => !level.is_write(),
            GreedyState::None => false,
        }
    }

    /// Whether local knowledge alone proves the request can be granted now.
    pub(crate) fn locally_grantable(&self, thread: ThreadId, level: LockLevel) -> bool {
        if self.conflicts_before(self.pending.len(), thread, level) {
            return false;
        }
        matches!(level, LockLevel::Concurrent) || self.self_authority(thread, level) || self.greedy_covers(level)
    }

    /// Reject read-to-write upgrades: satisfying one could require a round
    /// trip that deadlocks against the thread's own read hold.
    pub(crate) fn check_upgrade(&self, lock: &LockId, thread: ThreadId, level: LockLevel) -> Result<()> {
        if level.is_write() {
            if let Some(entry) = self.hold_entry(thread) {
                if entry.non_concurrent() > 0 && !entry.has_write_class() {
                    return Err(LockError::upgrade_unsupported(lock, thread, level));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Holds
    // ------------------------------------------------------------------

    pub(crate) fn record_hold(&mut self, thread: ThreadId, level: LockLevel) {
        match self.hold_entry_mut(thread) {
            Some(entry) => entry.add(level),
            None => {
                let mut entry = HoldEntry::new(thread);
                entry.add(level);
                self.holds.push(entry);
            }
        }
    }

    pub(crate) fn release_hold(&mut self, lock: &LockId, thread: ThreadId, level: LockLevel) -> Result<Option<ReleaseInfo>> {
        let Some(idx) = self.holds.iter().position(|e| e.thread == thread && e.count(level) > 0) else {
            if matches!(level, LockLevel::Concurrent) {
                // tolerated: concurrent holds impose no monitor discipline
                return Ok(None);
            }
            return Err(LockError::monitor_state(
                lock,
                thread,
                format!("released {level:?} which it does not hold"),
            ));
        };

        let entry = &mut self.holds[idx];
        let server_level = entry.strongest().map(|s| s.server_level()).unwrap_or(ServerLockLevel::Read);
        let had_write_class = entry.has_write_class();
        let server_known = entry.non_concurrent() > 0;
        entry.remove(level);

        let thread_drained = entry.is_empty();
        if thread_drained {
            self.holds.remove(idx);
        }

        Ok(Some(ReleaseInfo {
            thread_drained,
            lock_drained: self.holds.is_empty(),
            had_write_class,
            flush_sync: matches!(level, LockLevel::SynchronousWrite),
            server_level,
            server_known,
        }))
    }

    /// Remove and return the thread's entire re-entrant hold stack.
    pub(crate) fn take_holds(&mut self, thread: ThreadId) -> Option<[u32; 4]> {
        let idx = self.holds.iter().position(|e| e.thread == thread)?;
        let entry = self.holds.remove(idx);
        Some(entry.counts)
    }

    /// Reinstate a hold stack saved by [`take_holds`](Self::take_holds),
    /// replacing whatever the re-acquisition recorded.
    pub(crate) fn restore_holds(&mut self, thread: ThreadId, saved: [u32; 4]) {
        match self.hold_entry_mut(thread) {
            Some(entry) => entry.counts = saved,
            None => {
                let mut entry = HoldEntry::new(thread);
                entry.counts = saved;
                self.holds.push(entry);
            }
        }
    }

    // ------------------------------------------------------------------
    // Pending requests
    // ------------------------------------------------------------------

    pub(crate) fn push_pending(
        &mut self,
        thread: ThreadId,
        level: LockLevel,
        remote_sent: bool,
    ) -> (u64, oneshot::Receiver<Result<()>>) {
        let seq = self.alloc_seq();
        let (tx, rx) = oneshot::channel();
        self.pending.push_back(PendingRequest {
            seq,
            thread,
            level,
            remote_sent,
            tx: Some(tx),
        });
        (seq, rx)
    }

    /// Roll back one caller's own pending entry. Returns false when the entry
    /// is gone, i.e. the request was granted before the rollback ran.
    pub(crate) fn remove_pending(&mut self, seq: u64) -> bool {
        match self.pending.iter().position(|p| p.seq == seq) {
            Some(idx) => {
                self.pending.remove(idx);
                true
            }
            None => false,
        }
    }

    fn grant_pending_at(&mut self, idx: usize) {
        let Some(mut entry) = self.pending.remove(idx) else {
            return;
        };
        tracing::trace!(
            thread = %entry.thread,
            level = ?entry.level,
            remote_sent = entry.remote_sent,
            "pending request granted"
        );
        self.record_hold(entry.thread, entry.level);
        if let Some(tx) = entry.tx.take() {
            let _ = tx.send(Ok(()));
        }
    }

    /// Grant every pending entry local knowledge can now prove, in queue
    /// order. Requests from one thread are never reordered: an entry is only
    /// considered after everything queued ahead of it was either granted or
    /// found incompatible.
    pub(crate) fn wake_pass(&mut self) -> usize {
        let mut granted = 0;
        let mut idx = 0;
        while idx < self.pending.len() {
            let (thread, level) = {
                let p = &self.pending[idx];
                (p.thread, p.level)
            };
            let authority = matches!(level, LockLevel::Concurrent)
                || self.self_authority(thread, level)
                || self.greedy_covers(level);
            if authority && !self.conflicts_before(idx, thread, level) {
                self.grant_pending_at(idx);
                granted += 1;
            } else {
                idx += 1;
            }
        }
        granted
    }

    /// Grant the first pending request of `thread` on the authority's word.
    pub(crate) fn award_thread(&mut self, thread: ThreadId) -> bool {
        match self.pending.iter().position(|p| p.thread == thread) {
            Some(idx) => {
                self.grant_pending_at(idx);
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_greedy(&mut self, level: ServerLockLevel) {
        self.greedy = GreedyState::Granted(level);
    }

    // ------------------------------------------------------------------
    // Wait entries
    // ------------------------------------------------------------------

    pub(crate) fn push_waiter(&mut self, thread: ThreadId) -> (u64, oneshot::Receiver<WaitWake>) {
        let seq = self.alloc_seq();
        let (tx, rx) = oneshot::channel();
        self.waiters.push(WaitEntry { seq, thread, tx: Some(tx) });
        (seq, rx)
    }

    /// Roll back one caller's own wait entry. Returns false when a signal won
    /// the race and the entry is already gone.
    pub(crate) fn remove_waiter(&mut self, seq: u64) -> bool {
        match self.waiters.iter().position(|w| w.seq == seq) {
            Some(idx) => {
                self.waiters.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Wake the first parked waiter of `thread`, if any.
    pub(crate) fn notify_thread(&mut self, thread: ThreadId) -> bool {
        match self.waiters.iter().position(|w| w.thread == thread) {
            Some(idx) => {
                let mut entry = self.waiters.remove(idx);
                if let Some(tx) = entry.tx.take() {
                    let _ = tx.send(WaitWake::Notified);
                }
                true
            }
            None => false,
        }
    }

    /// Wake up to `limit` local waiters in park order.
    pub(crate) fn notify_local(&mut self, limit: usize) -> usize {
        let n = limit.min(self.waiters.len());
        for mut entry in self.waiters.drain(..n) {
            if let Some(tx) = entry.tx.take() {
                let _ = tx.send(WaitWake::Notified);
            }
        }
        n
    }

    // ------------------------------------------------------------------
    // Recall and replay contexts
    // ------------------------------------------------------------------

    /// Contexts the authority needs to re-award individually after a recall.
    /// Pending entries are marked as known to the authority from here on.
    pub(crate) fn commit_contexts(&mut self) -> Vec<LockContext> {
        let mut contexts = Vec::with_capacity(self.holds.len() + self.pending.len());
        for entry in &self.holds {
            if entry.non_concurrent() > 0 {
                let level = entry.strongest().map(|s| s.server_level()).unwrap_or(ServerLockLevel::Read);
                contexts.push(LockContext::new(LockHolder::Thread(entry.thread), level));
            }
        }
        for p in &mut self.pending {
            contexts.push(LockContext::new(LockHolder::Thread(p.thread), p.level.server_level()));
            p.remote_sent = true;
        }
        contexts
    }

    /// Snapshot of everything the authority should know about this lock,
    /// used for handshake replay after a reconnect.
    pub(crate) fn outstanding_contexts(&self) -> Vec<LockContext> {
        let mut contexts = Vec::new();
        if let GreedyState::Granted(level) = self.greedy {
            contexts.push(LockContext::new(LockHolder::Node, level));
        }
        for entry in &self.holds {
            if entry.non_concurrent() > 0 {
                let level = entry.strongest().map(|s| s.server_level()).unwrap_or(ServerLockLevel::Read);
                contexts.push(LockContext::new(LockHolder::Thread(entry.thread), level));
            }
        }
        for p in &self.pending {
            contexts.push(LockContext::new(LockHolder::Thread(p.thread), p.level.server_level()));
        }
        contexts
    }

    // ------------------------------------------------------------------
    // Garbage collection and pinning
    // ------------------------------------------------------------------

    pub(crate) fn pin(&mut self) {
        self.pins += 1;
    }

    pub(crate) fn unpin(&mut self) {
        debug_assert!(self.pins > 0, "unpin without matching pin");
        self.pins = self.pins.saturating_sub(1);
    }

    pub(crate) fn gc_eligible(&self) -> bool {
        self.holds.is_empty() && self.pending.is_empty() && self.waiters.is_empty() && self.pins == 0 && self.recall.is_none()
    }

    /// Terminal teardown: poison the instance and fail every suspended caller.
    pub(crate) fn abandon(&mut self, lock: &LockId) {
        self.garbage = true;
        for mut p in self.pending.drain(..) {
            if let Some(tx) = p.tx.take() {
                let _ = tx.send(Err(LockError::garbage_lock(lock)));
            }
        }
        for mut w in self.waiters.drain(..) {
            if let Some(tx) = w.tx.take() {
                let _ = tx.send(WaitWake::Garbage);
            }
        }
        self.holds.clear();
        self.greedy = GreedyState::None;
        self.recall = None;
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub(crate) fn is_locked(&self) -> bool {
        !self.holds.is_empty()
    }

    pub(crate) fn is_locked_by(&self, thread: ThreadId, level: LockLevel) -> bool {
        self.hold_entry(thread).is_some_and(|e| e.count(level) > 0)
    }

    pub(crate) fn hold_count(&self, level: LockLevel) -> usize {
        self.holds.iter().map(|e| e.count(level) as usize).sum()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn waiting_count(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn has_greedy(&self) -> bool {
        matches!(self.greedy, GreedyState::Granted(_))
    }
}
