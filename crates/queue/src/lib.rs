//! Fleetsweep work queue: deduplicating, delay-capable, in-flight aware.
//!
//! One shared queue feeds all dispatcher workers. A key is in exactly one of
//! three places at a time: visible (FIFO), delayed (not-before heap), or
//! in flight. Events for an in-flight key set a dirty bit instead of queueing
//! a second entry, which is what backs the at-most-one-concurrent-dispatch
//! invariant.

#![forbid(unsafe_code)]

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Duration;

use fleetsweep_core::WorkItemKey;
use metrics::gauge;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::trace;

/// A dequeued item: the key plus how many failed attempts preceded this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub key: WorkItemKey,
    pub retries: u32,
}

#[derive(Debug, PartialEq, Eq)]
struct Delayed {
    at: Instant,
    seq: u64,
    key: WorkItemKey,
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct State {
    /// Visible items in arrival order.
    ready: VecDeque<WorkItemKey>,
    /// Membership of `ready` plus `delayed`; the dedup set.
    queued: FxHashSet<WorkItemKey>,
    /// Items waiting out a not-before timestamp.
    delayed: BinaryHeap<Reverse<Delayed>>,
    /// Keys currently held by a dispatcher worker.
    in_flight: FxHashSet<WorkItemKey>,
    /// In-flight keys that received an event and owe one follow-up dispatch.
    dirty: FxHashSet<WorkItemKey>,
    /// Failed-attempt counters, forgotten on `done`.
    retries: FxHashMap<WorkItemKey, u32>,
    seq: u64,
    closed: bool,
}

impl State {
    fn make_visible(&mut self, key: WorkItemKey) {
        self.queued.insert(key.clone());
        self.ready.push_back(key);
    }

    /// Move every delayed entry whose timestamp has elapsed into `ready`.
    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().map_or(false, |Reverse(d)| d.at <= now) {
            if let Some(Reverse(entry)) = self.delayed.pop() {
                self.ready.push_back(entry.key);
            }
        }
    }

    fn depth(&self) -> usize {
        self.queued.len()
    }
}

/// Deduplicating work queue shared by producers (watch adapter, resync) and
/// consumers (dispatcher workers).
pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()), notify: Notify::new() }
    }

    /// Enqueue a key for dispatch. Idempotent: a key already queued is left
    /// where it is, a key in flight is dirty-marked for exactly one follow-up,
    /// and enqueues after `close` are dropped.
    pub async fn enqueue(&self, key: WorkItemKey) {
        let mut s = self.state.lock().await;
        if s.closed {
            return;
        }
        if s.in_flight.contains(&key) {
            s.dirty.insert(key);
            return;
        }
        if s.queued.contains(&key) {
            return;
        }
        s.make_visible(key);
        gauge!("fleetsweep_queue_depth", s.depth() as f64);
        drop(s);
        self.notify.notify_one();
    }

    /// Enqueue a key that becomes visible only after `delay`. Dedup rules
    /// match `enqueue`; an already-queued key keeps its earlier visibility.
    pub async fn enqueue_after(&self, key: WorkItemKey, delay: Duration) {
        if delay.is_zero() {
            return self.enqueue(key).await;
        }
        let mut s = self.state.lock().await;
        if s.closed {
            return;
        }
        if s.in_flight.contains(&key) {
            s.dirty.insert(key);
            return;
        }
        if s.queued.contains(&key) {
            return;
        }
        s.seq += 1;
        let entry = Delayed { at: Instant::now() + delay, seq: s.seq, key: key.clone() };
        s.queued.insert(key);
        s.delayed.push(Reverse(entry));
        gauge!("fleetsweep_queue_depth", s.depth() as f64);
        drop(s);
        // A sleeping worker may need to shorten its deadline.
        self.notify.notify_one();
    }

    /// Wait for the next visible item and mark it in flight. Returns `None`
    /// once the queue is closed; remaining items are deliberately not drained
    /// so that no new dispatch begins after shutdown.
    pub async fn dequeue(&self) -> Option<WorkItem> {
        loop {
            let deadline = {
                let mut s = self.state.lock().await;
                if s.closed {
                    drop(s);
                    // Cascade so that waiters racing with close() are woken too.
                    self.notify.notify_one();
                    return None;
                }
                s.promote_due(Instant::now());
                if let Some(key) = s.ready.pop_front() {
                    s.queued.remove(&key);
                    s.in_flight.insert(key.clone());
                    let retries = s.retries.get(&key).copied().unwrap_or(0);
                    gauge!("fleetsweep_queue_depth", s.depth() as f64);
                    gauge!("fleetsweep_queue_in_flight", s.in_flight.len() as f64);
                    let more = !s.ready.is_empty();
                    drop(s);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(WorkItem { key, retries });
                }
                s.delayed.peek().map(|Reverse(d)| d.at)
            };
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Release a key after a successful dispatch. Forgets its retry history;
    /// a dirty mark turns into an immediate re-enqueue.
    pub async fn done(&self, key: &WorkItemKey) {
        let mut s = self.state.lock().await;
        s.in_flight.remove(key);
        s.retries.remove(key);
        let follow_up = s.dirty.remove(key) && !s.closed;
        if follow_up {
            trace!(key = %key, "dirty key re-enqueued after dispatch");
            s.make_visible(key.clone());
        }
        gauge!("fleetsweep_queue_depth", s.depth() as f64);
        gauge!("fleetsweep_queue_in_flight", s.in_flight.len() as f64);
        drop(s);
        if follow_up {
            self.notify.notify_one();
        }
    }

    /// Release a key the decision function asked to see again. The dirty bit
    /// wins over the delay: an event that arrived mid-dispatch makes the key
    /// visible immediately.
    pub async fn requeue(&self, key: &WorkItemKey, delay: Duration) {
        self.release(key, delay, false).await;
    }

    /// Release a key whose dispatch failed: bumps the retry counter, then
    /// behaves like `requeue`.
    pub async fn requeue_failed(&self, key: &WorkItemKey, delay: Duration) {
        self.release(key, delay, true).await;
    }

    async fn release(&self, key: &WorkItemKey, delay: Duration, failed: bool) {
        let mut s = self.state.lock().await;
        s.in_flight.remove(key);
        if failed {
            *s.retries.entry(key.clone()).or_insert(0) += 1;
        }
        if !s.closed {
            if s.dirty.remove(key) || delay.is_zero() {
                s.make_visible(key.clone());
            } else {
                s.seq += 1;
                let entry = Delayed { at: Instant::now() + delay, seq: s.seq, key: key.clone() };
                s.queued.insert(key.clone());
                s.delayed.push(Reverse(entry));
            }
        }
        gauge!("fleetsweep_queue_depth", s.depth() as f64);
        gauge!("fleetsweep_queue_in_flight", s.in_flight.len() as f64);
        drop(s);
        self.notify.notify_one();
    }

    /// Stop the queue: subsequent enqueues are dropped and blocked `dequeue`
    /// calls return `None`.
    pub async fn close(&self) {
        let mut s = self.state.lock().await;
        s.closed = true;
        drop(s);
        self.notify.notify_waiters();
        // Store one permit for a waiter that checked state before the flag
        // flipped but had not parked yet; it cascades from there.
        self.notify.notify_one();
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Queued items (visible plus delayed), excluding in-flight keys.
    pub async fn len(&self) -> usize {
        self.state.lock().await.depth()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}
