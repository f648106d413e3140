//! Deadline bookkeeping shared by the socket manager and the event loop.
//!
//! Nothing in the stack sleeps.  Instead, anything that must happen later
//! (a TIME_WAIT linger expiring, an application timer firing) is recorded as
//! a deadline in a [`TimerQueue`].  The event loop asks for the earliest
//! deadline, uses it as its `poll(2)` timeout, and afterwards pops whatever
//! has come due:
//!
//! ```text
//!   schedule(now + d, item) ──▶ [ heap ordered by deadline ]
//!                                          │
//!              next_deadline() ────────────┤  → poll timeout
//!         pop_expired / pop_due ◀──────────┘  → due items, oldest first
//! ```
//!
//! Entries can be cancelled through the [`TimerId`] returned by `schedule`;
//! cancelled entries are skipped lazily when they reach the top of the heap.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

/// Identifies one scheduled entry for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

struct Entry<T> {
    deadline: Instant,
    id: TimerId,
    item: T,
}

// Min-heap on (deadline, id): earlier deadlines first, FIFO among equals.
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Entry<T> {}

/// Ordered set of `(deadline, item)` pairs.
pub struct TimerQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    cancelled: HashSet<TimerId>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for TimerQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerQueue")
            .field("pending", &self.len())
            .field("next_deadline", &self.heap.peek().map(|e| e.deadline))
            .finish()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_id: 0,
        }
    }

    /// Record `item` to come due at `deadline`.
    pub fn schedule(&mut self, deadline: Instant, item: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Entry { deadline, id, item });
        id
    }

    /// Forget a scheduled entry.  Cancelling an entry that already fired is
    /// harmless.
    pub fn cancel(&mut self, id: TimerId) {
        if self.heap.iter().any(|e| e.id == id) {
            self.cancelled.insert(id);
        }
    }

    /// Earliest live deadline, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.skip_cancelled();
        self.heap.peek().map(|e| e.deadline)
    }

    /// Time from `now` until the earliest deadline; zero if already due.
    pub fn timeout(&mut self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|d| d.saturating_duration_since(now))
    }

    /// Remove and return every live item due at or before `now`, in deadline
    /// order.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        while let Some(item) = self.pop_due(now, TimerId(u64::MAX)) {
            due.push(item);
        }
        due
    }

    /// Remove and return the earliest live item due at or before `now`,
    /// provided it was scheduled before `before`.
    ///
    /// Popping one entry at a time lets the caller run it before looking at
    /// the next, so a cancellation made by one item holds for the rest.
    pub fn pop_due(&mut self, now: Instant, before: TimerId) -> Option<T> {
        self.skip_cancelled();
        match self.heap.peek() {
            Some(e) if e.deadline <= now && e.id < before => {}
            _ => return None,
        }
        self.heap.pop().map(|entry| entry.item)
    }

    /// The id the next [`TimerQueue::schedule`] call will return.
    pub fn next_id(&self) -> TimerId {
        TimerId(self.next_id)
    }

    /// Live entries still pending.
    pub fn len(&self) -> usize {
        self.heap.len() - self.cancelled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.cancelled.clear();
    }

    fn skip_cancelled(&mut self) {
        while let Some(top) = self.heap.peek() {
            if !self.cancelled.remove(&top.id) {
                break;
            }
            self.heap.pop();
        }
    }
}
