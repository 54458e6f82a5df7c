//! Deadline-ordered timer queue.

use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::time::Duration;

/// Identifier of a timer registered with a [`TimerQueue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl TimerId {
    /// Returns the raw ID value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timer({})", self.0)
    }
}

/// A heap entry. The payload lives in a side table so cancelled timers can
/// be dropped without rebuilding the heap.
#[derive(Debug, PartialEq, Eq)]
struct TimerEntry {
    deadline: Duration,
    id: TimerId,
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse order for min-heap behavior (earliest deadline first,
        // then registration order)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Timers ordered by deadline, ties broken by registration order.
pub struct TimerQueue<T> {
    heap: BinaryHeap<TimerEntry>,
    payloads: HashMap<TimerId, T>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            payloads: HashMap::new(),
            next_id: 0,
        }
    }

    /// Registers `payload` to fall due at `deadline`.
    pub fn insert(&mut self, deadline: Duration, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(TimerEntry { deadline, id });
        self.payloads.insert(id, payload);
        id
    }

    /// Removes a timer, returning its payload if it had not fired yet.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        self.payloads.remove(&id)
    }

    /// Returns `true` if the timer is still waiting to fire.
    #[must_use]
    pub fn contains(&self, id: TimerId) -> bool {
        self.payloads.contains_key(&id)
    }

    /// Earliest deadline among live timers.
    pub fn next_deadline(&mut self) -> Option<Duration> {
        self.discard_cancelled();
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Pops the earliest timer if its deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Duration) -> Option<(TimerId, T)> {
        self.discard_cancelled();
        if self.heap.peek()?.deadline > now {
            return None;
        }
        let entry = self.heap.pop()?;
        self.payloads
            .remove(&entry.id)
            .map(|payload| (entry.id, payload))
    }

    /// Number of live timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    /// Returns `true` if no live timers remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Drops every timer.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.payloads.clear();
    }

    fn discard_cancelled(&mut self) {
        while let Some(entry) = self.heap.peek() {
            if self.payloads.contains_key(&entry.id) {
                break;
            }
            self.heap.pop();
        }
    }
}

impl<T> fmt::Debug for TimerQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("live", &self.payloads.len())
            .finish_non_exhaustive()
    }
}
