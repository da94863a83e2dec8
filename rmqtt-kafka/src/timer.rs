//! Deadline-ordered signal timers.
//!
//! The heap keeps cancelled entries until they surface; `live` decides
//! whether a popped entry still fires.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use ahash::HashSet;

use rmqtt_kafka_utils::TimestampMillis;

use crate::context::TimerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timer {
    pub id: TimerId,
    pub at: TimestampMillis,
    pub binding_id: u64,
    pub signal_id: i32,
    pub context: u32,
}

impl Ord for Timer {
    // earliest deadline first, ties in scheduling order
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at).then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    next_id: TimerId,
    heap: BinaryHeap<Timer>,
    live: HashSet<TimerId>,
}

impl TimerQueue {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at: TimestampMillis, binding_id: u64, signal_id: i32, context: u32) -> TimerId {
        self.next_id += 1;
        let id = self.next_id;
        self.heap.push(Timer { id, at, binding_id, signal_id, context });
        self.live.insert(id);
        id
    }

    #[inline]
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.live.remove(&id)
    }

    /// Deadline of the earliest timer still pending.
    pub fn next_deadline(&mut self) -> Option<TimestampMillis> {
        while let Some(t) = self.heap.peek() {
            if self.live.contains(&t.id) {
                return Some(t.at);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every timer due at `now`, in deadline order.
    pub fn expired(&mut self, now: TimestampMillis) -> Vec<Timer> {
        let mut fired = Vec::new();
        while self.heap.peek().map(|t| t.at <= now).unwrap_or(false) {
            if let Some(t) = self.heap.pop() {
                if self.live.remove(&t.id) {
                    fired.push(t);
                }
            }
        }
        fired
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
