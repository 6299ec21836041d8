//! Timer heap
//!
//! Min-heap of pending expiries keyed by `(due, seq)`. Stopping or restarting
//! a timer does not touch the heap; the old entry simply goes stale because
//! its sequence no longer matches the timer's current one.

use crate::handle::HandleId;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Entry in the timer heap
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerEntry {
    /// Loop time (ms) at which the timer expires
    pub due: u64,
    /// Start order, breaks ties between equal due times
    pub seq: u64,
    /// Timer handle
    pub id: HandleId,
}

// Reverse ordering for min-heap (earliest due time first)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

#[derive(Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerHeap {
    /// Schedule `id` at `due`; returns the sequence number of the new entry
    pub(crate) fn schedule(&mut self, id: HandleId, due: u64) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry { due, seq, id });
        seq
    }

    /// Pop every entry due at or before `now`, earliest first. Stale entries
    /// are included; the caller validates them against the timer state.
    pub(crate) fn pop_expired(&mut self, now: u64) -> Vec<TimerEntry> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.due > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                expired.push(entry);
            }
        }
        expired
    }

    /// Put popped entries back unchanged, sequence numbers included
    pub(crate) fn requeue(&mut self, entries: impl IntoIterator<Item = TimerEntry>) {
        self.heap.extend(entries);
    }

    /// Earliest due time among live entries. `is_live` filters out stale
    /// entries, which are discarded from the top of the heap as they are met.
    pub(crate) fn next_due(&mut self, is_live: impl Fn(&TimerEntry) -> bool) -> Option<u64> {
        while let Some(entry) = self.heap.peek() {
            if is_live(entry) {
                return Some(entry.due);
            }
            self.heap.pop();
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_orders_by_due_then_seq() {
        let mut heap = TimerHeap::default();
        let a = HandleId::next();
        let b = HandleId::next();
        let c = HandleId::next();
        heap.schedule(a, 30);
        heap.schedule(b, 10);
        heap.schedule(c, 10);

        let expired = heap.pop_expired(100);
        let order: Vec<HandleId> = expired.iter().map(|e| e.id).collect();
        assert_eq!(order, vec![b, c, a]);
        assert_eq!(heap.len(), 0);
    }

    #[test]
    fn test_heap_pop_expired_respects_now() {
        let mut heap = TimerHeap::default();
        let early = HandleId::next();
        let late = HandleId::next();
        heap.schedule(early, 5);
        heap.schedule(late, 50);

        assert!(heap.pop_expired(4).is_empty());
        let expired = heap.pop_expired(5);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, early);
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_heap_requeue_keeps_order_and_seq() {
        let mut heap = TimerHeap::default();
        let a = HandleId::next();
        let b = HandleId::next();
        let seq_a = heap.schedule(a, 3);
        let seq_b = heap.schedule(b, 3);

        let mut expired = heap.pop_expired(10).into_iter();
        assert_eq!(expired.next().map(|e| e.id), Some(a));
        heap.requeue(expired);

        let again = heap.pop_expired(10);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, b);
        assert_eq!(again[0].seq, seq_b);
        assert_ne!(seq_a, seq_b);
    }

    #[test]
    fn test_heap_next_due_discards_stale_entries() {
        let mut heap = TimerHeap::default();
        let id = HandleId::next();
        let stale_seq = heap.schedule(id, 1);
        let live_seq = heap.schedule(id, 20);
        assert_ne!(stale_seq, live_seq);

        let due = heap.next_due(|entry| entry.seq == live_seq);
        assert_eq!(due, Some(20));
        assert_eq!(heap.len(), 1);

        assert_eq!(heap.next_due(|_| false), None);
        assert_eq!(heap.len(), 0);
    }
}
