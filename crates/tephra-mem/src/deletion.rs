//! # Deferred Deletion Queue
//!
//! Holds free requests until the GPU has finished every batch that could
//! still reference the resource.
//!
//! A ticket recorded with sequence `s` is released by the first
//! [`DeferredDeletionQueue::tick`] whose completed value is strictly greater
//! than `s`, and never before.

use alloc::vec::Vec;
use core::hash::Hash;

use hashbrown::HashSet;
use spin::Mutex;

use tephra_core::{Error, Result};

/// A pending free
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionTicket<K> {
    /// Resource being freed
    pub key: K,
    /// Last submission that may use the resource
    pub sequence: u64,
}

/// Queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletionStats {
    /// Tickets waiting
    pub pending: usize,
    /// Tickets ever enqueued
    pub enqueued: u64,
    /// Tickets handed back by `tick`
    pub retired: u64,
    /// Tickets handed back by a forced drain
    pub forced: u64,
    /// Duplicate enqueues rejected
    pub rejected: u64,
}

#[derive(Debug)]
struct QueueState<K> {
    tickets: Vec<DeletionTicket<K>>,
    keys: HashSet<K>,
    stats: DeletionStats,
}

/// Sequence-gated free queue
#[derive(Debug)]
pub struct DeferredDeletionQueue<K> {
    state: Mutex<QueueState<K>>,
}

impl<K: Copy + Eq + Hash + core::fmt::Debug> DeferredDeletionQueue<K> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                tickets: Vec::new(),
                keys: HashSet::new(),
                stats: DeletionStats::default(),
            }),
        }
    }

    /// Queue a free that must wait for `sequence` to complete.
    ///
    /// Enqueuing a key that is already waiting is a double free.
    pub fn enqueue(&self, key: K, sequence: u64) -> Result<()> {
        let mut state = self.state.lock();
        if !state.keys.insert(key) {
            state.stats.rejected += 1;
            log::error!("{}: {:?} is already queued for deletion", Error::DoubleFree, key);
            return Err(Error::DoubleFree);
        }
        state.tickets.push(DeletionTicket { key, sequence });
        state.stats.enqueued += 1;
        Ok(())
    }

    /// Hand back every ticket with `sequence < completed`
    pub fn tick(&self, completed: u64) -> Vec<DeletionTicket<K>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut ready = Vec::new();
        state.tickets.retain(|ticket| {
            if ticket.sequence < completed {
                ready.push(*ticket);
                false
            } else {
                true
            }
        });
        for ticket in &ready {
            state.keys.remove(&ticket.key);
        }
        state.stats.retired += ready.len() as u64;
        ready
    }

    /// Hand back every ticket regardless of sequence
    pub fn drain_all(&self) -> Vec<DeletionTicket<K>> {
        let mut state = self.state.lock();
        state.keys.clear();
        let drained: Vec<_> = state.tickets.drain(..).collect();
        state.stats.forced += drained.len() as u64;
        drained
    }

    /// Check if a key is waiting
    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().keys.contains(key)
    }

    /// Tickets waiting
    pub fn len(&self) -> usize {
        self.state.lock().tickets.len()
    }

    /// Nothing waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest sequence still waiting
    pub fn oldest_sequence(&self) -> Option<u64> {
        self.state.lock().tickets.iter().map(|t| t.sequence).min()
    }

    /// Counters
    pub fn stats(&self) -> DeletionStats {
        let state = self.state.lock();
        DeletionStats {
            pending: state.tickets.len(),
            ..state.stats
        }
    }
}

impl<K: Copy + Eq + Hash + core::fmt::Debug> Default for DeferredDeletionQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_waits_for_completion() {
        let queue = DeferredDeletionQueue::new();
        // Completed sequence is 8 when the free is requested
        queue.enqueue(1u32, 10).unwrap();

        assert!(queue.tick(8).is_empty());
        assert!(queue.tick(9).is_empty());
        assert!(queue.tick(10).is_empty());
        assert!(queue.contains(&1));

        let freed = queue.tick(11);
        assert_eq!(freed, [DeletionTicket { key: 1, sequence: 10 }]);
        assert!(queue.tick(12).is_empty());
        assert_eq!(queue.stats().retired, 1);
    }

    #[test]
    fn test_double_enqueue_rejected() {
        let queue = DeferredDeletionQueue::new();
        queue.enqueue(7u32, 3).unwrap();
        assert_eq!(queue.enqueue(7, 4), Err(Error::DoubleFree));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().rejected, 1);

        // Once retired the key may be queued again
        assert_eq!(queue.tick(4).len(), 1);
        queue.enqueue(7, 5).unwrap();
    }

    #[test]
    fn test_out_of_order_sequences() {
        let queue = DeferredDeletionQueue::new();
        queue.enqueue(1u32, 5).unwrap();
        queue.enqueue(2, 2).unwrap();
        queue.enqueue(3, 9).unwrap();
        assert_eq!(queue.oldest_sequence(), Some(2));

        let freed: Vec<u32> = queue.tick(6).iter().map(|t| t.key).collect();
        assert_eq!(freed, [1, 2]);
        assert_eq!(queue.oldest_sequence(), Some(9));
    }

    #[test]
    fn test_forced_drain_ignores_sequence() {
        let queue = DeferredDeletionQueue::new();
        queue.enqueue(1u32, 100).unwrap();
        queue.enqueue(2, 200).unwrap();
        assert_eq!(queue.drain_all().len(), 2);
        assert!(queue.is_empty());
        assert!(!queue.contains(&1));
        assert_eq!(queue.stats().forced, 2);
    }
}
