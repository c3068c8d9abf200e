//! # Synchronization Primitives
//!
//! Host-side mirror of the device submission timeline.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::traits::SubmissionTimeline;

// =============================================================================
// TIMELINE
// =============================================================================

/// Submission timeline with monotonic sequence numbers.
///
/// The submission thread calls [`Timeline::submit`] once per batch of device
/// work. Completion is reported with [`Timeline::signal`] from whatever
/// observes the device (fence poll, interrupt, timeline semaphore readback).
/// Values never move backwards.
#[derive(Debug, Default)]
pub struct Timeline {
    /// Last issued sequence number
    submitted: AtomicU64,
    /// Last completed sequence number
    completed: AtomicU64,
}

impl Timeline {
    /// Create a timeline with nothing submitted
    pub const fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Issue the sequence number for a new batch
    pub fn submit(&self) -> u64 {
        self.submitted.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Report completion up to and including `value`
    pub fn signal(&self, value: u64) {
        self.completed.fetch_max(value, Ordering::AcqRel);
    }

    /// Check if `value` has completed
    pub fn is_reached(&self, value: u64) -> bool {
        self.completed.load(Ordering::Acquire) >= value
    }

    /// Number of batches submitted but not yet completed
    pub fn in_flight(&self) -> u64 {
        let submitted = self.submitted.load(Ordering::Acquire);
        submitted.saturating_sub(self.completed.load(Ordering::Acquire))
    }
}

impl SubmissionTimeline for Timeline {
    fn last_submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    fn last_completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_and_signal() {
        let timeline = Timeline::new();
        assert_eq!(timeline.submit(), 1);
        assert_eq!(timeline.submit(), 2);
        assert_eq!(timeline.in_flight(), 2);

        timeline.signal(1);
        assert!(timeline.is_reached(1));
        assert!(!timeline.is_reached(2));
        assert_eq!(timeline.last_completed(), 1);
    }

    #[test]
    fn test_signal_is_monotonic() {
        let timeline = Timeline::new();
        timeline.signal(5);
        timeline.signal(3);
        assert_eq!(timeline.last_completed(), 5);
    }
}
