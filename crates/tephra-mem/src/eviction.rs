//! # Eviction Controller
//!
//! Backpressure on the monitored heap: when usage crosses the high-water
//! mark, one evictable image page has its allocations migrated to a
//! host-visible memory type on another heap.
//!
//! ```text
//!   fraction
//!      │        evict ┌──────── disarmed ────────┐
//! high ┼─────────────●┼──────────────────────────┼────
//!      │            ╱ │                          │
//! low  ┼───────────╱──┼──────────────────────────●──── re-armed
//!      │          ╱   │                           ╲
//! ```
//!
//! The controller only decides. [`MemoryManager`](crate::MemoryManager)
//! gathers candidates, allocates replacements and calls the
//! [`EvictionHandler`] without holding any allocator lock.

use alloc::boxed::Box;

use spin::Mutex;

use tephra_core::PageId;

use crate::config::EvictionConfig;
use crate::suballoc::{LiveSubAllocation, SubAllocation};

// =============================================================================
// POLICY
// =============================================================================

/// A page that may be evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    /// Page id
    pub page: PageId,
    /// Memory type of the page
    pub memory_type_index: u32,
    /// Bytes held by live allocations
    pub used_bytes: u64,
    /// Live allocations
    pub live: u32,
}

/// Chooses which page to evict
pub trait EvictionPolicy: Send + Sync {
    /// Index into `candidates` (registration order), or `None` to skip
    fn select(&self, candidates: &[EvictionCandidate]) -> Option<usize>;
}

/// First candidate in registration order
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstEvictable;

impl EvictionPolicy for FirstEvictable {
    fn select(&self, candidates: &[EvictionCandidate]) -> Option<usize> {
        (!candidates.is_empty()).then_some(0)
    }
}

/// Candidate holding the most live bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct LargestFirst;

impl EvictionPolicy for LargestFirst {
    fn select(&self, candidates: &[EvictionCandidate]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .max_by_key(|(i, c)| (c.used_bytes, core::cmp::Reverse(*i)))
            .map(|(i, _)| i)
    }
}

// =============================================================================
// HANDLER
// =============================================================================

/// Resource-owner callback that performs the migration
pub trait EvictionHandler: Send + Sync {
    /// Copy `victim` into `replacement` and rebind the resource.
    ///
    /// The handler only sees a snapshot of the victim. On success it keeps
    /// `replacement`, and the resource owner named by `victim.owner` later
    /// returns its old `SubAllocation` through `MemoryManager::free`, which
    /// drains the page. Returning the replacement signals failure; the
    /// allocator frees it and the victim stays where it is.
    fn relocate(
        &self,
        victim: &LiveSubAllocation,
        replacement: SubAllocation,
    ) -> core::result::Result<(), SubAllocation>;
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Decision of one evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EvictionDecision {
    /// Eviction disabled
    Disabled,
    /// Below the high-water mark
    Idle {
        /// Fraction measured
        fraction: f32,
    },
    /// Above the mark but disarmed until usage drops below low water
    Cooling {
        /// Fraction measured
        fraction: f32,
    },
    /// Evict one page
    Evict {
        /// Fraction measured
        fraction: f32,
    },
}

/// Eviction counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvictionStats {
    /// Passes evaluated
    pub passes: u64,
    /// Pages marked evicting
    pub pages_evicted: u64,
    /// Allocations handed to the handler and accepted
    pub relocated: u64,
    /// Replacements rejected or not allocatable
    pub failed: u64,
    /// Passes that wanted to evict but found nothing
    pub starved: u64,
    /// Armed state
    pub armed: bool,
    /// Last measured fraction
    pub last_fraction: f32,
}

#[derive(Debug)]
struct ControllerState {
    armed: bool,
    stats: EvictionStats,
}

/// High/low water hysteresis around a swappable page-selection policy
pub struct EvictionController {
    config: EvictionConfig,
    policy: Box<dyn EvictionPolicy>,
    state: Mutex<ControllerState>,
}

impl core::fmt::Debug for EvictionController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EvictionController")
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl EvictionController {
    /// Controller with the first-evictable policy
    pub fn new(config: EvictionConfig) -> Self {
        Self::with_policy(config, Box::new(FirstEvictable))
    }

    /// Controller with a custom policy
    pub fn with_policy(config: EvictionConfig, policy: Box<dyn EvictionPolicy>) -> Self {
        Self {
            config,
            policy,
            state: Mutex::new(ControllerState {
                armed: true,
                stats: EvictionStats {
                    armed: true,
                    ..EvictionStats::default()
                },
            }),
        }
    }

    /// Configuration
    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    /// Measure pressure and decide.
    ///
    /// `fraction = (used - pending) / total`. Re-arms once the fraction is
    /// below the low-water mark.
    pub fn evaluate(&self, used: u64, pending: u64, total: u64) -> EvictionDecision {
        if !self.config.enabled || total == 0 {
            return EvictionDecision::Disabled;
        }
        let fraction = (used.saturating_sub(pending) as f64 / total as f64) as f32;

        let mut state = self.state.lock();
        state.stats.passes += 1;
        state.stats.last_fraction = fraction;
        if !state.armed && fraction < self.config.low_water() {
            log::debug!("eviction re-armed at {:.3}", fraction);
            state.armed = true;
        }
        state.stats.armed = state.armed;

        if fraction <= self.config.high_water {
            EvictionDecision::Idle { fraction }
        } else if state.armed {
            EvictionDecision::Evict { fraction }
        } else {
            EvictionDecision::Cooling { fraction }
        }
    }

    /// Pick a page through the policy
    pub fn select(&self, candidates: &[EvictionCandidate]) -> Option<EvictionCandidate> {
        let choice = self
            .policy
            .select(candidates)
            .and_then(|i| candidates.get(i).copied());
        if choice.is_none() {
            self.state.lock().stats.starved += 1;
        }
        choice
    }

    /// Record a page marked evicting; disarms until low water
    pub fn record_eviction(&self, page: PageId, relocated: u64, failed: u64) {
        let mut state = self.state.lock();
        state.armed = false;
        state.stats.armed = false;
        state.stats.pages_evicted += 1;
        state.stats.relocated += relocated;
        state.stats.failed += failed;
        log::info!(
            "evicted page {}: {} allocations relocated, {} failed",
            page,
            relocated,
            failed
        );
    }

    /// Armed state
    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    /// Counters
    pub fn stats(&self) -> EvictionStats {
        self.state.lock().stats
    }
}
