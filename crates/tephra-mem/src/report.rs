//! # Diagnostic Reports
//!
//! Point-in-time memory dump and the teardown summary.

use alloc::vec::Vec;
use core::fmt;

use tephra_core::{AllocationCategory, ByteSize};

use crate::deletion::DeletionStats;
use crate::device::{DeviceMemoryStats, HeapUsage};
use crate::eviction::EvictionStats;
use crate::fence::FenceStats;
use crate::heap::HeapStats;
use crate::pool::PoolStats;
use crate::staging::StagingStats;
use crate::suballoc::LiveSubAllocation;

#[cfg(feature = "metrics")]
use crate::suballoc::PageStats;

// =============================================================================
// MEMORY REPORT
// =============================================================================

/// Human-readable memory dump
#[derive(Debug, Clone)]
pub struct MemoryReport {
    /// Reclaim epoch at the time of the report
    pub epoch: u64,
    /// Device-level counters
    pub device: DeviceMemoryStats,
    /// Per-heap usage
    pub heaps: Vec<HeapUsage>,
    /// Per-memory-type page statistics
    pub memory_types: Vec<HeapStats>,
    /// Pooled buffer allocator
    pub pool: PoolStats,
    /// Deferred deletion queue
    pub deletion: DeletionStats,
    /// Fence pool
    pub fences: FenceStats,
    /// Staging buffers
    pub staging: StagingStats,
    /// Eviction controller
    pub eviction: EvictionStats,
    /// Every page, for fragmentation analysis
    #[cfg(feature = "metrics")]
    pub pages: Vec<PageStats>,
}

impl MemoryReport {
    /// Live bytes per category across heaps and the pool
    pub fn category_bytes(&self) -> [u64; AllocationCategory::COUNT] {
        let mut totals = self.pool.category_bytes;
        for stats in &self.memory_types {
            for (total, bytes) in totals.iter_mut().zip(stats.category_bytes) {
                *total += bytes;
            }
        }
        totals
    }

    /// Pages owned by heaps and the pool, retained ones included
    pub fn page_count(&self) -> usize {
        let heap_pages: usize = self
            .memory_types
            .iter()
            .map(|t| t.used_pages + t.retained_pages)
            .sum();
        heap_pages + self.pool.used_pages + self.pool.retained_pages
    }
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== device memory (epoch {}) ===", self.epoch)?;
        writeln!(
            f,
            "allocations: {} live, {} peak, {} limit ({} created, {} freed, {} failed)",
            self.device.allocation_count,
            self.device.peak_allocation_count,
            self.device.max_allocation_count,
            self.device.total_allocations,
            self.device.total_frees,
            self.device.failed_allocations
        )?;

        for heap in &self.heaps {
            writeln!(
                f,
                "heap {}: {} / {} ({:.1}%), peak {}, {} pages",
                heap.index,
                ByteSize::from_bytes(heap.used),
                ByteSize::from_bytes(heap.total),
                heap.fraction_used() * 100.0,
                ByteSize::from_bytes(heap.peak),
                heap.allocation_count
            )?;
        }

        for t in self.memory_types.iter().filter(|t| t.reserved_bytes > 0) {
            writeln!(
                f,
                "  type {}: {} pages ({} retained, {} dedicated, {} evicting), {} used of {}, {} allocations",
                t.memory_type_index,
                t.used_pages + t.retained_pages,
                t.retained_pages,
                t.dedicated_pages,
                t.evicting_pages,
                ByteSize::from_bytes(t.used_bytes),
                ByteSize::from_bytes(t.reserved_bytes),
                t.live_allocations
            )?;
        }

        writeln!(
            f,
            "pool: {} buckets, {} pages ({} retained), {} used of {}, {} allocations",
            self.pool.buckets,
            self.pool.used_pages + self.pool.retained_pages,
            self.pool.retained_pages,
            ByteSize::from_bytes(self.pool.used_bytes),
            ByteSize::from_bytes(self.pool.reserved_bytes),
            self.pool.live_allocations
        )?;

        write!(f, "categories:")?;
        for (category, bytes) in AllocationCategory::ALL.iter().zip(self.category_bytes()) {
            write!(f, " {}={}", category, ByteSize::from_bytes(bytes))?;
        }
        writeln!(f)?;

        writeln!(
            f,
            "deletion: {} pending ({} retired, {} forced, {} rejected)",
            self.deletion.pending, self.deletion.retired, self.deletion.forced, self.deletion.rejected
        )?;
        writeln!(
            f,
            "fences: {} in use, {} free, {} created",
            self.fences.in_use, self.fences.free, self.fences.created
        )?;
        writeln!(
            f,
            "staging: {} in flight, {} free, {} held",
            self.staging.in_flight,
            self.staging.free,
            ByteSize::from_bytes(self.staging.held_bytes)
        )?;
        writeln!(
            f,
            "eviction: {} ({:.1}% monitored), {} pages evicted, {} relocated, {} failed",
            if self.eviction.armed { "armed" } else { "cooling" },
            self.eviction.last_fraction * 100.0,
            self.eviction.pages_evicted,
            self.eviction.relocated,
            self.eviction.failed
        )?;

        #[cfg(feature = "metrics")]
        for page in &self.pages {
            writeln!(
                f,
                "  page {} type {}: {} live, {} free ranges, largest {}, fragmentation {:.2}",
                page.page,
                page.memory_type_index,
                page.live,
                page.free_ranges,
                ByteSize::from_bytes(page.largest_free),
                page.fragmentation
            )?;
        }
        Ok(())
    }
}

// =============================================================================
// TEARDOWN REPORT
// =============================================================================

/// Summary of [`MemoryManager::shutdown`](crate::MemoryManager::shutdown)
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    /// Deferred frees executed by the forced drain
    pub drained_deletions: usize,
    /// Staging buffers destroyed
    pub staging_destroyed: usize,
    /// Pages returned to the device
    pub pages_released: u64,
    /// Allocations still live at teardown
    pub leaks: Vec<LiveSubAllocation>,
}

impl TeardownReport {
    /// No leaks
    pub fn is_clean(&self) -> bool {
        self.leaks.is_empty()
    }

    /// Bytes still live at teardown
    pub fn leaked_bytes(&self) -> u64 {
        self.leaks.iter().map(|l| l.size).sum()
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "teardown: {} deferred frees drained, {} staging buffers destroyed, {} pages released, {} leaks ({})",
            self.drained_deletions,
            self.staging_destroyed,
            self.pages_released,
            self.leaks.len(),
            ByteSize::from_bytes(self.leaked_bytes())
        )
    }
}
