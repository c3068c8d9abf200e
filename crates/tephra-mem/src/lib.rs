//! # Tephra Memory
//!
//! Device memory allocator: pages from the device are carved into
//! sub-allocations, small transient buffers are pooled, frees wait for the
//! GPU to pass the last submission that used them, and a pressure
//! controller migrates image pages out of a full heap.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          MemoryManager                            │
//! │                                                                   │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌─────────────────────┐  │
//! │  │ ResourceHeap │  │ PooledBuffer     │  │ DeferredDeletion    │  │
//! │  │ (per type)   │  │ Allocator        │  │ Queue               │  │
//! │  └──────┬───────┘  └────────┬─────────┘  └─────────────────────┘  │
//! │         │                   │                                     │
//! │  ┌──────┴───────────────────┴───────┐  ┌───────────┐ ┌─────────┐  │
//! │  │ SubresourceAllocator (per page)  │  │ Staging + │ │Eviction │  │
//! │  │ first-fit free list              │  │ Fences    │ │Control  │  │
//! │  └──────────────┬───────────────────┘  └───────────┘ └─────────┘  │
//! │                 │                                                 │
//! │  ┌──────────────┴───────────────────────────────────────────────┐ │
//! │  │ DeviceMemoryManager (heap budgets, type selection, mapping)  │ │
//! │  └──────────────┬───────────────────────────────────────────────┘ │
//! └─────────────────┼─────────────────────────────────────────────────┘
//!                   ▼
//!        DeviceMemoryBackend (raw allocate / map / flush)
//! ```
//!
//! ## Lifetimes
//!
//! An allocation is `Allocated` until [`MemoryManager::free`] marks it
//! `FreePending` with the last submission sequence that used it. Once
//! [`MemoryManager::tick`] sees a completed value past that sequence the
//! range returns to its page. Empty pages are retained for a few epochs
//! before going back to the device.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod config;
pub mod deletion;
pub mod device;
pub mod eviction;
pub mod fence;
pub mod heap;
pub mod manager;
pub mod pool;
pub mod report;
pub mod staging;
pub mod suballoc;

// Re-exports for convenience
pub use config::{AllocatorConfig, EvictionConfig, PageSizePolicy, PoolConfig, StagingConfig};
pub use deletion::{DeferredDeletionQueue, DeletionStats, DeletionTicket};
pub use device::{
    DeviceMemoryAllocation, DeviceMemoryManager, DeviceMemoryStats, HeapUsage, MappedPtr,
    MemoryBinding, PageRequest,
};
pub use eviction::{
    EvictionCandidate, EvictionController, EvictionDecision, EvictionHandler, EvictionPolicy,
    EvictionStats, FirstEvictable, LargestFirst,
};
pub use fence::{FenceId, FenceManager, FenceStats};
pub use heap::{HeapStats, ResourceHeap, ResourceRequest};
pub use manager::{AllocationRequest, MemoryManager, TickReport};
pub use pool::{PoolRequest, PoolStats, PooledBufferAllocator};
pub use report::{MemoryReport, TeardownReport};
pub use staging::{StagingBufferManager, StagingPass, StagingStats};
pub use suballoc::{
    AllocationId, AllocationOrigin, FreeOutcome, FreeRange, LiveSubAllocation, PageState,
    PageStats, SlotStatus, SubAllocation, SubresourceAllocator,
};

pub use tephra_core::{AllocationCategory, Error, MemoryPropertyFlags, ResourceShape, Result};

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

static_assertions::assert_impl_all!(MemoryManager<tephra_core::HostBackend>: Send, Sync);
static_assertions::assert_impl_all!(ResourceHeap: Send, Sync);
static_assertions::assert_impl_all!(PooledBufferAllocator: Send, Sync);
static_assertions::assert_impl_all!(SubAllocation: Send, Sync);
static_assertions::assert_impl_all!(AllocationId: Send, Sync, Copy);
static_assertions::assert_not_impl_any!(SubAllocation: Clone, Copy);
