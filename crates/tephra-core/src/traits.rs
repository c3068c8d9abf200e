//! # Tephra Core Traits
//!
//! The two external seams of the allocator.
//!
//! ```text
//! DeviceMemoryBackend            SubmissionTimeline
//!    │  allocate / free             │  last_submitted
//!    │  map / unmap                 │  last_completed
//!    │  flush / invalidate          │
//!    ▼                              ▼
//! DeviceMemoryManager        DeferredDeletionQueue
//! ```

use core::ptr::NonNull;

use crate::error::PrimitiveError;
use crate::memory::{DeviceLimits, MemoryProperties};
use crate::types::DeviceMemoryHandle;

// =============================================================================
// DEVICE MEMORY PRIMITIVES
// =============================================================================

/// Raw allocation request passed to the primitive interface
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrimitiveAllocateInfo {
    /// Size in bytes
    pub size: u64,
    /// Memory type index
    pub memory_type_index: u32,
    /// Residency priority hint in `[0, 1]`
    pub priority: f32,
    /// Allocation backs a single resource
    pub dedicated: bool,
}

/// Device-memory primitive interface.
///
/// Implementations wrap the driver. Every method maps onto one driver call and
/// may block only inside that call.
pub trait DeviceMemoryBackend: Send + Sync {
    /// Heap and memory type tables
    fn memory_properties(&self) -> MemoryProperties;

    /// Device limits
    fn limits(&self) -> DeviceLimits;

    /// Allocate raw device memory
    fn allocate(&self, info: &PrimitiveAllocateInfo) -> Result<DeviceMemoryHandle, PrimitiveError>;

    /// Free raw device memory
    fn free(&self, handle: DeviceMemoryHandle);

    /// Map a range into the host address space
    fn map(
        &self,
        handle: DeviceMemoryHandle,
        offset: u64,
        size: u64,
    ) -> Result<NonNull<u8>, PrimitiveError>;

    /// Release a mapping
    fn unmap(&self, handle: DeviceMemoryHandle);

    /// Make host writes visible to the device
    fn flush_range(
        &self,
        handle: DeviceMemoryHandle,
        offset: u64,
        size: u64,
    ) -> Result<(), PrimitiveError>;

    /// Make device writes visible to the host
    fn invalidate_range(
        &self,
        handle: DeviceMemoryHandle,
        offset: u64,
        size: u64,
    ) -> Result<(), PrimitiveError>;
}

// =============================================================================
// SUBMISSION TIMELINE
// =============================================================================

/// Monotonic submission sequence numbers issued by the scheduling layer
pub trait SubmissionTimeline: Send + Sync {
    /// Sequence number of the most recent submitted batch
    fn last_submitted(&self) -> u64;

    /// Sequence number of the most recent batch the device has finished
    fn last_completed(&self) -> u64;
}
