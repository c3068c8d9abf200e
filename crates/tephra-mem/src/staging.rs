//! # Staging Buffer Manager
//!
//! Reusable host-visible transfer buffers for upload paths.
//!
//! ```text
//! acquire ──► [caller fills, submits copy] ──► release(seq)
//!    ▲                                             │
//!    │                                             ▼
//!  free list ◄──── process(completed) ◄──── in flight (fence)
//!    │
//!    └── destroyed after `retention_epochs` unused
//! ```

use alloc::vec::Vec;

use spin::Mutex;

use tephra_core::{AllocationCategory, DeviceMemoryBackend, ResourceShape, Result};

use crate::config::StagingConfig;
use crate::device::DeviceMemoryManager;
use crate::fence::{FenceId, FenceManager};
use crate::heap::{ResourceHeap, ResourceRequest};
use crate::suballoc::SubAllocation;

#[derive(Debug)]
struct RetainedBuffer {
    buffer: SubAllocation,
    since: u64,
}

#[derive(Debug)]
struct InFlightBuffer {
    buffer: SubAllocation,
    fence: FenceId,
}

/// Staging counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingStats {
    /// Buffers ever created
    pub created: u64,
    /// Acquisitions served from the free list
    pub reused: u64,
    /// Buffers destroyed
    pub destroyed: u64,
    /// Buffers waiting on the GPU
    pub in_flight: usize,
    /// Buffers ready for reuse
    pub free: usize,
    /// Bytes held by in-flight and free buffers
    pub held_bytes: u64,
}

/// Outcome of one processing pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingPass {
    /// Buffers moved back to the free list
    pub recycled: usize,
    /// Buffers destroyed after retention
    pub destroyed: usize,
}

#[derive(Debug, Default)]
struct StagingState {
    free: Vec<RetainedBuffer>,
    in_flight: Vec<InFlightBuffer>,
    epoch: u64,
    created: u64,
    reused: u64,
    destroyed: u64,
}

/// Pool of host-visible transfer buffers
#[derive(Debug)]
pub struct StagingBufferManager {
    config: StagingConfig,
    state: Mutex<StagingState>,
}

impl StagingBufferManager {
    /// Create an empty pool
    pub fn new(config: StagingConfig) -> Self {
        Self {
            config,
            state: Mutex::new(StagingState::default()),
        }
    }

    /// Get a staging buffer of exactly `size` bytes from `heap`
    pub fn acquire<B: DeviceMemoryBackend>(
        &self,
        size: u64,
        heap: &ResourceHeap,
        device: &DeviceMemoryManager<B>,
    ) -> Result<SubAllocation> {
        {
            let mut state = self.state.lock();
            if let Some(i) = state.free.iter().position(|r| r.buffer.size() == size) {
                state.reused += 1;
                return Ok(state.free.swap_remove(i).buffer);
            }
        }

        let buffer = heap.allocate(
            &ResourceRequest {
                size,
                alignment: self.config.alignment,
                shape: ResourceShape::Buffer,
                category: AllocationCategory::Staging,
                tag: "staging buffer",
                owner: 0,
                priority: None,
            },
            device,
        )?;
        self.state.lock().created += 1;
        Ok(buffer)
    }

    /// Park a buffer until `sequence` completes
    pub fn release(&self, buffer: SubAllocation, sequence: u64, fences: &FenceManager) {
        let fence = fences.acquire(sequence);
        self.state.lock().in_flight.push(InFlightBuffer { buffer, fence });
    }

    /// Recycle signaled buffers and destroy stale free ones
    pub fn process<B: DeviceMemoryBackend>(
        &self,
        completed: u64,
        epoch: u64,
        fences: &FenceManager,
        heap: &ResourceHeap,
        device: &DeviceMemoryManager<B>,
    ) -> StagingPass {
        let retention = self.config.retention_epochs;
        let mut pass = StagingPass::default();
        let expired = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.epoch = epoch;

            let mut i = 0;
            while i < state.in_flight.len() {
                let fence = state.in_flight[i].fence;
                if !fences.is_signaled(fence, completed).unwrap_or(true) {
                    i += 1;
                    continue;
                }
                let done = state.in_flight.swap_remove(i);
                if let Err(e) = fences.release(done.fence) {
                    log::warn!("staging: fence release failed: {}", e);
                }
                state.free.push(RetainedBuffer {
                    buffer: done.buffer,
                    since: epoch,
                });
                pass.recycled += 1;
            }

            let mut expired = Vec::new();
            let mut i = 0;
            while i < state.free.len() {
                if epoch.saturating_sub(state.free[i].since) < retention {
                    i += 1;
                } else {
                    expired.push(state.free.swap_remove(i).buffer);
                }
            }
            state.destroyed += expired.len() as u64;
            expired
        };

        pass.destroyed = expired.len();
        self.destroy(expired, heap, device);
        pass
    }

    /// Destroy every buffer; the GPU must be idle
    pub fn shutdown<B: DeviceMemoryBackend>(
        &self,
        fences: &FenceManager,
        heap: &ResourceHeap,
        device: &DeviceMemoryManager<B>,
    ) -> usize {
        let buffers: Vec<SubAllocation> = {
            let mut state = self.state.lock();
            let in_flight: Vec<_> = state.in_flight.drain(..).collect();
            let mut buffers: Vec<_> = state.free.drain(..).map(|r| r.buffer).collect();
            for parked in in_flight {
                let _ = fences.release(parked.fence);
                buffers.push(parked.buffer);
            }
            state.destroyed += buffers.len() as u64;
            buffers
        };
        let count = buffers.len();
        self.destroy(buffers, heap, device);
        count
    }

    fn destroy<B: DeviceMemoryBackend>(
        &self,
        buffers: Vec<SubAllocation>,
        heap: &ResourceHeap,
        device: &DeviceMemoryManager<B>,
    ) {
        for buffer in buffers {
            let size = buffer.size();
            if let Err(e) = heap.free(buffer.into_id(), device) {
                log::error!("staging: failed to free {} byte buffer: {}", size, e);
            }
        }
    }

    /// Counters
    pub fn stats(&self) -> StagingStats {
        let state = self.state.lock();
        StagingStats {
            created: state.created,
            reused: state.reused,
            destroyed: state.destroyed,
            in_flight: state.in_flight.len(),
            free: state.free.len(),
            held_bytes: state
                .in_flight
                .iter()
                .map(|b| b.buffer.size())
                .chain(state.free.iter().map(|r| r.buffer.size()))
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AllocatorConfig, PageSizePolicy};
    use tephra_core::HostBackend;

    struct Fixture {
        device: DeviceMemoryManager<HostBackend>,
        heap: ResourceHeap,
        fences: FenceManager,
        staging: StagingBufferManager,
    }

    fn fixture() -> Fixture {
        let config = AllocatorConfig::desktop().with_page_size(PageSizePolicy::fixed(1 << 16));
        Fixture {
            device: DeviceMemoryManager::new(HostBackend::discrete(1 << 20, 1 << 20)),
            heap: ResourceHeap::new(1, 1 << 20, &config),
            fences: FenceManager::new(),
            staging: StagingBufferManager::new(StagingConfig::default()),
        }
    }

    #[test]
    fn test_buffer_mapped_and_tagged() {
        let f = fixture();
        let buffer = f.staging.acquire(4096, &f.heap, &f.device).unwrap();
        assert!(buffer.mapped_ptr().is_some());
        assert_eq!(buffer.category(), AllocationCategory::Staging);
        assert_eq!(buffer.offset() % 256, 0);
        f.staging.release(buffer, 1, &f.fences);
        f.staging.shutdown(&f.fences, &f.heap, &f.device);
        f.heap.release_retained(&f.device);
    }

    #[test]
    fn test_reuse_waits_for_fence() {
        let f = fixture();
        let buffer = f.staging.acquire(4096, &f.heap, &f.device).unwrap();
        let offset = buffer.offset();
        f.staging.release(buffer, 5, &f.fences);

        let pass = f.staging.process(4, 0, &f.fences, &f.heap, &f.device);
        assert_eq!(pass.recycled, 0);
        // Submission 5 itself may still be reading the buffer
        let pass = f.staging.process(5, 0, &f.fences, &f.heap, &f.device);
        assert_eq!(pass.recycled, 0);
        assert_eq!(f.staging.stats().in_flight, 1);

        let pass = f.staging.process(6, 1, &f.fences, &f.heap, &f.device);
        assert_eq!(pass.recycled, 1);
        assert_eq!(f.fences.stats().in_use, 0);

        // Only an identical size is reused
        let other = f.staging.acquire(2048, &f.heap, &f.device).unwrap();
        let again = f.staging.acquire(4096, &f.heap, &f.device).unwrap();
        assert_eq!(again.offset(), offset);
        assert_eq!(f.staging.stats().reused, 1);

        f.staging.release(other, 6, &f.fences);
        f.staging.release(again, 6, &f.fences);
        assert_eq!(f.staging.shutdown(&f.fences, &f.heap, &f.device), 2);
        f.heap.release_retained(&f.device);
    }

    #[test]
    fn test_free_buffers_expire() {
        let f = fixture();
        let buffer = f.staging.acquire(1024, &f.heap, &f.device).unwrap();
        f.staging.release(buffer, 1, &f.fences);
        f.staging.process(2, 10, &f.fences, &f.heap, &f.device);
        assert_eq!(f.staging.stats().free, 1);

        let pass = f.staging.process(2, 17, &f.fences, &f.heap, &f.device);
        assert_eq!(pass.destroyed, 0);
        let pass = f.staging.process(2, 18, &f.fences, &f.heap, &f.device);
        assert_eq!(pass.destroyed, 1);
        assert_eq!(f.heap.stats().live_allocations, 0);
        f.heap.release_retained(&f.device);
    }
}
