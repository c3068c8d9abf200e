//! # Host Backend
//!
//! System-RAM implementation of the device-memory primitive interface.
//!
//! `HostBackend` enforces heap budgets and allocation-count limits the way a
//! driver would, backs host-visible memory with real host allocations so
//! mapped pointers can be written and read, and supports failure injection.
//! It drives the allocator in headless runs and in tests.

use alloc::boxed::Box;
use alloc::vec;
use core::ptr::NonNull;

use arrayvec::ArrayVec;
use hashbrown::HashMap;
use spin::Mutex;

use crate::error::PrimitiveError;
use crate::memory::{
    DeviceLimits, MemoryHeapFlags, MemoryProperties, MemoryPropertyFlags, MAX_MEMORY_HEAPS,
};
use crate::traits::{DeviceMemoryBackend, PrimitiveAllocateInfo};
use crate::types::DeviceMemoryHandle;

// =============================================================================
// STATISTICS
// =============================================================================

/// Counters of primitive calls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostBackendStats {
    /// Successful allocations
    pub allocate_calls: u64,
    /// Failed allocations (budget, limit or injected)
    pub failed_allocations: u64,
    /// Frees
    pub free_calls: u64,
    /// Map calls
    pub map_calls: u64,
    /// Flush calls
    pub flush_calls: u64,
    /// Invalidate calls
    pub invalidate_calls: u64,
}

// =============================================================================
// HOST BACKEND
// =============================================================================

#[derive(Debug)]
struct HostObject {
    size: u64,
    heap_index: u32,
    flags: MemoryPropertyFlags,
    storage: Option<Box<[u8]>>,
}

#[derive(Debug)]
struct HostState {
    next_handle: u64,
    objects: HashMap<DeviceMemoryHandle, HostObject>,
    heap_used: ArrayVec<u64, MAX_MEMORY_HEAPS>,
    inject_failures: u32,
    stats: HostBackendStats,
}

/// Device-memory primitives simulated in system RAM
#[derive(Debug)]
pub struct HostBackend {
    properties: MemoryProperties,
    limits: DeviceLimits,
    state: Mutex<HostState>,
}

impl HostBackend {
    /// Create a backend exposing the given tables
    pub fn new(properties: MemoryProperties, limits: DeviceLimits) -> Self {
        let heap_used = properties.heaps().iter().map(|_| 0).collect();
        Self {
            properties,
            limits,
            state: Mutex::new(HostState {
                next_handle: 1,
                objects: HashMap::new(),
                heap_used,
                inject_failures: 0,
                stats: HostBackendStats::default(),
            }),
        }
    }

    /// Typical discrete-GPU layout.
    ///
    /// | type | heap | flags |
    /// |------|------|-------|
    /// | 0 | 0 | device-local |
    /// | 1 | 1 | host-visible, coherent |
    /// | 2 | 1 | host-visible, coherent, cached |
    /// | 3 | 0 | device-local, host-visible, coherent |
    pub fn discrete(device_bytes: u64, host_bytes: u64) -> Self {
        let mut props = MemoryProperties::new();
        let vram = props.push_heap(device_bytes, MemoryHeapFlags::DEVICE_LOCAL);
        let sys = props.push_heap(host_bytes, MemoryHeapFlags::empty());
        if let (Some(vram), Some(sys)) = (vram, sys) {
            let visible = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;
            props.push_type(vram, MemoryPropertyFlags::DEVICE_LOCAL);
            props.push_type(sys, visible);
            props.push_type(sys, visible | MemoryPropertyFlags::HOST_CACHED);
            props.push_type(vram, visible | MemoryPropertyFlags::DEVICE_LOCAL);
        }
        Self::new(props, DeviceLimits::default())
    }

    /// Make the next `count` allocations fail with `OutOfDeviceMemory`
    pub fn fail_next_allocations(&self, count: u32) {
        self.state.lock().inject_failures = count;
    }

    /// Snapshot of call counters
    pub fn stats(&self) -> HostBackendStats {
        self.state.lock().stats.clone()
    }

    /// Number of live raw allocations
    pub fn live_allocations(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Bytes currently allocated from a heap
    pub fn heap_used(&self, heap_index: u32) -> u64 {
        self.state
            .lock()
            .heap_used
            .get(heap_index as usize)
            .copied()
            .unwrap_or(0)
    }
}

impl DeviceMemoryBackend for HostBackend {
    fn memory_properties(&self) -> MemoryProperties {
        self.properties.clone()
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn allocate(&self, info: &PrimitiveAllocateInfo) -> Result<DeviceMemoryHandle, PrimitiveError> {
        let memory_type = self
            .properties
            .memory_type(info.memory_type_index)
            .copied()
            .ok_or(PrimitiveError::InvalidHandle)?;
        let heap = self
            .properties
            .heap(memory_type.heap_index)
            .copied()
            .ok_or(PrimitiveError::InvalidHandle)?;

        let mut state = self.state.lock();

        if state.inject_failures > 0 {
            state.inject_failures -= 1;
            state.stats.failed_allocations += 1;
            return Err(PrimitiveError::OutOfDeviceMemory);
        }
        if state.objects.len() as u32 >= self.limits.max_allocation_count {
            state.stats.failed_allocations += 1;
            return Err(PrimitiveError::TooManyObjects);
        }

        let used = state.heap_used[heap.index as usize];
        if info.size == 0 || used.saturating_add(info.size) > heap.size {
            state.stats.failed_allocations += 1;
            return Err(if heap.flags.contains(MemoryHeapFlags::DEVICE_LOCAL) {
                PrimitiveError::OutOfDeviceMemory
            } else {
                PrimitiveError::OutOfHostMemory
            });
        }

        let handle = DeviceMemoryHandle::new(state.next_handle);
        state.next_handle += 1;
        state.heap_used[heap.index as usize] = used + info.size;
        state.objects.insert(
            handle,
            HostObject {
                size: info.size,
                heap_index: heap.index,
                flags: memory_type.flags,
                storage: None,
            },
        );
        state.stats.allocate_calls += 1;
        Ok(handle)
    }

    fn free(&self, handle: DeviceMemoryHandle) {
        let mut state = self.state.lock();
        match state.objects.remove(&handle) {
            Some(object) => {
                state.heap_used[object.heap_index as usize] -= object.size;
                state.stats.free_calls += 1;
            }
            None => log::error!("host backend: free of unknown {:?}", handle),
        }
    }

    fn map(
        &self,
        handle: DeviceMemoryHandle,
        offset: u64,
        size: u64,
    ) -> Result<NonNull<u8>, PrimitiveError> {
        let mut state = self.state.lock();
        state.stats.map_calls += 1;
        let object = state
            .objects
            .get_mut(&handle)
            .ok_or(PrimitiveError::InvalidHandle)?;

        if !object.flags.is_mappable() || offset.saturating_add(size) > object.size {
            return Err(PrimitiveError::MapFailed);
        }

        let len = object.size as usize;
        let storage = object
            .storage
            .get_or_insert_with(|| vec![0u8; len].into_boxed_slice());
        NonNull::new(storage[offset as usize..].as_mut_ptr()).ok_or(PrimitiveError::MapFailed)
    }

    fn unmap(&self, handle: DeviceMemoryHandle) {
        // Storage stays alive until free so stale pointers do not dangle mid-test.
        if !self.state.lock().objects.contains_key(&handle) {
            log::error!("host backend: unmap of unknown {:?}", handle);
        }
    }

    fn flush_range(
        &self,
        handle: DeviceMemoryHandle,
        offset: u64,
        size: u64,
    ) -> Result<(), PrimitiveError> {
        let mut state = self.state.lock();
        state.stats.flush_calls += 1;
        let object = state.objects.get(&handle).ok_or(PrimitiveError::InvalidHandle)?;
        if offset.saturating_add(size) > object.size {
            return Err(PrimitiveError::InvalidHandle);
        }
        Ok(())
    }

    fn invalidate_range(
        &self,
        handle: DeviceMemoryHandle,
        offset: u64,
        size: u64,
    ) -> Result<(), PrimitiveError> {
        let mut state = self.state.lock();
        state.stats.invalidate_calls += 1;
        let object = state.objects.get(&handle).ok_or(PrimitiveError::InvalidHandle)?;
        if offset.saturating_add(size) > object.size {
            return Err(PrimitiveError::InvalidHandle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(size: u64, memory_type_index: u32) -> PrimitiveAllocateInfo {
        PrimitiveAllocateInfo {
            size,
            memory_type_index,
            priority: 0.5,
            dedicated: false,
        }
    }

    #[test]
    fn test_heap_budget_enforced() {
        let backend = HostBackend::discrete(4096, 4096);
        let a = backend.allocate(&info(3072, 0)).unwrap();
        assert_eq!(
            backend.allocate(&info(2048, 0)),
            Err(PrimitiveError::OutOfDeviceMemory)
        );
        backend.free(a);
        assert_eq!(backend.heap_used(0), 0);
        assert!(backend.allocate(&info(2048, 0)).is_ok());
    }

    #[test]
    fn test_map_requires_host_visible() {
        let backend = HostBackend::discrete(1 << 20, 1 << 20);
        let device = backend.allocate(&info(256, 0)).unwrap();
        let host = backend.allocate(&info(256, 1)).unwrap();
        assert_eq!(backend.map(device, 0, 256), Err(PrimitiveError::MapFailed));

        let ptr = backend.map(host, 0, 256).unwrap();
        // SAFETY: the mapping covers 256 bytes and the object is live
        unsafe {
            ptr.as_ptr().write(0xAB);
            assert_eq!(ptr.as_ptr().read(), 0xAB);
        }
    }

    #[test]
    fn test_failure_injection() {
        let backend = HostBackend::discrete(1 << 20, 1 << 20);
        backend.fail_next_allocations(1);
        assert!(backend.allocate(&info(64, 0)).is_err());
        assert!(backend.allocate(&info(64, 0)).is_ok());
        let stats = backend.stats();
        assert_eq!(stats.failed_allocations, 1);
        assert_eq!(stats.allocate_calls, 1);
    }
}
