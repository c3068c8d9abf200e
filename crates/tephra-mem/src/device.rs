//! # Device Memory Manager
//!
//! Bookkeeping around the raw allocate/free primitives: per-heap usage,
//! the global allocation count, memory type selection and leak tracking.

use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use arrayvec::ArrayVec;
use hashbrown::HashMap;
use spin::Mutex;

use tephra_core::{
    DeviceLimits, DeviceMemoryBackend, DeviceMemoryHandle, Error, MemoryProperties,
    MemoryPropertyFlags, PageId, PrimitiveAllocateInfo, Result, MAX_MEMORY_HEAPS,
    MAX_MEMORY_TYPES,
};

// =============================================================================
// MAPPED POINTER
// =============================================================================

/// Host address of a persistently mapped page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

impl MappedPtr {
    /// Raw pointer
    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Non-null pointer
    #[inline]
    pub fn as_non_null(self) -> NonNull<u8> {
        self.0
    }

    /// Pointer `bytes` past this one
    #[inline]
    pub(crate) fn offset(self, bytes: u64) -> Option<MappedPtr> {
        NonNull::new(self.0.as_ptr().wrapping_add(bytes as usize)).map(MappedPtr)
    }
}

// SAFETY: the pointer is only an address into a mapping owned by the page;
// access synchronization is the responsibility of the allocation owner.
unsafe impl Send for MappedPtr {}
// SAFETY: see above
unsafe impl Sync for MappedPtr {}

// =============================================================================
// MEMORY BINDING
// =============================================================================

/// Everything needed to bind, map or flush a range of one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBinding {
    /// Raw device memory handle
    pub handle: DeviceMemoryHandle,
    /// Page the handle backs
    pub page: PageId,
    /// Memory type index
    pub memory_type_index: u32,
    /// Capability flags of the memory type
    pub flags: MemoryPropertyFlags,
    /// Page size in bytes
    pub page_size: u64,
    /// Base of the persistent mapping
    pub mapped: Option<MappedPtr>,
}

// =============================================================================
// RAW ALLOCATION
// =============================================================================

/// Raw page request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageRequest {
    /// Size in bytes
    pub size: u64,
    /// Memory type index
    pub memory_type_index: u32,
    /// Residency priority hint
    pub priority: f32,
    /// Page backs exactly one resource
    pub dedicated: bool,
    /// Creation site, kept for leak reports
    pub tag: &'static str,
}

/// One raw device allocation ("page")
///
/// Owned by exactly one sub-allocator and returned to
/// [`DeviceMemoryManager::free`] by value.
#[derive(Debug)]
pub struct DeviceMemoryAllocation {
    binding: MemoryBinding,
    heap_index: u32,
    dedicated: bool,
    priority: f32,
    tag: &'static str,
}

impl DeviceMemoryAllocation {
    /// Raw handle
    pub fn handle(&self) -> DeviceMemoryHandle {
        self.binding.handle
    }

    /// Page id
    pub fn page_id(&self) -> PageId {
        self.binding.page
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.binding.page_size
    }

    /// Memory type index
    pub fn memory_type_index(&self) -> u32 {
        self.binding.memory_type_index
    }

    /// Heap index
    pub fn heap_index(&self) -> u32 {
        self.heap_index
    }

    /// Capability flags
    pub fn flags(&self) -> MemoryPropertyFlags {
        self.binding.flags
    }

    /// Persistent mapping, if host-visible
    pub fn mapped_ptr(&self) -> Option<MappedPtr> {
        self.binding.mapped
    }

    /// Host-coherent memory
    pub fn is_coherent(&self) -> bool {
        self.binding.flags.contains(MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Host-cached memory
    pub fn is_cached(&self) -> bool {
        self.binding.flags.contains(MemoryPropertyFlags::HOST_CACHED)
    }

    /// Backs exactly one resource
    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    /// Residency priority the page was requested with
    pub fn priority(&self) -> f32 {
        self.priority
    }

    /// Creation site
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Binding info
    pub fn binding(&self) -> MemoryBinding {
        self.binding
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Usage of one device heap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapUsage {
    /// Heap index
    pub index: u32,
    /// Heap size
    pub total: u64,
    /// Bytes allocated
    pub used: u64,
    /// High water mark
    pub peak: u64,
    /// Live raw allocations
    pub allocation_count: u32,
}

impl HeapUsage {
    /// Fraction of the heap in use
    pub fn fraction_used(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            (self.used as f64 / self.total as f64) as f32
        }
    }
}

/// Global device allocation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceMemoryStats {
    /// Live raw allocations
    pub allocation_count: u32,
    /// Highest live raw allocation count
    pub peak_allocation_count: u32,
    /// Device allocation-count ceiling
    pub max_allocation_count: u32,
    /// Successful raw allocations
    pub total_allocations: u64,
    /// Raw frees
    pub total_frees: u64,
    /// Rejected or failed raw allocations
    pub failed_allocations: u64,
}

/// A raw allocation still alive, with its creation site
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveAllocationRecord {
    /// Page id
    pub page: PageId,
    /// Size in bytes
    pub size: u64,
    /// Memory type index
    pub memory_type_index: u32,
    /// Residency priority
    pub priority: f32,
    /// Creation site
    pub tag: &'static str,
}

impl fmt::Display for LiveAllocationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page {} type {} {} bytes ({})",
            self.page, self.memory_type_index, self.size, self.tag
        )
    }
}

// =============================================================================
// DEVICE MEMORY MANAGER
// =============================================================================

#[derive(Debug)]
struct HeapTable {
    heaps: ArrayVec<HeapUsage, MAX_MEMORY_HEAPS>,
    live: HashMap<DeviceMemoryHandle, LiveAllocationRecord>,
    allocation_count: u32,
    stats: DeviceMemoryStats,
}

impl HeapTable {
    fn rollback(&mut self, heap_index: u32, size: u64) {
        self.heaps[heap_index as usize].used -= size;
        self.allocation_count -= 1;
        self.stats.failed_allocations += 1;
    }
}

/// Wraps the raw primitives with heap accounting
#[derive(Debug)]
pub struct DeviceMemoryManager<B: DeviceMemoryBackend> {
    backend: B,
    properties: MemoryProperties,
    limits: DeviceLimits,
    table: Mutex<HeapTable>,
    next_page: AtomicU64,
}

impl<B: DeviceMemoryBackend> DeviceMemoryManager<B> {
    /// Enumerate heaps and types from the backend
    pub fn new(backend: B) -> Self {
        let properties = backend.memory_properties();
        let limits = backend.limits();
        let heaps = properties
            .heaps()
            .iter()
            .map(|heap| HeapUsage {
                index: heap.index,
                total: heap.size,
                ..HeapUsage::default()
            })
            .collect();

        log::info!(
            "device memory: {} heaps, {} types, max {} allocations",
            properties.heaps().len(),
            properties.types().len(),
            limits.max_allocation_count
        );

        Self {
            backend,
            properties,
            limits,
            table: Mutex::new(HeapTable {
                heaps,
                live: HashMap::new(),
                allocation_count: 0,
                stats: DeviceMemoryStats {
                    max_allocation_count: limits.max_allocation_count,
                    ..DeviceMemoryStats::default()
                },
            }),
            next_page: AtomicU64::new(1),
        }
    }

    /// Backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Heap and type tables
    pub fn properties(&self) -> &MemoryProperties {
        &self.properties
    }

    /// Device limits
    pub fn limits(&self) -> DeviceLimits {
        self.limits
    }

    // -------------------------------------------------------------------------
    // Memory type selection
    // -------------------------------------------------------------------------

    /// Memory types allowed by `type_bits` that satisfy `desired`, best first.
    ///
    /// Order: exact flag match, then supersets, then the same two passes with
    /// `HOST_CACHED` dropped, then with `LAZILY_ALLOCATED` dropped as well.
    pub fn memory_type_candidates(
        &self,
        type_bits: u32,
        desired: MemoryPropertyFlags,
    ) -> ArrayVec<u32, MAX_MEMORY_TYPES> {
        let reduced = desired - MemoryPropertyFlags::HOST_CACHED;
        let minimal = reduced - MemoryPropertyFlags::LAZILY_ALLOCATED;

        let mut out = ArrayVec::new();
        let mut tiers: ArrayVec<MemoryPropertyFlags, 3> = ArrayVec::new();
        for flags in [desired, reduced, minimal] {
            if !tiers.contains(&flags) {
                tiers.push(flags);
            }
        }

        for flags in tiers {
            let allowed = self
                .properties
                .types()
                .iter()
                .filter(|t| t.index < 32 && type_bits & (1 << t.index) != 0);
            let exact = allowed.clone().filter(|t| t.flags == flags);
            let superset = allowed.filter(|t| t.flags != flags && t.flags.contains(flags));
            for t in exact.chain(superset) {
                if !out.contains(&t.index) {
                    out.push(t.index);
                }
            }
        }
        out
    }

    /// Best memory type for `desired` among `type_bits`
    pub fn find_memory_type(&self, type_bits: u32, desired: MemoryPropertyFlags) -> Result<u32> {
        let candidates = self.memory_type_candidates(type_bits, desired);
        match candidates.first() {
            Some(&index) => {
                let flags = self.properties.types()[index as usize].flags;
                if !flags.contains(desired) {
                    log::debug!(
                        "memory type {} selected with reduced capabilities {:?} (wanted {:?})",
                        index,
                        flags,
                        desired
                    );
                }
                Ok(index)
            }
            None => Err(Error::MemoryTypeNotFound),
        }
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Allocate one page.
    ///
    /// Failure is reported as the recoverable [`Error::PageAllocationFailed`].
    pub fn allocate(&self, request: &PageRequest) -> Result<DeviceMemoryAllocation> {
        let memory_type = self
            .properties
            .memory_type(request.memory_type_index)
            .copied()
            .ok_or(Error::InvalidParameter)?;
        if request.size == 0 {
            return Err(Error::InvalidParameter);
        }
        let heap_index = memory_type.heap_index;

        // Reserve under the lock, call the primitive without it.
        {
            let mut table = self.table.lock();
            if table.allocation_count >= self.limits.max_allocation_count {
                table.stats.failed_allocations += 1;
                log::warn!(
                    "device allocation limit reached ({} live)",
                    table.allocation_count
                );
                return Err(Error::PageAllocationFailed);
            }
            let heap = &mut table.heaps[heap_index as usize];
            if heap.used.saturating_add(request.size) > heap.total {
                let (used, total) = (heap.used, heap.total);
                table.stats.failed_allocations += 1;
                log::warn!(
                    "heap {} budget exceeded: {} + {} > {}",
                    heap_index,
                    used,
                    request.size,
                    total
                );
                return Err(Error::PageAllocationFailed);
            }
            heap.used += request.size;
            table.allocation_count += 1;
        }

        let info = PrimitiveAllocateInfo {
            size: request.size,
            memory_type_index: request.memory_type_index,
            priority: request.priority,
            dedicated: request.dedicated,
        };
        let handle = match self.backend.allocate(&info) {
            Ok(handle) => handle,
            Err(e) => {
                self.table.lock().rollback(heap_index, request.size);
                log::warn!(
                    "page allocation of {} bytes on type {} failed: {}",
                    request.size,
                    request.memory_type_index,
                    e
                );
                return Err(Error::PageAllocationFailed);
            }
        };

        let mapped = if memory_type.flags.is_mappable() {
            match self.backend.map(handle, 0, request.size) {
                Ok(ptr) => Some(MappedPtr(ptr)),
                Err(e) => {
                    self.backend.free(handle);
                    self.table.lock().rollback(heap_index, request.size);
                    log::error!("mapping page of type {} failed: {}", memory_type.index, e);
                    return Err(Error::from(e));
                }
            }
        } else {
            None
        };

        let page = PageId::new(self.next_page.fetch_add(1, Ordering::Relaxed));
        {
            let mut table = self.table.lock();
            let allocation_count = table.allocation_count;
            let heap = &mut table.heaps[heap_index as usize];
            heap.peak = heap.peak.max(heap.used);
            heap.allocation_count += 1;
            table.stats.total_allocations += 1;
            table.stats.peak_allocation_count =
                table.stats.peak_allocation_count.max(allocation_count);
            table.live.insert(
                handle,
                LiveAllocationRecord {
                    page,
                    size: request.size,
                    memory_type_index: request.memory_type_index,
                    priority: request.priority,
                    tag: request.tag,
                },
            );
        }

        log::info!(
            "page {} allocated: {} bytes, type {}{} ({})",
            page,
            request.size,
            request.memory_type_index,
            if request.dedicated { ", dedicated" } else { "" },
            request.tag
        );

        Ok(DeviceMemoryAllocation {
            binding: MemoryBinding {
                handle,
                page,
                memory_type_index: request.memory_type_index,
                flags: memory_type.flags,
                page_size: request.size,
                mapped,
            },
            heap_index,
            dedicated: request.dedicated,
            priority: request.priority,
            tag: request.tag,
        })
    }

    /// Return a page to the device
    pub fn free(&self, allocation: DeviceMemoryAllocation) {
        let handle = allocation.handle();
        if allocation.binding.mapped.is_some() {
            self.backend.unmap(handle);
        }
        self.backend.free(handle);

        let mut table = self.table.lock();
        let heap = &mut table.heaps[allocation.heap_index as usize];
        heap.used -= allocation.size();
        heap.allocation_count -= 1;
        table.allocation_count -= 1;
        table.stats.total_frees += 1;
        table.live.remove(&handle);
        drop(table);

        log::info!(
            "page {} released: {} bytes, type {}",
            allocation.page_id(),
            allocation.size(),
            allocation.memory_type_index()
        );
    }

    /// Make host writes to a range visible to the device
    pub fn flush(&self, binding: &MemoryBinding, offset: u64, size: u64) -> Result<()> {
        if !binding.flags.is_mappable() {
            return Err(Error::NotMappable);
        }
        if !binding.flags.needs_flush() {
            return Ok(());
        }
        let (offset, size) = self.atom_range(binding.page_size, offset, size);
        self.backend
            .flush_range(binding.handle, offset, size)
            .map_err(Error::from)
    }

    /// Make device writes to a range visible to the host
    pub fn invalidate(&self, binding: &MemoryBinding, offset: u64, size: u64) -> Result<()> {
        if !binding.flags.is_mappable() {
            return Err(Error::NotMappable);
        }
        if !binding.flags.needs_flush() {
            return Ok(());
        }
        let (offset, size) = self.atom_range(binding.page_size, offset, size);
        self.backend
            .invalidate_range(binding.handle, offset, size)
            .map_err(Error::from)
    }

    /// Widen a range to the non-coherent atom size, clamped to the page
    fn atom_range(&self, page_size: u64, offset: u64, size: u64) -> (u64, u64) {
        let atom = self.limits.non_coherent_atom_size.max(1);
        let start = offset - offset % atom;
        let end = offset.saturating_add(size);
        let end = match end % atom {
            0 => end,
            rem => end.saturating_add(atom - rem),
        };
        let end = end.min(page_size);
        (start, end - start)
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Usage of every heap
    pub fn heap_usage(&self) -> ArrayVec<HeapUsage, MAX_MEMORY_HEAPS> {
        self.table.lock().heaps.clone()
    }

    /// Usage of one heap
    pub fn heap(&self, index: u32) -> Option<HeapUsage> {
        self.table.lock().heaps.get(index as usize).copied()
    }

    /// Global counters
    pub fn stats(&self) -> DeviceMemoryStats {
        let table = self.table.lock();
        DeviceMemoryStats {
            allocation_count: table.allocation_count,
            ..table.stats
        }
    }

    /// Raw allocations currently alive
    pub fn live_allocations(&self) -> Vec<LiveAllocationRecord> {
        self.table.lock().live.values().copied().collect()
    }

    /// Log per-heap usage
    pub fn log_dump(&self) {
        let stats = self.stats();
        log::error!(
            "device memory: {} live allocations (peak {}, limit {})",
            stats.allocation_count,
            stats.peak_allocation_count,
            stats.max_allocation_count
        );
        for heap in self.heap_usage() {
            log::error!(
                "  heap {}: {} / {} bytes used, peak {}, {} allocations",
                heap.index,
                heap.used,
                heap.total,
                heap.peak,
                heap.allocation_count
            );
        }
    }

    /// Log the heap dump and produce the fatal out-of-memory error
    pub fn report_out_of_memory(&self, size: u64, memory_type_index: u32) -> Error {
        log::error!(
            "out of device memory: {} bytes on memory type {} with no fallback left",
            size,
            memory_type_index
        );
        self.log_dump();
        Error::DeviceOutOfMemory
    }
}

impl<B: DeviceMemoryBackend> Drop for DeviceMemoryManager<B> {
    fn drop(&mut self) {
        let table = self.table.lock();
        if table.live.is_empty() {
            return;
        }
        log::error!(
            "{} device allocations leaked at teardown",
            table.live.len()
        );
        for record in table.live.values() {
            log::error!("  leaked {}", record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tephra_core::HostBackend;

    fn request(size: u64, memory_type_index: u32) -> PageRequest {
        PageRequest {
            size,
            memory_type_index,
            priority: 0.5,
            dedicated: false,
            tag: "test",
        }
    }

    #[test]
    fn test_allocate_tracks_usage_and_peak() {
        let device = DeviceMemoryManager::new(HostBackend::discrete(1 << 20, 1 << 20));
        let a = device.allocate(&request(4096, 0)).unwrap();
        let b = device.allocate(&request(8192, 0)).unwrap();
        assert_eq!(device.heap(0).unwrap().used, 12288);
        assert_ne!(a.page_id(), b.page_id());

        device.free(a);
        let heap = device.heap(0).unwrap();
        assert_eq!(heap.used, 8192);
        assert_eq!(heap.peak, 12288);
        assert_eq!(device.stats().allocation_count, 1);
        device.free(b);
        assert!(device.live_allocations().is_empty());
    }

    #[test]
    fn test_budget_failure_is_recoverable() {
        let device = DeviceMemoryManager::new(HostBackend::discrete(4096, 4096));
        assert_eq!(
            device.allocate(&request(8192, 0)).unwrap_err(),
            Error::PageAllocationFailed
        );
        assert_eq!(device.stats().failed_allocations, 1);
        assert_eq!(device.heap(0).unwrap().used, 0);
    }

    #[test]
    fn test_backend_failure_rolls_back() {
        let device = DeviceMemoryManager::new(HostBackend::discrete(1 << 20, 1 << 20));
        device.backend().fail_next_allocations(1);
        assert_eq!(
            device.allocate(&request(4096, 0)).unwrap_err(),
            Error::PageAllocationFailed
        );
        assert_eq!(device.heap(0).unwrap().used, 0);
        assert_eq!(device.stats().allocation_count, 0);
    }

    #[test]
    fn test_host_visible_pages_are_mapped() {
        let device = DeviceMemoryManager::new(HostBackend::discrete(1 << 20, 1 << 20));
        let page = device.allocate(&request(4096, 1)).unwrap();
        assert!(page.mapped_ptr().is_some());
        assert!(page.is_coherent());
        let vram = device.allocate(&request(4096, 0)).unwrap();
        assert!(vram.mapped_ptr().is_none());
        device.free(page);
        device.free(vram);
    }

    #[test]
    fn test_find_memory_type_prefers_exact_then_falls_back() {
        let device = DeviceMemoryManager::new(HostBackend::discrete(1 << 20, 1 << 20));
        let all = device.properties().all_types_mask();

        assert_eq!(device.find_memory_type(all, MemoryPropertyFlags::DEVICE_LOCAL), Ok(0));
        let visible = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(device.find_memory_type(all, visible), Ok(1));
        assert_eq!(
            device.find_memory_type(all, visible | MemoryPropertyFlags::HOST_CACHED),
            Ok(2)
        );
        // Cached type excluded by the mask: drop caching
        assert_eq!(
            device.find_memory_type(0b1001, visible | MemoryPropertyFlags::HOST_CACHED),
            Ok(3)
        );
        // Lazily allocated does not exist: drop it
        let lazy = MemoryPropertyFlags::DEVICE_LOCAL | MemoryPropertyFlags::LAZILY_ALLOCATED;
        assert_eq!(device.find_memory_type(all, lazy), Ok(0));
        assert_eq!(
            device.find_memory_type(0b0001, visible),
            Err(Error::MemoryTypeNotFound)
        );
    }

    #[test]
    fn test_flush_widened_to_atom() {
        let device = DeviceMemoryManager::new(HostBackend::discrete(1 << 20, 1 << 20));
        assert_eq!(device.atom_range(4096, 70, 10), (64, 64));
        assert_eq!(device.atom_range(100, 70, 10), (64, 36));
    }
}
