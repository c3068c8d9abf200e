//! # Memory Manager
//!
//! Facade over every allocator layer.
//!
//! ```text
//! allocate ──► pooled category & small? ──yes──► PooledBufferAllocator
//!                      │ no
//!                      ▼
//!              ResourceHeap[type] ──PageAllocationFailed──► next candidate type
//!                                                           │ none left
//!                                                           ▼
//!                                                dump + DeviceOutOfMemory
//!
//! free(seq) ──► FreePending ──► DeferredDeletionQueue ──tick(completed)──► free
//! ```

use alloc::boxed::Box;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use tephra_core::{
    is_valid_alignment, AllocationCategory, DeviceMemoryBackend, Error, MemoryProperties,
    MemoryPropertyFlags, PageId, ResourceShape, Result, SubmissionTimeline,
};

use crate::config::AllocatorConfig;
use crate::deletion::DeferredDeletionQueue;
use crate::device::DeviceMemoryManager;
use crate::eviction::{
    EvictionCandidate, EvictionController, EvictionDecision, EvictionHandler, EvictionPolicy,
};
use crate::fence::FenceManager;
use crate::heap::{ResourceHeap, ResourceRequest};
use crate::pool::{PoolRequest, PooledBufferAllocator};
use crate::report::{MemoryReport, TeardownReport};
use crate::staging::{StagingBufferManager, StagingPass};
use crate::suballoc::{AllocationId, AllocationOrigin, FreeOutcome, SlotStatus, SubAllocation};

// =============================================================================
// REQUEST
// =============================================================================

/// Owner-facing allocation request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AllocationRequest {
    /// Size in bytes
    pub size: u64,
    /// Power-of-two alignment
    pub alignment: u64,
    /// Accounting category
    pub category: AllocationCategory,
    /// Buffer or image
    pub shape: ResourceShape,
    /// Capabilities the memory must have
    pub required_flags: MemoryPropertyFlags,
    /// Memory types the resource can live in
    pub memory_type_bits: u32,
    /// Creation site
    pub tag: &'static str,
    /// Owner cookie handed back to the eviction handler
    pub owner: u64,
    /// Residency priority for a dedicated or newly created page. Pooled
    /// pages are shared and keep the configured priority.
    pub priority: Option<f32>,
}

impl AllocationRequest {
    /// Device-local buffer
    pub const fn buffer(size: u64, alignment: u64) -> Self {
        Self {
            size,
            alignment,
            category: AllocationCategory::Buffer,
            shape: ResourceShape::Buffer,
            required_flags: MemoryPropertyFlags::DEVICE_LOCAL,
            memory_type_bits: u32::MAX,
            tag: "buffer",
            owner: 0,
            priority: None,
        }
    }

    /// Device-local sampled image
    pub const fn image(size: u64, alignment: u64) -> Self {
        Self {
            category: AllocationCategory::Image,
            shape: ResourceShape::Image,
            tag: "image",
            ..Self::buffer(size, alignment)
        }
    }

    /// Host-visible constant buffer
    pub const fn constant_buffer(size: u64) -> Self {
        Self {
            category: AllocationCategory::ConstantBuffer,
            required_flags: MemoryPropertyFlags::HOST_VISIBLE
                .union(MemoryPropertyFlags::HOST_COHERENT),
            tag: "constant buffer",
            ..Self::buffer(size, 256)
        }
    }

    /// Override the category
    pub const fn with_category(mut self, category: AllocationCategory) -> Self {
        self.category = category;
        self
    }

    /// Override the required flags
    pub const fn with_flags(mut self, flags: MemoryPropertyFlags) -> Self {
        self.required_flags = flags;
        self
    }

    /// Restrict the allowed memory types
    pub const fn with_type_bits(mut self, bits: u32) -> Self {
        self.memory_type_bits = bits;
        self
    }

    /// Set the creation tag
    pub const fn with_tag(mut self, tag: &'static str) -> Self {
        self.tag = tag;
        self
    }

    /// Set the owner cookie
    pub const fn with_owner(mut self, owner: u64) -> Self {
        self.owner = owner;
        self
    }

    /// Set the residency priority, clamped to `[0, 1]` when the page is made
    pub const fn with_priority(mut self, priority: f32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// What one [`MemoryManager::tick`] did
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    /// Epoch after the tick
    pub epoch: u64,
    /// Deferred frees executed
    pub freed: usize,
    /// Deferred frees that failed
    pub free_errors: usize,
    /// Staging buffer pass
    pub staging: StagingPass,
    /// Pages returned to the device
    pub pages_released: usize,
    /// Eviction decision
    pub eviction: EvictionDecision,
    /// Page marked evicting, if any
    pub evicted: Option<PageId>,
}

// =============================================================================
// MEMORY MANAGER
// =============================================================================

/// Device memory allocator
pub struct MemoryManager<B: DeviceMemoryBackend> {
    config: AllocatorConfig,
    device: DeviceMemoryManager<B>,
    heaps: Vec<ResourceHeap>,
    pool: PooledBufferAllocator,
    deletion: DeferredDeletionQueue<AllocationId>,
    fences: FenceManager,
    staging: StagingBufferManager,
    staging_type: Option<u32>,
    eviction: EvictionController,
    monitored_heap: Option<u32>,
    handler: Mutex<Option<Arc<dyn EvictionHandler>>>,
    epoch: AtomicU64,
    shut_down: AtomicBool,
}

impl<B: DeviceMemoryBackend> core::fmt::Debug for MemoryManager<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.config)
            .field("heaps", &self.heaps.len())
            .field("staging_type", &self.staging_type)
            .field("monitored_heap", &self.monitored_heap)
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Heap watched by the eviction controller when none is configured: the heap
/// of the first device-local host-visible type, else of the first
/// host-visible type
fn default_monitored_heap(properties: &MemoryProperties) -> Option<u32> {
    let shared = MemoryPropertyFlags::DEVICE_LOCAL | MemoryPropertyFlags::HOST_VISIBLE;
    properties
        .types()
        .iter()
        .find(|t| t.flags.contains(shared))
        .or_else(|| properties.types().iter().find(|t| t.flags.is_mappable()))
        .map(|t| t.heap_index)
}

impl<B: DeviceMemoryBackend> MemoryManager<B> {
    /// Enumerate memory types and build one heap per type
    pub fn new(backend: B, config: AllocatorConfig) -> Self {
        let device = DeviceMemoryManager::new(backend);
        let properties = device.properties().clone();

        let heaps = properties
            .types()
            .iter()
            .map(|t| {
                let heap_size = properties.heap(t.heap_index).map_or(0, |h| h.size);
                ResourceHeap::new(t.index, heap_size, &config)
            })
            .collect();

        let staging_type = device
            .find_memory_type(
                properties.all_types_mask(),
                MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
            )
            .ok();
        let monitored_heap = config
            .eviction
            .monitored_heap
            .or_else(|| default_monitored_heap(&properties));

        log::info!(
            "memory manager: {} types, staging on {:?}, eviction monitors heap {:?}",
            properties.types().len(),
            staging_type,
            monitored_heap
        );

        Self {
            device,
            heaps,
            pool: PooledBufferAllocator::new(&config),
            deletion: DeferredDeletionQueue::new(),
            fences: FenceManager::new(),
            staging: StagingBufferManager::new(config.staging),
            staging_type,
            eviction: EvictionController::new(config.eviction),
            monitored_heap,
            handler: Mutex::new(None),
            epoch: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            config,
        }
    }

    /// Replace the page-selection policy
    pub fn with_eviction_policy(mut self, policy: Box<dyn EvictionPolicy>) -> Self {
        self.eviction = EvictionController::with_policy(self.config.eviction, policy);
        self
    }

    /// Register the callback that migrates evicted allocations
    pub fn set_eviction_handler(&self, handler: Arc<dyn EvictionHandler>) {
        *self.handler.lock() = Some(handler);
    }

    /// Configuration
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Device memory manager
    pub fn device(&self) -> &DeviceMemoryManager<B> {
        &self.device
    }

    /// Heap of one memory type
    pub fn heap(&self, memory_type_index: u32) -> Option<&ResourceHeap> {
        self.heaps.get(memory_type_index as usize)
    }

    /// Pooled buffer allocator
    pub fn pool(&self) -> &PooledBufferAllocator {
        &self.pool
    }

    /// Fence pool
    pub fn fences(&self) -> &FenceManager {
        &self.fences
    }

    /// Eviction controller
    pub fn eviction(&self) -> &EvictionController {
        &self.eviction
    }

    /// Current reclaim epoch
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Allocate memory for a resource.
    ///
    /// Candidate memory types are tried best first; `PageAllocationFailed`
    /// moves on to the next. With no candidate left a full report is logged
    /// and [`Error::DeviceOutOfMemory`] is returned.
    pub fn allocate(&self, request: &AllocationRequest) -> Result<SubAllocation> {
        if request.size == 0 || !is_valid_alignment(request.alignment) {
            return Err(Error::InvalidParameter);
        }

        let type_bits = request.memory_type_bits & self.device.properties().all_types_mask();
        let candidates = self
            .device
            .memory_type_candidates(type_bits, request.required_flags);
        let Some(&preferred) = candidates.first() else {
            log::warn!(
                "no memory type for {:?} in mask {:#x} ({})",
                request.required_flags,
                type_bits,
                request.tag
            );
            return Err(Error::MemoryTypeNotFound);
        };

        let pooled = request.category.is_pooled()
            && request.shape == ResourceShape::Buffer
            && request.size <= self.pool.threshold();

        for &memory_type_index in &candidates {
            let result = if pooled {
                self.pool.allocate(
                    &PoolRequest {
                        size: request.size,
                        alignment: request.alignment,
                        category: request.category,
                        flags: request.required_flags,
                        memory_type_index,
                        tag: request.tag,
                        owner: request.owner,
                    },
                    &self.device,
                )
            } else {
                self.heaps[memory_type_index as usize].allocate(
                    &ResourceRequest {
                        size: request.size,
                        alignment: request.alignment,
                        shape: request.shape,
                        category: request.category,
                        tag: request.tag,
                        owner: request.owner,
                        priority: request.priority,
                    },
                    &self.device,
                )
            };

            match result {
                Ok(allocation) => {
                    if memory_type_index != preferred {
                        log::debug!(
                            "{} ({} bytes) fell back from type {} to type {}",
                            request.tag,
                            request.size,
                            preferred,
                            memory_type_index
                        );
                    }
                    return Ok(allocation);
                }
                Err(Error::PageAllocationFailed) => {
                    log::warn!(
                        "type {} cannot hold {} bytes for {}",
                        memory_type_index,
                        request.size,
                        request.tag
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.log_report_at(log::Level::Error);
        Err(self.device.report_out_of_memory(request.size, preferred))
    }

    // -------------------------------------------------------------------------
    // Release
    // -------------------------------------------------------------------------

    /// Free once the GPU has completed `last_used_sequence`
    pub fn free(&self, allocation: SubAllocation, last_used_sequence: u64) -> Result<()> {
        let id = allocation.into_id();
        let marked = match id.origin() {
            AllocationOrigin::Heap => self.heap_of(id)?.mark_free_pending(id),
            AllocationOrigin::Pool => self.pool.mark_free_pending(id),
        };
        if let Err(e) = marked {
            log::error!("{} on {:?}", e, id);
            return Err(e);
        }
        self.deletion.enqueue(id, last_used_sequence)
    }

    /// Free now; only for memory the GPU never saw
    pub fn free_immediate(&self, allocation: SubAllocation) -> Result<FreeOutcome> {
        self.free_id(allocation.into_id())
    }

    fn heap_of(&self, id: AllocationId) -> Result<&ResourceHeap> {
        self.heaps
            .get(id.memory_type_index() as usize)
            .ok_or(Error::NotFound)
    }

    fn free_id(&self, id: AllocationId) -> Result<FreeOutcome> {
        let result = match id.origin() {
            AllocationOrigin::Heap => self.heap_of(id)?.free(id, &self.device),
            AllocationOrigin::Pool => self.pool.free(id),
        };
        if let Err(e) = result {
            if e.is_programmer_error() {
                log::error!("{} on {:?}", e, id);
            }
        }
        result
    }

    /// Slot state of an allocation
    pub fn status(&self, id: AllocationId) -> Result<SlotStatus> {
        match id.origin() {
            AllocationOrigin::Heap => self.heap_of(id)?.status(id),
            AllocationOrigin::Pool => self.pool.status(id),
        }
    }

    /// Deferred frees waiting on the GPU
    pub fn pending_deletions(&self) -> usize {
        self.deletion.len()
    }

    // -------------------------------------------------------------------------
    // Host access
    // -------------------------------------------------------------------------

    /// Host pointer to the allocation's first byte
    pub fn mapped_ptr(&self, allocation: &SubAllocation) -> Result<NonNull<u8>> {
        allocation.mapped_ptr().ok_or(Error::NotMappable)
    }

    fn check_range(allocation: &SubAllocation, offset: u64, size: u64) -> Result<u64> {
        match offset.checked_add(size) {
            Some(end) if end <= allocation.size() => Ok(allocation.offset() + offset),
            _ => Err(Error::InvalidParameter),
        }
    }

    /// Make host writes to `[offset, offset + size)` visible to the device
    pub fn flush(&self, allocation: &SubAllocation, offset: u64, size: u64) -> Result<()> {
        let start = Self::check_range(allocation, offset, size)?;
        self.device.flush(allocation.binding(), start, size)
    }

    /// Make device writes to `[offset, offset + size)` visible to the host
    pub fn invalidate(&self, allocation: &SubAllocation, offset: u64, size: u64) -> Result<()> {
        let start = Self::check_range(allocation, offset, size)?;
        self.device.invalidate(allocation.binding(), start, size)
    }

    // -------------------------------------------------------------------------
    // Staging
    // -------------------------------------------------------------------------

    fn staging_heap(&self) -> Result<&ResourceHeap> {
        self.staging_type
            .and_then(|t| self.heaps.get(t as usize))
            .ok_or(Error::MemoryTypeNotFound)
    }

    /// Host-visible transfer buffer of exactly `size` bytes
    pub fn acquire_staging(&self, size: u64) -> Result<SubAllocation> {
        self.staging.acquire(size, self.staging_heap()?, &self.device)
    }

    /// Return a transfer buffer once `sequence` completes
    pub fn release_staging(&self, buffer: SubAllocation, sequence: u64) {
        self.staging.release(buffer, sequence, &self.fences);
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Once per scheduling cycle: deferred frees, staging, reclaim, eviction
    pub fn tick(&self, completed: u64) -> TickReport {
        let mut freed = 0;
        let mut free_errors = 0;
        for ticket in self.deletion.tick(completed) {
            match self.free_id(ticket.key) {
                Ok(_) => freed += 1,
                Err(_) => free_errors += 1,
            }
        }

        let staging = match self.staging_heap() {
            Ok(heap) => self
                .staging
                .process(completed, self.epoch(), &self.fences, heap, &self.device),
            Err(_) => StagingPass::default(),
        };

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let pages_released = self
            .heaps
            .iter()
            .map(|heap| heap.reclaim(epoch, &self.device))
            .sum::<usize>()
            + self.pool.reclaim(epoch, &self.device);

        let (eviction, evicted) = self.run_eviction_pass();

        TickReport {
            epoch,
            freed,
            free_errors,
            staging,
            pages_released,
            eviction,
            evicted,
        }
    }

    /// [`tick`](Self::tick) with the timeline's last completed value
    pub fn tick_timeline<T: SubmissionTimeline + ?Sized>(&self, timeline: &T) -> TickReport {
        self.tick(timeline.last_completed())
    }

    fn monitored_heaps(&self, heap_index: u32) -> impl Iterator<Item = &ResourceHeap> + '_ {
        let properties = self.device.properties();
        self.heaps.iter().filter(move |heap| {
            properties
                .memory_type(heap.memory_type_index())
                .map_or(false, |t| t.heap_index == heap_index)
        })
    }

    /// Host-visible type outside the monitored heap
    fn eviction_target(&self, heap_index: u32) -> Option<u32> {
        let properties = self.device.properties();
        let mask = properties
            .types()
            .iter()
            .filter(|t| t.heap_index != heap_index)
            .fold(0u32, |mask, t| mask | (1 << t.index));
        self.device
            .memory_type_candidates(
                mask,
                MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
            )
            .first()
            .copied()
    }

    fn run_eviction_pass(&self) -> (EvictionDecision, Option<PageId>) {
        let Some(heap_index) = self.monitored_heap else {
            return (EvictionDecision::Disabled, None);
        };
        let Some(usage) = self.device.heap(heap_index) else {
            return (EvictionDecision::Disabled, None);
        };
        let pending: u64 = self
            .monitored_heaps(heap_index)
            .map(ResourceHeap::pending_eviction_bytes)
            .sum();

        let decision = self.eviction.evaluate(usage.used, pending, usage.total);
        if !matches!(decision, EvictionDecision::Evict { .. }) {
            return (decision, None);
        }

        let candidates: Vec<EvictionCandidate> = self
            .monitored_heaps(heap_index)
            .flat_map(|heap| heap.eviction_candidates())
            .map(|page| EvictionCandidate {
                page: page.page,
                memory_type_index: page.memory_type_index,
                used_bytes: page.used,
                live: page.live,
            })
            .collect();
        let Some(choice) = self.eviction.select(&candidates) else {
            log::debug!("heap {} under pressure but nothing is evictable", heap_index);
            return (decision, None);
        };
        let Some(target) = self.eviction_target(heap_index) else {
            log::debug!("no host-visible memory outside heap {}", heap_index);
            return (decision, None);
        };
        let Some(handler) = self.handler.lock().clone() else {
            log::debug!("eviction wanted but no handler is registered");
            return (decision, None);
        };

        let victims = match self.heaps[choice.memory_type_index as usize].begin_eviction(choice.page) {
            Ok(victims) => victims,
            Err(e) => {
                log::warn!("eviction of page {} aborted: {}", choice.page, e);
                return (decision, None);
            }
        };

        let (mut relocated, mut failed) = (0, 0);
        for victim in &victims {
            let replacement = self.heaps[target as usize].allocate(
                &ResourceRequest {
                    size: victim.size,
                    alignment: victim.alignment,
                    shape: ResourceShape::Image,
                    category: victim.category,
                    tag: victim.tag,
                    owner: victim.owner,
                    priority: None,
                },
                &self.device,
            );
            match replacement {
                Ok(replacement) => match handler.relocate(victim, replacement) {
                    Ok(()) => relocated += 1,
                    Err(rejected) => {
                        failed += 1;
                        if let Err(e) = self.free_immediate(rejected) {
                            log::warn!(
                                "rejected replacement for {} could not be freed: {}",
                                victim.tag,
                                e
                            );
                        }
                    }
                },
                Err(e) => {
                    failed += 1;
                    log::warn!("no replacement for {} bytes ({}): {}", victim.size, victim.tag, e);
                }
            }
        }

        self.eviction.record_eviction(choice.page, relocated, failed);
        (decision, Some(choice.page))
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Snapshot of every layer
    pub fn report(&self) -> MemoryReport {
        MemoryReport {
            epoch: self.epoch(),
            device: self.device.stats(),
            heaps: self.device.heap_usage().into_iter().collect(),
            memory_types: self.heaps.iter().map(ResourceHeap::stats).collect(),
            pool: self.pool.stats(),
            deletion: self.deletion.stats(),
            fences: self.fences.stats(),
            staging: self.staging.stats(),
            eviction: self.eviction.stats(),
            #[cfg(feature = "metrics")]
            pages: self.heaps.iter().flat_map(ResourceHeap::page_stats).collect(),
        }
    }

    /// Log the report at info level
    pub fn log_report(&self) {
        self.log_report_at(log::Level::Info);
    }

    fn log_report_at(&self, level: log::Level) {
        let report = self.report().to_string();
        for line in report.lines() {
            log::log!(level, "{}", line);
        }
    }

    /// Drain, release and report leaks. The GPU must be idle.
    ///
    /// Later calls return an empty report.
    pub fn shutdown(&self) -> TeardownReport {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return TeardownReport::default();
        }
        let frees_before = self.device.stats().total_frees;

        let drained = self.deletion.drain_all();
        let drained_deletions = drained.len();
        for ticket in drained {
            let _ = self.free_id(ticket.key);
        }

        let staging_destroyed = match self.staging_heap() {
            Ok(heap) => self.staging.shutdown(&self.fences, heap, &self.device),
            Err(_) => 0,
        };

        for heap in &self.heaps {
            heap.release_retained(&self.device);
        }
        self.pool.release_retained(&self.device);

        let mut leaks = Vec::new();
        for heap in &self.heaps {
            leaks.extend(heap.teardown(&self.device));
        }
        leaks.extend(self.pool.teardown(&self.device));

        let report = TeardownReport {
            drained_deletions,
            staging_destroyed,
            pages_released: self.device.stats().total_frees - frees_before,
            leaks,
        };
        if report.is_clean() {
            log::info!("{}", report);
        } else {
            log::error!("{}", report);
        }
        report
    }
}

impl<B: DeviceMemoryBackend> Drop for MemoryManager<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvictionConfig, PageSizePolicy};
    use crate::suballoc::LiveSubAllocation;
    use tephra_core::{DeviceLimits, HostBackend, MemoryHeapFlags, Timeline};

    const PAGE: u64 = 64 * 1024;

    fn manager(device_bytes: u64, host_bytes: u64) -> MemoryManager<HostBackend> {
        let config = AllocatorConfig::desktop().with_page_size(PageSizePolicy::fixed(PAGE));
        MemoryManager::new(HostBackend::discrete(device_bytes, host_bytes), config)
    }

    #[test]
    fn test_routing() {
        let memory = manager(1 << 22, 1 << 22);
        let cb = memory.allocate(&AllocationRequest::constant_buffer(100)).unwrap();
        assert_eq!(cb.id().origin(), AllocationOrigin::Pool);
        assert_eq!(cb.size(), 256);
        assert_eq!(cb.id().memory_type_index(), 1);

        let image = memory.allocate(&AllocationRequest::image(4096, 4096)).unwrap();
        assert_eq!(image.id().origin(), AllocationOrigin::Heap);
        assert_eq!(image.id().memory_type_index(), 0);
        assert_eq!(image.offset() % 4096, 0);

        // Too large for the pool
        let big = memory
            .allocate(&AllocationRequest::constant_buffer(128 * 1024))
            .unwrap();
        assert_eq!(big.id().origin(), AllocationOrigin::Heap);

        memory.free_immediate(cb).unwrap();
        memory.free_immediate(image).unwrap();
        memory.free_immediate(big).unwrap();
        assert!(memory.shutdown().is_clean());
    }

    #[test]
    fn test_deferred_free_waits_for_completion() {
        let memory = manager(1 << 22, 1 << 22);
        let buffer = memory.allocate(&AllocationRequest::buffer(1024, 256)).unwrap();
        let id = buffer.id();

        // Completed is 8, buffer last used by submission 10
        memory.tick(8);
        memory.free(buffer, 10).unwrap();
        assert_eq!(memory.status(id), Ok(SlotStatus::FreePending));

        assert_eq!(memory.tick(9).freed, 0);
        assert_eq!(memory.status(id), Ok(SlotStatus::FreePending));

        assert_eq!(memory.tick(11).freed, 1);
        assert_eq!(memory.tick(12).freed, 0);
        assert_eq!(memory.pending_deletions(), 0);
        assert!(memory.shutdown().is_clean());
    }

    #[test]
    fn test_tick_from_timeline() {
        let memory = manager(1 << 22, 1 << 22);
        let timeline = Timeline::new();
        let buffer = memory.allocate(&AllocationRequest::buffer(4096, 256)).unwrap();
        let sequence = timeline.submit();
        memory.free(buffer, sequence).unwrap();

        timeline.signal(sequence);
        assert_eq!(memory.tick_timeline(&timeline).freed, 0);
        let next = timeline.submit();
        timeline.signal(next);
        assert_eq!(memory.tick_timeline(&timeline).freed, 1);
        assert_eq!(timeline.in_flight(), 0);
    }

    #[test]
    fn test_fallback_to_next_memory_type() {
        let memory = manager(1 << 22, PAGE);
        let visible = AllocationRequest::buffer(60 * 1024, 256)
            .with_flags(MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT);

        let first = memory.allocate(&visible).unwrap();
        assert_eq!(first.id().memory_type_index(), 1);
        // Host heap is full; type 2 shares it, type 3 lives in device memory
        let second = memory.allocate(&visible).unwrap();
        assert_eq!(second.id().memory_type_index(), 3);
        assert!(second.mapped_ptr().is_some());

        memory.free_immediate(first).unwrap();
        memory.free_immediate(second).unwrap();
    }

    #[test]
    fn test_out_of_memory_after_fallbacks() {
        let memory = manager(1 << 20, 1 << 20);
        let err = memory
            .allocate(&AllocationRequest::buffer(2 << 20, 256))
            .unwrap_err();
        assert_eq!(err, Error::DeviceOutOfMemory);
        assert!(!err.is_recoverable());
        assert_eq!(memory.device().heap(0).unwrap().used, 0);
    }

    #[test]
    fn test_invalid_requests() {
        let memory = manager(1 << 20, 1 << 20);
        assert_eq!(
            memory.allocate(&AllocationRequest::buffer(0, 16)).unwrap_err(),
            Error::InvalidParameter
        );
        assert_eq!(
            memory.allocate(&AllocationRequest::buffer(64, 24)).unwrap_err(),
            Error::InvalidParameter
        );
        assert_eq!(
            memory
                .allocate(&AllocationRequest::buffer(64, 16).with_type_bits(0))
                .unwrap_err(),
            Error::MemoryTypeNotFound
        );
    }

    #[test]
    fn test_double_free_through_facade() {
        let memory = manager(1 << 22, 1 << 22);
        let a = memory.allocate(&AllocationRequest::buffer(256, 256)).unwrap();
        let b = memory.allocate(&AllocationRequest::buffer(256, 256)).unwrap();
        let id = a.id();
        memory.free(a, 1).unwrap();
        memory.tick(2);
        assert_eq!(memory.status(id), Ok(SlotStatus::Freed));
        assert_eq!(memory.free_id(id), Err(Error::DoubleFree));
        memory.free_immediate(b).unwrap();
    }

    #[test]
    fn test_mapping_and_flush() {
        let memory = manager(1 << 22, 1 << 22);
        let cb = memory.allocate(&AllocationRequest::constant_buffer(64)).unwrap();
        let ptr = memory.mapped_ptr(&cb).unwrap();
        // SAFETY: the allocation is live, mapped and at least 64 bytes
        unsafe {
            ptr.as_ptr().write_bytes(0x5A, 64);
            assert_eq!(ptr.as_ptr().add(63).read(), 0x5A);
        }
        // Coherent memory needs no flush
        memory.flush(&cb, 0, 64).unwrap();
        assert_eq!(memory.device().backend().stats().flush_calls, 0);
        assert_eq!(memory.flush(&cb, 200, 100), Err(Error::InvalidParameter));

        let vram = memory.allocate(&AllocationRequest::buffer(64, 64)).unwrap();
        assert_eq!(memory.mapped_ptr(&vram), Err(Error::NotMappable));
        assert_eq!(memory.flush(&vram, 0, 64), Err(Error::NotMappable));

        memory.free_immediate(cb).unwrap();
        memory.free_immediate(vram).unwrap();
    }

    #[test]
    fn test_non_coherent_flush_reaches_backend() {
        let mut properties = MemoryProperties::new();
        let heap = properties.push_heap(1 << 20, MemoryHeapFlags::empty()).unwrap();
        properties.push_type(heap, MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED);
        let backend = HostBackend::new(properties, DeviceLimits::default());
        let config = AllocatorConfig::desktop().with_page_size(PageSizePolicy::fixed(PAGE));
        let memory = MemoryManager::new(backend, config);

        let readback = memory
            .allocate(
                &AllocationRequest::buffer(100, 16)
                    .with_flags(MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED),
            )
            .unwrap();
        memory.flush(&readback, 0, 100).unwrap();
        memory.invalidate(&readback, 10, 10).unwrap();
        let stats = memory.device().backend().stats();
        assert_eq!(stats.flush_calls, 1);
        assert_eq!(stats.invalidate_calls, 1);
        memory.free_immediate(readback).unwrap();
    }

    #[test]
    fn test_staging_roundtrip() {
        let memory = manager(1 << 22, 1 << 22);
        let buffer = memory.acquire_staging(4096).unwrap();
        assert_eq!(buffer.category(), AllocationCategory::Staging);
        assert!(buffer.mapped_ptr().is_some());
        memory.release_staging(buffer, 3);

        assert_eq!(memory.tick(2).staging.recycled, 0);
        assert_eq!(memory.tick(3).staging.recycled, 0);
        assert_eq!(memory.tick(4).staging.recycled, 1);
        let again = memory.acquire_staging(4096).unwrap();
        memory.release_staging(again, 5);

        let report = memory.shutdown();
        assert_eq!(report.staging_destroyed, 1);
        assert!(report.is_clean());
    }

    #[test]
    fn test_staging_and_deferred_free_share_sequence() {
        let memory = manager(1 << 22, 1 << 22);
        let buffer = memory.allocate(&AllocationRequest::buffer(1024, 256)).unwrap();
        let staging = memory.acquire_staging(4096).unwrap();
        memory.free(buffer, 3).unwrap();
        memory.release_staging(staging, 3);

        // Submission 3 may still read both
        let tick = memory.tick(3);
        assert_eq!(tick.freed, 0);
        assert_eq!(tick.staging.recycled, 0);

        let tick = memory.tick(4);
        assert_eq!(tick.freed, 1);
        assert_eq!(tick.staging.recycled, 1);
        assert!(memory.shutdown().is_clean());
    }

    #[test]
    fn test_shutdown_reports_leaks() {
        let memory = manager(1 << 22, 1 << 22);
        let leaked = memory
            .allocate(&AllocationRequest::image(1000, 256).with_tag("forgotten texture"))
            .unwrap();
        let deferred = memory.allocate(&AllocationRequest::buffer(512, 256)).unwrap();
        memory.free(deferred, 100).unwrap();

        let report = memory.shutdown();
        assert_eq!(report.drained_deletions, 1);
        assert_eq!(report.leaks.len(), 1);
        assert_eq!(report.leaks[0].tag, "forgotten texture");
        assert_eq!(report.leaked_bytes(), 1000);
        assert_eq!(memory.device().backend().live_allocations(), 0);
        assert!(memory.shutdown().is_clean());
        drop(leaked);
    }

    #[test]
    fn test_report_display() {
        let memory = manager(1 << 22, 1 << 22);
        let image = memory.allocate(&AllocationRequest::image(8192, 256)).unwrap();
        let report = memory.report();
        assert_eq!(report.category_bytes()[AllocationCategory::Image.index()], 8192);
        assert_eq!(report.page_count(), 1);
        let text = report.to_string();
        assert!(text.contains("heap 0"));
        assert!(text.contains("image=8 KiB"));
        memory.free_immediate(image).unwrap();
    }

    #[test]
    fn test_report_keeps_fractional_sizes() {
        let memory = manager(1 << 22, 1 << 22);
        let image = memory.allocate(&AllocationRequest::image(1536, 256)).unwrap();
        let buffer = memory
            .allocate(&AllocationRequest::buffer(PAGE + 512, 256))
            .unwrap();
        let text = memory.report().to_string();
        assert!(text.contains("image=1.50 KiB"));
        assert!(text.contains("buffer=64.50 KiB"));
        // One 64 KiB image page plus the dedicated buffer page
        assert!(text.contains("heap 0: 128.50 KiB / 4 MiB"));
        memory.free_immediate(image).unwrap();
        memory.free_immediate(buffer).unwrap();
    }

    #[test]
    fn test_priority_reaches_new_pages() {
        let memory = manager(1 << 22, 1 << 22);
        let urgent = memory
            .allocate(&AllocationRequest::image(2 * PAGE, 256).with_priority(1.0))
            .unwrap();
        let ordinary = memory.allocate(&AllocationRequest::buffer(1024, 256)).unwrap();
        let clamped = memory
            .allocate(&AllocationRequest::buffer(2 * PAGE, 256).with_priority(7.0))
            .unwrap();

        let live = memory.device().live_allocations();
        let priority_of = |allocation: &SubAllocation| {
            live.iter()
                .find(|record| record.page == allocation.id().page())
                .map(|record| record.priority)
        };
        assert_eq!(priority_of(&urgent), Some(1.0));
        assert_eq!(priority_of(&ordinary), Some(0.5));
        assert_eq!(priority_of(&clamped), Some(1.0));

        for allocation in [urgent, ordinary, clamped] {
            memory.free_immediate(allocation).unwrap();
        }
    }

    // -------------------------------------------------------------------------
    // Eviction
    // -------------------------------------------------------------------------

    #[derive(Default)]
    struct Relocator {
        accept: bool,
        moved: Mutex<Vec<(LiveSubAllocation, SubAllocation)>>,
    }

    impl EvictionHandler for Relocator {
        fn relocate(
            &self,
            victim: &LiveSubAllocation,
            replacement: SubAllocation,
        ) -> core::result::Result<(), SubAllocation> {
            if !self.accept {
                return Err(replacement);
            }
            self.moved.lock().push((*victim, replacement));
            Ok(())
        }
    }

    fn fill_device_heap(
        memory: &MemoryManager<HostBackend>,
        request: AllocationRequest,
    ) -> Vec<SubAllocation> {
        // Four 64 KiB pages fill the 256 KiB device heap
        (0..4).map(|_| memory.allocate(&request).unwrap()).collect()
    }

    #[test]
    fn test_eviction_without_candidates_changes_nothing() {
        let memory = manager(4 * PAGE, 1 << 22);
        memory.set_eviction_handler(Arc::new(Relocator {
            accept: true,
            ..Relocator::default()
        }));
        let buffers = fill_device_heap(&memory, AllocationRequest::buffer(60 * 1024, 256));

        let before = memory.heap(0).unwrap().stats();
        let usage_before = memory.device().heap(0).unwrap();
        let tick = memory.tick(0);

        assert!(matches!(tick.eviction, EvictionDecision::Evict { .. }));
        assert_eq!(tick.evicted, None);
        assert_eq!(memory.heap(0).unwrap().stats(), before);
        assert_eq!(memory.device().heap(0).unwrap(), usage_before);
        assert!(memory.eviction().is_armed());
        assert_eq!(memory.eviction().stats().starved, 1);

        for buffer in buffers {
            memory.free_immediate(buffer).unwrap();
        }
    }

    #[test]
    fn test_eviction_migrates_first_image_page() {
        let memory = manager(4 * PAGE, 1 << 22);
        let relocator = Arc::new(Relocator {
            accept: true,
            ..Relocator::default()
        });
        memory.set_eviction_handler(relocator.clone());
        let mut images = fill_device_heap(&memory, AllocationRequest::image(60 * 1024, 256));
        let first_page = images[0].id().page();

        let tick = memory.tick(0);
        assert_eq!(tick.evicted, Some(first_page));
        assert!(!memory.eviction().is_armed());
        assert_eq!(memory.heap(0).unwrap().stats().evicting_pages, 1);

        let (victim, replacement) = relocator.moved.lock().pop().unwrap();
        assert_eq!(victim.id, images[0].id());
        assert_eq!(replacement.id().memory_type_index(), 1);
        assert_eq!(replacement.size(), victim.size);

        // Evicting pages refuse new work
        if let Ok(next) = memory.allocate(&AllocationRequest::image(1024, 256)) {
            assert_ne!(next.id().page(), first_page);
            memory.free_immediate(next).unwrap();
        }

        // Owner frees the victim through deferred deletion; the drained page is released
        memory.free(images.remove(0), 1).unwrap();
        memory.tick(2);
        assert_eq!(memory.heap(0).unwrap().stats().evicting_pages, 0);
        assert_eq!(memory.device().heap(0).unwrap().used, 3 * PAGE);

        memory.free_immediate(replacement).unwrap();
        for image in images {
            memory.free_immediate(image).unwrap();
        }
    }

    #[test]
    fn test_rejected_relocation_frees_replacement() {
        let memory = manager(4 * PAGE, 1 << 22);
        memory.set_eviction_handler(Arc::new(Relocator::default()));
        let images = fill_device_heap(&memory, AllocationRequest::image(60 * 1024, 256));

        let tick = memory.tick(0);
        assert!(tick.evicted.is_some());
        assert_eq!(memory.eviction().stats().failed, 1);
        assert_eq!(memory.heap(1).unwrap().stats().live_allocations, 0);

        for image in images {
            memory.free_immediate(image).unwrap();
        }
        // The drained evicting page is released, the others are retained
        let stats = memory.heap(0).unwrap().stats();
        assert_eq!(stats.evicting_pages, 0);
        assert_eq!(stats.retained_pages, 3);
    }

    #[test]
    fn test_eviction_disabled_by_config() {
        let config = AllocatorConfig::desktop()
            .with_page_size(PageSizePolicy::fixed(PAGE))
            .with_eviction(EvictionConfig::disabled());
        let memory = MemoryManager::new(HostBackend::discrete(4 * PAGE, 1 << 22), config);
        let images = fill_device_heap(&memory, AllocationRequest::image(60 * 1024, 256));
        assert_eq!(memory.tick(0).eviction, EvictionDecision::Disabled);
        for image in images {
            memory.free_immediate(image).unwrap();
        }
    }

    #[test]
    fn test_concurrent_facade_use() {
        let memory = Arc::new(manager(1 << 24, 1 << 24));
        let workers: Vec<_> = (0..4u64)
            .map(|t| {
                let memory = Arc::clone(&memory);
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        let request = if i % 2 == 0 {
                            AllocationRequest::constant_buffer(64 + t * 32)
                        } else {
                            AllocationRequest::buffer(1000 + t * 100, 256)
                        };
                        let allocation = memory.allocate(&request).unwrap();
                        memory.free(allocation, i).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(memory.pending_deletions(), 400);
        assert_eq!(memory.tick(u64::MAX).freed, 400);
        let report = memory.shutdown();
        assert!(report.is_clean());
    }
}
