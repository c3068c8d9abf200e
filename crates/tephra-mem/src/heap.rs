//! # Resource Heap
//!
//! Pages of one memory type, split by resource shape.
//!
//! ```text
//!            ┌──────────── used ────────────┐   ┌──── free (retained) ────┐
//! Buffer:    [page 3] [page 7] [page 9]          [page 4 @epoch 12]
//! Image:     [page 5] [page 8 (evicting)]        [page 6 @epoch 10]
//! ```
//!
//! Allocation probes `used` pages in registration order, then promotes a
//! retained page, then asks the [`DeviceMemoryManager`] for a new one. The
//! heap lock is never held across that request.

use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::Mutex;

use tephra_core::{
    is_valid_alignment, AllocationCategory, DeviceMemoryBackend, Error, PageId, ResourceShape,
    Result,
};

use crate::config::AllocatorConfig;
use crate::device::{DeviceMemoryAllocation, DeviceMemoryManager, PageRequest};
use crate::suballoc::{
    AllocationId, AllocationOrigin, FreeOutcome, LiveSubAllocation, PageState, PageStats,
    SlotStatus, SubAllocation, SubresourceAllocator,
};

// =============================================================================
// REQUEST
// =============================================================================

/// Sub-allocation request against one memory type
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceRequest {
    /// Size in bytes
    pub size: u64,
    /// Power-of-two alignment
    pub alignment: u64,
    /// Buffer or image page
    pub shape: ResourceShape,
    /// Accounting category
    pub category: AllocationCategory,
    /// Creation site
    pub tag: &'static str,
    /// Owner cookie
    pub owner: u64,
    /// Residency priority for a new page; the heap default when `None`
    pub priority: Option<f32>,
}

impl ResourceRequest {
    fn validate(&self) -> Result<()> {
        if self.size == 0 || !is_valid_alignment(self.alignment) {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Heap statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Memory type index
    pub memory_type_index: u32,
    /// Pages with live allocations
    pub used_pages: usize,
    /// Empty pages retained for reuse
    pub retained_pages: usize,
    /// Pages being evicted
    pub evicting_pages: usize,
    /// Dedicated pages
    pub dedicated_pages: usize,
    /// Bytes of all pages
    pub reserved_bytes: u64,
    /// Bytes held by live allocations
    pub used_bytes: u64,
    /// Live allocations
    pub live_allocations: u64,
    /// Live bytes per category
    pub category_bytes: [u64; AllocationCategory::COUNT],
    /// Pages requested from the device
    pub pages_created: u64,
    /// Pages returned to the device
    pub pages_released: u64,
}

// =============================================================================
// RESOURCE HEAP
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct RetainedPage {
    page: PageId,
    since: u64,
}

#[derive(Debug, Default)]
struct HeapPages {
    pages: HashMap<PageId, SubresourceAllocator>,
    used: [Vec<PageId>; ResourceShape::COUNT],
    free: [Vec<RetainedPage>; ResourceShape::COUNT],
    epoch: u64,
    pages_created: u64,
    pages_released: u64,
}

impl HeapPages {
    fn try_used(&mut self, request: &ResourceRequest) -> Option<SubAllocation> {
        let Self { pages, used, .. } = self;
        used[request.shape.index()].iter().find_map(|id| {
            pages.get_mut(id)?.try_allocate(
                request.size,
                request.alignment,
                request.category,
                request.tag,
                request.owner,
            )
        })
    }

    fn try_promote(&mut self, request: &ResourceRequest) -> Option<SubAllocation> {
        let shape = request.shape.index();
        for i in 0..self.free[shape].len() {
            let id = self.free[shape][i].page;
            let Some(page) = self.pages.get_mut(&id) else {
                continue;
            };
            if let Some(allocation) = page.try_allocate(
                request.size,
                request.alignment,
                request.category,
                request.tag,
                request.owner,
            ) {
                self.free[shape].remove(i);
                self.used[shape].push(id);
                return Some(allocation);
            }
        }
        None
    }

    /// Page became empty: retain it or hand it back for release
    fn retire(&mut self, id: PageId) -> Option<DeviceMemoryAllocation> {
        let page = self.pages.get(&id)?;
        let shape = page.shape().index();
        self.used[shape].retain(|p| *p != id);

        if page.memory().is_dedicated() || page.state() == PageState::Evicting {
            self.pages_released += 1;
            return self.pages.remove(&id).map(SubresourceAllocator::into_memory);
        }
        self.free[shape].push(RetainedPage {
            page: id,
            since: self.epoch,
        });
        None
    }
}

/// Pages of one memory type
#[derive(Debug)]
pub struct ResourceHeap {
    memory_type_index: u32,
    page_sizes: [u64; ResourceShape::COUNT],
    retention_epochs: u64,
    priority: f32,
    pages: Mutex<HeapPages>,
}

impl ResourceHeap {
    /// Create an empty heap for a memory type backed by `heap_size` bytes
    pub fn new(memory_type_index: u32, heap_size: u64, config: &AllocatorConfig) -> Self {
        let page_sizes = ResourceShape::ALL.map(|shape| config.page_size.page_size(heap_size, shape));
        log::debug!(
            "heap for type {}: buffer pages {} bytes, image pages {} bytes",
            memory_type_index,
            page_sizes[ResourceShape::Buffer.index()],
            page_sizes[ResourceShape::Image.index()]
        );
        Self {
            memory_type_index,
            page_sizes,
            retention_epochs: config.retention_epochs,
            priority: config.page_priority,
            pages: Mutex::new(HeapPages::default()),
        }
    }

    /// Memory type index
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Default page size for a shape
    pub fn page_size(&self, shape: ResourceShape) -> u64 {
        self.page_sizes[shape.index()]
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Allocate from an existing page, a retained page, or a new page.
    ///
    /// Requests larger than the default page size get a dedicated page of
    /// exactly that size.
    pub fn allocate<B: DeviceMemoryBackend>(
        &self,
        request: &ResourceRequest,
        device: &DeviceMemoryManager<B>,
    ) -> Result<SubAllocation> {
        request.validate()?;
        let page_size = self.page_size(request.shape);
        let dedicated = request.size > page_size;

        if !dedicated {
            let mut pages = self.pages.lock();
            if let Some(allocation) = pages.try_used(request) {
                return Ok(allocation);
            }
            if let Some(allocation) = pages.try_promote(request) {
                return Ok(allocation);
            }
        }

        let memory = self.request_page(request, page_size.max(request.size), dedicated, device)?;
        let mut page = SubresourceAllocator::new(memory, request.shape, AllocationOrigin::Heap);
        let allocation = match page.try_allocate(
            request.size,
            request.alignment,
            request.category,
            request.tag,
            request.owner,
        ) {
            Some(allocation) => allocation,
            None => {
                device.free(page.into_memory());
                return Err(Error::PageAllocationFailed);
            }
        };

        let id = page.page_id();
        let mut pages = self.pages.lock();
        pages.pages.insert(id, page);
        pages.used[request.shape.index()].push(id);
        pages.pages_created += 1;
        Ok(allocation)
    }

    /// Ask the device for a page, retrying with the exact request size
    fn request_page<B: DeviceMemoryBackend>(
        &self,
        request: &ResourceRequest,
        size: u64,
        dedicated: bool,
        device: &DeviceMemoryManager<B>,
    ) -> Result<DeviceMemoryAllocation> {
        let page_request = PageRequest {
            size,
            memory_type_index: self.memory_type_index,
            priority: request.priority.unwrap_or(self.priority).clamp(0.0, 1.0),
            dedicated,
            tag: request.tag,
        };
        match device.allocate(&page_request) {
            Err(Error::PageAllocationFailed) if size > request.size => {
                log::warn!(
                    "type {}: {} byte page unavailable, retrying with {} bytes",
                    self.memory_type_index,
                    size,
                    request.size
                );
                device.allocate(&PageRequest {
                    size: request.size,
                    dedicated: true,
                    ..page_request
                })
            }
            result => result,
        }
    }

    // -------------------------------------------------------------------------
    // Release
    // -------------------------------------------------------------------------

    /// Mark an allocation as waiting on deferred deletion
    pub fn mark_free_pending(&self, id: AllocationId) -> Result<()> {
        let mut pages = self.pages.lock();
        let page = pages.pages.get_mut(&id.page()).ok_or(Error::UseAfterFree)?;
        page.mark_free_pending(id)
    }

    /// Slot status of an allocation
    pub fn status(&self, id: AllocationId) -> Result<SlotStatus> {
        let pages = self.pages.lock();
        let page = pages.pages.get(&id.page()).ok_or(Error::UseAfterFree)?;
        page.status(id)
    }

    /// Return an allocation to its page
    pub fn free<B: DeviceMemoryBackend>(
        &self,
        id: AllocationId,
        device: &DeviceMemoryManager<B>,
    ) -> Result<FreeOutcome> {
        let mut pages = self.pages.lock();
        let page = pages.pages.get_mut(&id.page()).ok_or(Error::UseAfterFree)?;
        let outcome = page.free(id)?;
        let released = if outcome.reclaimable {
            pages.retire(id.page())
        } else {
            None
        };
        drop(pages);

        if let Some(memory) = released {
            device.free(memory);
        }
        Ok(outcome)
    }

    /// Release retained pages older than the retention window.
    ///
    /// Returns the number of pages released.
    pub fn reclaim<B: DeviceMemoryBackend>(&self, epoch: u64, device: &DeviceMemoryManager<B>) -> usize {
        self.release_retained_pages(Some(epoch), device)
    }

    /// Release every retained page regardless of age
    pub fn release_retained<B: DeviceMemoryBackend>(&self, device: &DeviceMemoryManager<B>) -> usize {
        self.release_retained_pages(None, device)
    }

    fn release_retained_pages<B: DeviceMemoryBackend>(
        &self,
        epoch: Option<u64>,
        device: &DeviceMemoryManager<B>,
    ) -> usize {
        let retention = self.retention_epochs;
        let expired = {
            let mut guard = self.pages.lock();
            if let Some(epoch) = epoch {
                guard.epoch = epoch;
            }
            let HeapPages { pages, free, pages_released, .. } = &mut *guard;
            let mut expired = Vec::new();
            for list in free.iter_mut() {
                list.retain(|retained| {
                    if let Some(epoch) = epoch {
                        if epoch.saturating_sub(retained.since) < retention {
                            return true;
                        }
                    }
                    if let Some(page) = pages.remove(&retained.page) {
                        expired.push(page.into_memory());
                        *pages_released += 1;
                    }
                    false
                });
            }
            expired
        };

        let count = expired.len();
        for memory in expired {
            device.free(memory);
        }
        if count > 0 {
            log::debug!("type {}: released {} retained pages", self.memory_type_index, count);
        }
        count
    }

    /// Release every page, reporting live allocations as leaks
    pub fn teardown<B: DeviceMemoryBackend>(
        &self,
        device: &DeviceMemoryManager<B>,
    ) -> Vec<LiveSubAllocation> {
        let drained: Vec<SubresourceAllocator> = {
            let mut pages = self.pages.lock();
            for list in pages.used.iter_mut() {
                list.clear();
            }
            for list in pages.free.iter_mut() {
                list.clear();
            }
            let drained: Vec<_> = pages.pages.drain().map(|(_, page)| page).collect();
            pages.pages_released += drained.len() as u64;
            drained
        };

        let mut leaks = Vec::new();
        for page in drained {
            for leak in page.live() {
                log::error!(
                    "{}: {} bytes at offset {} of page {} ({}, {})",
                    Error::LeakedAllocation,
                    leak.size,
                    leak.offset,
                    leak.id.page(),
                    leak.category.name(),
                    leak.tag
                );
                leaks.push(leak);
            }
            device.free(page.into_memory());
        }
        leaks
    }

    // -------------------------------------------------------------------------
    // Eviction support
    // -------------------------------------------------------------------------

    /// Image pages eligible for eviction, in registration order
    pub fn eviction_candidates(&self) -> Vec<PageStats> {
        let pages = self.pages.lock();
        pages.used[ResourceShape::Image.index()]
            .iter()
            .filter_map(|id| pages.pages.get(id))
            .filter(|page| page.is_eviction_candidate())
            .map(SubresourceAllocator::stats)
            .collect()
    }

    /// Mark a page evicting and return the allocations to migrate
    pub fn begin_eviction(&self, page: PageId) -> Result<Vec<LiveSubAllocation>> {
        let mut pages = self.pages.lock();
        let page = pages.pages.get_mut(&page).ok_or(Error::NotFound)?;
        if !page.is_eviction_candidate() {
            return Err(Error::InvalidParameter);
        }
        page.begin_eviction();
        Ok(page.live().filter(|a| !a.pending).collect())
    }

    /// Bytes still held by evicting pages
    pub fn pending_eviction_bytes(&self) -> u64 {
        self.pages
            .lock()
            .pages
            .values()
            .filter(|page| page.state() == PageState::Evicting)
            .map(SubresourceAllocator::used_bytes)
            .sum()
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    /// Heap statistics
    pub fn stats(&self) -> HeapStats {
        let pages = self.pages.lock();
        let mut stats = HeapStats {
            memory_type_index: self.memory_type_index,
            used_pages: pages.used.iter().map(Vec::len).sum(),
            retained_pages: pages.free.iter().map(Vec::len).sum(),
            pages_created: pages.pages_created,
            pages_released: pages.pages_released,
            ..HeapStats::default()
        };
        for page in pages.pages.values() {
            if page.state() == PageState::Evicting {
                stats.evicting_pages += 1;
            }
            if page.memory().is_dedicated() {
                stats.dedicated_pages += 1;
            }
            stats.reserved_bytes += page.size();
            stats.used_bytes += page.used_bytes();
            stats.live_allocations += u64::from(page.live_count());
            for category in AllocationCategory::ALL {
                stats.category_bytes[category.index()] += page.category_bytes(category);
            }
        }
        stats
    }

    /// Statistics of every page
    pub fn page_stats(&self) -> Vec<PageStats> {
        let pages = self.pages.lock();
        pages.pages.values().map(SubresourceAllocator::stats).collect()
    }

    /// Run the free-list check on every page
    pub fn verify(&self) -> bool {
        self.pages.lock().pages.values().all(SubresourceAllocator::verify)
    }
}
