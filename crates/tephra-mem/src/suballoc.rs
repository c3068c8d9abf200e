//! # Subresource Allocator
//!
//! First-fit free-list allocator over one device page.
//!
//! ## Layout
//!
//! ```text
//! page:  |--A--|pad|----B----|.......free.......|--C--|...free...|
//!         ^0          ^112                          ^offset
//! free list (sorted, never adjacent): [{312, 400}, {812, 212}]
//! ```
//!
//! Metadata for every sub-allocation lives in a slot arena. Callers hold an
//! [`AllocationId`] of `(page, slot, generation)`; recycled slots bump their
//! generation so stale ids are caught instead of freeing someone else's range.

use alloc::vec::Vec;
use core::ptr::NonNull;

use tephra_core::{
    align_up, is_valid_alignment, AllocationCategory, DeviceMemoryHandle, Error,
    MemoryPropertyFlags, PageId, ResourceShape, Result,
};

use crate::device::{DeviceMemoryAllocation, MemoryBinding};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Which layer owns the page an allocation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationOrigin {
    /// A [`ResourceHeap`](crate::heap::ResourceHeap) page
    Heap,
    /// A [`PooledBufferAllocator`](crate::pool::PooledBufferAllocator) page
    Pool,
}

/// Opaque, copyable identity of one sub-allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationId {
    page: PageId,
    slot: u32,
    generation: u32,
    memory_type_index: u32,
    origin: AllocationOrigin,
}

impl AllocationId {
    /// Page the allocation lives in
    pub fn page(&self) -> PageId {
        self.page
    }

    /// Slot index in the page's metadata arena
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Slot generation
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Memory type index of the page
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Owning layer
    pub fn origin(&self) -> AllocationOrigin {
        self.origin
    }
}

// =============================================================================
// SUB-ALLOCATION
// =============================================================================

/// A caller-visible slice of a page.
///
/// Not `Clone`: freeing consumes it, so the same handle cannot be freed twice
/// through safe code. The [`AllocationId`] can still be copied out for
/// bookkeeping, and stale ids are rejected at runtime.
#[derive(Debug)]
#[must_use = "dropping a SubAllocation leaks its range until teardown"]
pub struct SubAllocation {
    id: AllocationId,
    binding: MemoryBinding,
    offset: u64,
    size: u64,
    padding: u64,
    category: AllocationCategory,
    tag: &'static str,
    owner: u64,
}

impl SubAllocation {
    /// Identity
    pub fn id(&self) -> AllocationId {
        self.id
    }

    /// Aligned offset inside the page
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Requested size
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes skipped before `offset` to satisfy alignment
    pub fn padding(&self) -> u64 {
        self.padding
    }

    /// Accounting category
    pub fn category(&self) -> AllocationCategory {
        self.category
    }

    /// Creation site
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Opaque owner cookie supplied at allocation
    pub fn owner(&self) -> u64 {
        self.owner
    }

    /// Raw memory handle of the backing page
    pub fn memory(&self) -> DeviceMemoryHandle {
        self.binding.handle
    }

    /// Page binding info
    pub fn binding(&self) -> &MemoryBinding {
        &self.binding
    }

    /// Memory type capabilities
    pub fn flags(&self) -> MemoryPropertyFlags {
        self.binding.flags
    }

    /// Host pointer to the first byte, if the page is mapped
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.binding
            .mapped
            .and_then(|base| base.offset(self.offset))
            .map(|ptr| ptr.as_non_null())
    }

    pub(crate) fn into_id(self) -> AllocationId {
        self.id
    }
}

// =============================================================================
// SLOT ARENA
// =============================================================================

/// Lifecycle of one metadata slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// Never handed out
    Unused,
    /// Live
    Allocated,
    /// Free requested, waiting on the GPU
    FreePending,
    /// Range returned; slot waiting for reuse
    Freed,
}

#[derive(Debug, Clone, Copy)]
struct SlotRecord {
    offset: u64,
    size: u64,
    padding: u64,
    alignment: u64,
    category: AllocationCategory,
    tag: &'static str,
    owner: u64,
}

#[derive(Debug, Clone, Copy)]
enum SlotState {
    Unused,
    Allocated(SlotRecord),
    FreePending(SlotRecord),
    Freed,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    generation: u32,
    state: SlotState,
}

/// Metadata of a live sub-allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveSubAllocation {
    /// Identity
    pub id: AllocationId,
    /// Aligned offset
    pub offset: u64,
    /// Size
    pub size: u64,
    /// Requested alignment
    pub alignment: u64,
    /// Category
    pub category: AllocationCategory,
    /// Creation site
    pub tag: &'static str,
    /// Owner cookie
    pub owner: u64,
    /// Free already requested
    pub pending: bool,
}

// =============================================================================
// PAGE STATE
// =============================================================================

/// Whether a page accepts new sub-allocations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Normal operation
    Active,
    /// Contents being migrated; refuses new sub-allocations
    Evicting,
}

/// A free byte range inside a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRange {
    /// Start offset
    pub offset: u64,
    /// Length
    pub size: u64,
}

impl FreeRange {
    /// One past the last byte
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Result of returning a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeOutcome {
    /// Bytes returned, padding included
    pub bytes: u64,
    /// Category of the freed allocation
    pub category: AllocationCategory,
    /// Page is now empty with a single free range spanning it
    pub reclaimable: bool,
}

/// Per-page statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageStats {
    /// Page id
    pub page: PageId,
    /// Memory type index
    pub memory_type_index: u32,
    /// Resource shape served
    pub shape: ResourceShape,
    /// Page size
    pub size: u64,
    /// Bytes held by live allocations, padding included
    pub used: u64,
    /// Bytes on the free list
    pub free: u64,
    /// Live allocations
    pub live: u32,
    /// Largest free range
    pub largest_free: u64,
    /// Free ranges
    pub free_ranges: usize,
    /// `1 - largest_free / free`
    pub fragmentation: f32,
    /// Live bytes per category
    pub category_bytes: [u64; AllocationCategory::COUNT],
    /// Page state
    pub state: PageState,
    /// Dedicated page
    pub dedicated: bool,
}

// =============================================================================
// SUBRESOURCE ALLOCATOR
// =============================================================================

/// Sub-allocates one device page with a sorted, coalescing free list
#[derive(Debug)]
pub struct SubresourceAllocator {
    memory: DeviceMemoryAllocation,
    shape: ResourceShape,
    origin: AllocationOrigin,
    state: PageState,
    free_ranges: Vec<FreeRange>,
    slots: Vec<Slot>,
    recycled: Vec<u32>,
    used_bytes: u64,
    live_count: u32,
    category_bytes: [u64; AllocationCategory::COUNT],
}

impl SubresourceAllocator {
    /// Take ownership of a page; the whole page starts free
    pub fn new(memory: DeviceMemoryAllocation, shape: ResourceShape, origin: AllocationOrigin) -> Self {
        let size = memory.size();
        Self {
            memory,
            shape,
            origin,
            state: PageState::Active,
            free_ranges: alloc::vec![FreeRange { offset: 0, size }],
            slots: Vec::new(),
            recycled: Vec::new(),
            used_bytes: 0,
            live_count: 0,
            category_bytes: [0; AllocationCategory::COUNT],
        }
    }

    /// Page id
    pub fn page_id(&self) -> PageId {
        self.memory.page_id()
    }

    /// Page size
    pub fn size(&self) -> u64 {
        self.memory.size()
    }

    /// Resource shape
    pub fn shape(&self) -> ResourceShape {
        self.shape
    }

    /// Backing page
    pub fn memory(&self) -> &DeviceMemoryAllocation {
        &self.memory
    }

    /// Page state
    pub fn state(&self) -> PageState {
        self.state
    }

    /// Bytes held by live allocations
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    /// Bytes on the free list
    pub fn free_bytes(&self) -> u64 {
        self.size() - self.used_bytes
    }

    /// Live allocations (pending frees included)
    pub fn live_count(&self) -> u32 {
        self.live_count
    }

    /// Sorted free list
    pub fn free_ranges(&self) -> &[FreeRange] {
        &self.free_ranges
    }

    /// Live bytes of one category
    pub fn category_bytes(&self, category: AllocationCategory) -> u64 {
        self.category_bytes[category.index()]
    }

    /// Largest free range
    pub fn largest_free(&self) -> u64 {
        self.free_ranges.iter().map(|r| r.size).max().unwrap_or(0)
    }

    /// Empty, with one free range spanning the page
    pub fn is_reclaimable(&self) -> bool {
        self.live_count == 0
            && self.free_ranges.len() == 1
            && self.free_ranges[0] == FreeRange { offset: 0, size: self.size() }
    }

    /// Stop accepting new sub-allocations
    pub fn begin_eviction(&mut self) {
        self.state = PageState::Evicting;
    }

    /// Release the page; caller guarantees nothing is live
    pub fn into_memory(self) -> DeviceMemoryAllocation {
        self.memory
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// First-fit allocation at the lowest offset whose aligned remainder fits.
    ///
    /// Returns `None` when nothing fits or the page is evicting; that is the
    /// caller's cue to try another page.
    pub fn try_allocate(
        &mut self,
        size: u64,
        alignment: u64,
        category: AllocationCategory,
        tag: &'static str,
        owner: u64,
    ) -> Option<SubAllocation> {
        if self.state == PageState::Evicting || size == 0 || !is_valid_alignment(alignment) {
            return None;
        }

        let (index, offset, padding) = self.free_ranges.iter().enumerate().find_map(|(i, range)| {
            let aligned = align_up(range.offset, alignment)?;
            let padding = aligned - range.offset;
            let needed = padding.checked_add(size)?;
            (needed <= range.size).then_some((i, aligned, padding))
        })?;

        let consumed = padding + size;
        let range = &mut self.free_ranges[index];
        if consumed == range.size {
            self.free_ranges.remove(index);
        } else {
            range.offset += consumed;
            range.size -= consumed;
        }

        let record = SlotRecord {
            offset,
            size,
            padding,
            alignment,
            category,
            tag,
            owner,
        };
        let slot = match self.recycled.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.generation = entry.generation.wrapping_add(1);
                entry.state = SlotState::Allocated(record);
                slot
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    state: SlotState::Allocated(record),
                });
                (self.slots.len() - 1) as u32
            }
        };

        self.used_bytes += consumed;
        self.live_count += 1;
        self.category_bytes[category.index()] += size;
        self.check();

        Some(SubAllocation {
            id: AllocationId {
                page: self.page_id(),
                slot,
                generation: self.slots[slot as usize].generation,
                memory_type_index: self.memory.memory_type_index(),
                origin: self.origin,
            },
            binding: self.memory.binding(),
            offset,
            size,
            padding,
            category,
            tag,
            owner,
        })
    }

    // -------------------------------------------------------------------------
    // Release
    // -------------------------------------------------------------------------

    fn slot_index(&self, id: AllocationId) -> Result<usize> {
        if id.page != self.page_id() {
            return Err(Error::NotFound);
        }
        let slot = self.slots.get(id.slot as usize).ok_or(Error::UseAfterFree)?;
        if slot.generation != id.generation {
            return Err(Error::UseAfterFree);
        }
        match slot.state {
            SlotState::Unused => Err(Error::UseAfterFree),
            SlotState::Freed => Err(Error::DoubleFree),
            SlotState::Allocated(_) | SlotState::FreePending(_) => Ok(id.slot as usize),
        }
    }

    /// Current state of the slot an id refers to
    pub fn status(&self, id: AllocationId) -> Result<SlotStatus> {
        if id.page != self.page_id() {
            return Err(Error::NotFound);
        }
        let slot = self.slots.get(id.slot as usize).ok_or(Error::UseAfterFree)?;
        if slot.generation != id.generation {
            return Err(Error::UseAfterFree);
        }
        Ok(match slot.state {
            SlotState::Unused => SlotStatus::Unused,
            SlotState::Allocated(_) => SlotStatus::Allocated,
            SlotState::FreePending(_) => SlotStatus::FreePending,
            SlotState::Freed => SlotStatus::Freed,
        })
    }

    /// `Allocated -> FreePending`
    pub fn mark_free_pending(&mut self, id: AllocationId) -> Result<()> {
        let index = self.slot_index(id)?;
        let slot = &mut self.slots[index];
        match slot.state {
            SlotState::Allocated(record) => {
                slot.state = SlotState::FreePending(record);
                Ok(())
            }
            _ => Err(Error::DoubleFree),
        }
    }

    /// Return an allocation's range, coalescing with both neighbours
    pub fn free(&mut self, id: AllocationId) -> Result<FreeOutcome> {
        let index = self.slot_index(id)?;
        let record = match self.slots[index].state {
            SlotState::Allocated(record) | SlotState::FreePending(record) => record,
            SlotState::Unused | SlotState::Freed => return Err(Error::DoubleFree),
        };

        let bytes = record.padding + record.size;
        self.insert_free_range(record.offset - record.padding, bytes);
        self.slots[index].state = SlotState::Freed;
        self.recycled.push(index as u32);

        self.used_bytes -= bytes;
        self.live_count -= 1;
        self.category_bytes[record.category.index()] -= record.size;
        self.check();

        Ok(FreeOutcome {
            bytes,
            category: record.category,
            reclaimable: self.is_reclaimable(),
        })
    }

    fn insert_free_range(&mut self, offset: u64, size: u64) {
        let index = self.free_ranges.partition_point(|r| r.offset < offset);
        let merge_prev = index > 0 && self.free_ranges[index - 1].end() == offset;
        let merge_next =
            index < self.free_ranges.len() && offset + size == self.free_ranges[index].offset;

        match (merge_prev, merge_next) {
            (true, true) => {
                let next = self.free_ranges.remove(index);
                self.free_ranges[index - 1].size += size + next.size;
            }
            (true, false) => self.free_ranges[index - 1].size += size,
            (false, true) => {
                let next = &mut self.free_ranges[index];
                next.offset = offset;
                next.size += size;
            }
            (false, false) => self.free_ranges.insert(index, FreeRange { offset, size }),
        }
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Live allocations in slot order
    pub fn live(&self) -> impl Iterator<Item = LiveSubAllocation> + '_ {
        let page = self.page_id();
        let memory_type_index = self.memory.memory_type_index();
        let origin = self.origin;
        self.slots.iter().enumerate().filter_map(move |(i, slot)| {
            let (record, pending) = match slot.state {
                SlotState::Allocated(record) => (record, false),
                SlotState::FreePending(record) => (record, true),
                SlotState::Unused | SlotState::Freed => return None,
            };
            Some(LiveSubAllocation {
                id: AllocationId {
                    page,
                    slot: i as u32,
                    generation: slot.generation,
                    memory_type_index,
                    origin,
                },
                offset: record.offset,
                size: record.size,
                alignment: record.alignment,
                category: record.category,
                tag: record.tag,
                owner: record.owner,
                pending,
            })
        })
    }

    /// Image page whose allocations are all evictable and at least one is
    /// not already on its way out
    pub fn is_eviction_candidate(&self) -> bool {
        self.state == PageState::Active
            && self.shape == ResourceShape::Image
            && self.live().any(|a| !a.pending)
            && self.live().all(|a| a.category.is_evictable())
    }

    /// Snapshot of the page statistics
    pub fn stats(&self) -> PageStats {
        let free = self.free_bytes();
        let largest_free = self.largest_free();
        PageStats {
            page: self.page_id(),
            memory_type_index: self.memory.memory_type_index(),
            shape: self.shape,
            size: self.size(),
            used: self.used_bytes,
            free,
            live: self.live_count,
            largest_free,
            free_ranges: self.free_ranges.len(),
            fragmentation: if free == 0 {
                0.0
            } else {
                1.0 - (largest_free as f64 / free as f64) as f32
            },
            category_bytes: self.category_bytes,
            state: self.state,
            dedicated: self.memory.is_dedicated(),
        }
    }

    /// Check the free list and byte accounting.
    ///
    /// Ranges are sorted, in bounds, non-empty, neither overlapping nor
    /// adjacent, and free + used equals the page size.
    pub fn verify(&self) -> bool {
        let size = self.size();
        let mut free = 0u64;
        let mut prev_end: Option<u64> = None;
        for range in &self.free_ranges {
            if range.size == 0 || range.end() > size {
                return false;
            }
            if let Some(end) = prev_end {
                if range.offset <= end {
                    return false;
                }
            }
            prev_end = Some(range.end());
            free += range.size;
        }

        let (live, live_bytes) = self
            .live()
            .fold((0u32, 0u64), |(n, b), a| (n + 1, b + a.size));
        let padding: u64 = self
            .slots
            .iter()
            .filter_map(|s| match s.state {
                SlotState::Allocated(r) | SlotState::FreePending(r) => Some(r.padding),
                _ => None,
            })
            .sum();

        free + self.used_bytes == size
            && live == self.live_count
            && live_bytes + padding == self.used_bytes
    }

    #[inline]
    fn check(&self) {
        if cfg!(feature = "debug-alloc") && !self.verify() {
            log::error!("page {}: free list corrupted: {:?}", self.page_id(), self.free_ranges);
            debug_assert!(false, "free list invariant violated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceMemoryManager, PageRequest};
    use tephra_core::HostBackend;

    fn device() -> DeviceMemoryManager<HostBackend> {
        DeviceMemoryManager::new(HostBackend::discrete(1 << 20, 1 << 20))
    }

    fn page(device: &DeviceMemoryManager<HostBackend>, size: u64) -> SubresourceAllocator {
        let memory = device
            .allocate(&PageRequest {
                size,
                memory_type_index: 0,
                priority: 0.5,
                dedicated: false,
                tag: "test",
            })
            .unwrap();
        SubresourceAllocator::new(memory, ResourceShape::Buffer, AllocationOrigin::Heap)
    }

    fn alloc(page: &mut SubresourceAllocator, size: u64, alignment: u64) -> SubAllocation {
        page.try_allocate(size, alignment, AllocationCategory::Buffer, "test", 0)
            .unwrap()
    }

    fn release(device: &DeviceMemoryManager<HostBackend>, page: SubresourceAllocator) {
        device.free(page.into_memory());
    }

    #[test]
    fn test_first_fit_reuses_lowest_coalesced_range() {
        let device = device();
        let mut page = page(&device, 1024);

        let a = alloc(&mut page, 100, 16);
        assert_eq!(a.offset(), 0);
        let b = alloc(&mut page, 200, 16);
        assert_eq!(b.offset(), 112);
        assert_eq!(b.padding(), 12);

        // B keeps its 12 bytes of padding; A's range is returned alone
        page.free(a.into_id()).unwrap();
        assert_eq!(page.free_ranges()[0], FreeRange { offset: 0, size: 100 });

        let c = alloc(&mut page, 96, 16);
        assert_eq!(c.offset(), 0);
        assert!(page.verify());

        page.free(b.into_id()).unwrap();
        page.free(c.into_id()).unwrap();
        assert!(page.is_reclaimable());
        release(&device, page);
    }

    #[test]
    fn test_full_page_becomes_reclaimable() {
        let device = device();
        let mut page = page(&device, 1024);

        let d = alloc(&mut page, 1024, 256);
        assert!(page.free_ranges().is_empty());
        assert!(page.try_allocate(1, 1, AllocationCategory::Buffer, "test", 0).is_none());

        let outcome = page.free(d.into_id()).unwrap();
        assert!(outcome.reclaimable);
        assert_eq!(outcome.bytes, 1024);
        assert_eq!(page.free_ranges(), &[FreeRange { offset: 0, size: 1024 }]);
        release(&device, page);
    }

    #[test]
    fn test_double_free_rejected_without_corruption() {
        let device = device();
        let mut page = page(&device, 1024);

        let a = alloc(&mut page, 64, 1);
        let _b = alloc(&mut page, 64, 1);
        let id = a.into_id();
        page.free(id).unwrap();
        let before = page.free_ranges().to_vec();

        assert_eq!(page.free(id), Err(Error::DoubleFree));
        assert_eq!(page.free_ranges(), &before[..]);
        assert!(page.verify());

        // Slot recycled: the old id is now stale
        let c = alloc(&mut page, 32, 1);
        assert_eq!(c.id().slot(), id.slot());
        assert_eq!(page.free(id), Err(Error::UseAfterFree));
        assert_eq!(page.status(c.id()), Ok(SlotStatus::Allocated));
        release(&device, page);
    }

    #[test]
    fn test_pending_free_lifecycle() {
        let device = device();
        let mut page = page(&device, 1024);

        let a = alloc(&mut page, 64, 1);
        let id = a.id();
        page.mark_free_pending(id).unwrap();
        assert_eq!(page.status(id), Ok(SlotStatus::FreePending));
        assert_eq!(page.mark_free_pending(id), Err(Error::DoubleFree));
        assert_eq!(page.live_count(), 1);

        page.free(a.into_id()).unwrap();
        assert_eq!(page.status(id), Ok(SlotStatus::Freed));
        release(&device, page);
    }

    #[test]
    fn test_offsets_respect_alignment() {
        let device = device();
        let mut page = page(&device, 64 * 1024);
        let mut live = Vec::new();

        for (i, alignment) in [1u64, 4, 16, 64, 256, 1024, 8, 2].iter().cycle().take(40).enumerate() {
            let a = alloc(&mut page, 37 + i as u64 * 13, *alignment);
            assert_eq!(a.offset() % alignment, 0);
            live.push(a);
        }
        assert!(page.verify());
        for a in live {
            page.free(a.into_id()).unwrap();
        }
        assert!(page.is_reclaimable());
        release(&device, page);
    }

    #[test]
    fn test_invariants_hold_over_mixed_sequence() {
        let device = device();
        let mut page = page(&device, 8192);
        let mut live: Vec<SubAllocation> = Vec::new();

        // Deterministic pseudo-random walk
        let mut seed = 0x2545_f491_u64;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let roll = (seed >> 33) as usize;
            if roll % 3 == 0 && !live.is_empty() {
                let victim = live.swap_remove(roll % live.len());
                page.free(victim.into_id()).unwrap();
            } else {
                let size = 1 + (roll % 300) as u64;
                let alignment = 1u64 << (roll % 7);
                if let Some(a) = page.try_allocate(size, alignment, AllocationCategory::Transient, "walk", 0) {
                    assert_eq!(a.offset() % alignment, 0);
                    live.push(a);
                }
            }

            assert!(page.verify());
            let free: u64 = page.free_ranges().iter().map(|r| r.size).sum();
            assert_eq!(free + page.used_bytes(), page.size());
            for pair in page.free_ranges().windows(2) {
                assert!(pair[0].end() < pair[1].offset);
            }
        }

        for a in live {
            page.free(a.into_id()).unwrap();
        }
        assert!(page.is_reclaimable());
        release(&device, page);
    }

    #[test]
    fn test_evicting_page_refuses_allocations() {
        let device = device();
        let mut page = page(&device, 1024);
        page.begin_eviction();
        assert!(page.try_allocate(16, 1, AllocationCategory::Image, "test", 0).is_none());
        release(&device, page);
    }

    #[test]
    fn test_category_accounting() {
        let device = device();
        let mut page = page(&device, 4096);
        let a = page
            .try_allocate(100, 1, AllocationCategory::ConstantBuffer, "test", 0)
            .unwrap();
        let b = page
            .try_allocate(300, 1, AllocationCategory::Staging, "test", 0)
            .unwrap();
        assert_eq!(page.category_bytes(AllocationCategory::ConstantBuffer), 100);
        assert_eq!(page.category_bytes(AllocationCategory::Staging), 300);

        page.free(a.into_id()).unwrap();
        assert_eq!(page.category_bytes(AllocationCategory::ConstantBuffer), 0);
        let stats = page.stats();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.used, 300);
        page.free(b.into_id()).unwrap();
        release(&device, page);
    }

    #[test]
    fn test_invalid_requests_refused() {
        let device = device();
        let mut page = page(&device, 1024);
        assert!(page.try_allocate(0, 16, AllocationCategory::Buffer, "test", 0).is_none());
        assert!(page.try_allocate(16, 3, AllocationCategory::Buffer, "test", 0).is_none());
        assert!(page.try_allocate(2048, 1, AllocationCategory::Buffer, "test", 0).is_none());
        release(&device, page);
    }
}
