//! # Pooled Buffer Allocator
//!
//! Size-classed shared pages for small, high-frequency buffers.
//!
//! A request is rounded up to its size class and served from a bucket keyed
//! by `(class, flags, memory type)`. Each bucket owns shared pages sized to
//! hold many instances of its class, so constant-buffer churn never reaches
//! the device allocator.

use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::Mutex;

use tephra_core::{
    is_valid_alignment, AllocationCategory, DeviceMemoryBackend, Error, MemoryPropertyFlags,
    PageId, ResourceShape, Result,
};

use crate::config::{AllocatorConfig, PoolConfig};
use crate::device::{DeviceMemoryAllocation, DeviceMemoryManager, PageRequest};
use crate::suballoc::{
    AllocationId, AllocationOrigin, FreeOutcome, LiveSubAllocation, SlotStatus, SubAllocation,
    SubresourceAllocator,
};

// =============================================================================
// BUCKETS
// =============================================================================

/// Bucket key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// Index into the configured size classes
    pub class_index: usize,
    /// Required capability flags
    pub flags: MemoryPropertyFlags,
    /// Memory type the pages come from
    pub memory_type_index: u32,
}

/// Pooled request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRequest {
    /// Requested size; rounded up to a class
    pub size: u64,
    /// Power-of-two alignment
    pub alignment: u64,
    /// Accounting category
    pub category: AllocationCategory,
    /// Required capability flags
    pub flags: MemoryPropertyFlags,
    /// Memory type to allocate pages from
    pub memory_type_index: u32,
    /// Creation site
    pub tag: &'static str,
    /// Owner cookie
    pub owner: u64,
}

#[derive(Debug)]
struct RetainedPage {
    page: SubresourceAllocator,
    since: u64,
}

#[derive(Debug, Default)]
struct Bucket {
    used: Vec<SubresourceAllocator>,
    free: Vec<RetainedPage>,
}

impl Bucket {
    fn find_used(&self, page: PageId) -> Option<usize> {
        self.used.iter().position(|p| p.page_id() == page)
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Non-empty buckets
    pub buckets: usize,
    /// Shared pages with live allocations
    pub used_pages: usize,
    /// Empty shared pages retained for reuse
    pub retained_pages: usize,
    /// Bytes of all shared pages
    pub reserved_bytes: u64,
    /// Bytes held by live allocations
    pub used_bytes: u64,
    /// Live allocations
    pub live_allocations: u64,
    /// Live bytes per category
    pub category_bytes: [u64; AllocationCategory::COUNT],
    /// Allocations served
    pub allocations: u64,
    /// Allocations returned
    pub frees: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    buckets: HashMap<BucketKey, Bucket>,
    page_bucket: HashMap<PageId, BucketKey>,
    epoch: u64,
    allocations: u64,
    frees: u64,
}

// =============================================================================
// POOLED BUFFER ALLOCATOR
// =============================================================================

/// Bucket/slab layer for small buffers
#[derive(Debug)]
pub struct PooledBufferAllocator {
    config: PoolConfig,
    retention_epochs: u64,
    priority: f32,
    state: Mutex<PoolState>,
}

impl PooledBufferAllocator {
    /// Create an empty pool
    pub fn new(config: &AllocatorConfig) -> Self {
        Self {
            config: config.pool,
            retention_epochs: config.retention_epochs,
            priority: config.page_priority,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Largest request the pool serves
    pub fn threshold(&self) -> u64 {
        self.config.threshold()
    }

    /// Size class for a request, if pooled
    pub fn class_size(&self, size: u64) -> Option<u64> {
        self.config
            .class_index(size)
            .map(|i| self.config.size_classes[i])
    }

    /// Allocate a class-sized slice from a shared page
    pub fn allocate<B: DeviceMemoryBackend>(
        &self,
        request: &PoolRequest,
        device: &DeviceMemoryManager<B>,
    ) -> Result<SubAllocation> {
        if request.size == 0 || !is_valid_alignment(request.alignment) {
            return Err(Error::InvalidParameter);
        }
        let class_index = self
            .config
            .class_index(request.size)
            .ok_or(Error::InvalidParameter)?;
        let class_size = self.config.size_classes[class_index];
        let key = BucketKey {
            class_index,
            flags: request.flags,
            memory_type_index: request.memory_type_index,
        };

        let take = |page: &mut SubresourceAllocator| {
            page.try_allocate(
                class_size,
                request.alignment,
                request.category,
                request.tag,
                request.owner,
            )
        };

        {
            let mut state = self.state.lock();
            let bucket = state.buckets.entry(key).or_default();
            let mut hit = bucket.used.iter_mut().find_map(take);
            if hit.is_none() {
                if let Some(i) = bucket.free.iter().position(|r| r.page.free_bytes() >= class_size) {
                    let mut page = bucket.free.remove(i).page;
                    hit = take(&mut page);
                    bucket.used.push(page);
                }
            }
            if let Some(allocation) = hit {
                state.allocations += 1;
                return Ok(allocation);
            }
        }

        let memory = device.allocate(&PageRequest {
            size: self.config.page_size_for(class_size),
            memory_type_index: request.memory_type_index,
            priority: self.priority,
            dedicated: false,
            tag: "pooled buffer page",
        })?;
        log::debug!(
            "pool: new {} byte page for class {} on type {}",
            memory.size(),
            class_size,
            request.memory_type_index
        );

        let mut page = SubresourceAllocator::new(memory, ResourceShape::Buffer, AllocationOrigin::Pool);
        let Some(allocation) = take(&mut page) else {
            device.free(page.into_memory());
            return Err(Error::PageAllocationFailed);
        };

        let mut state = self.state.lock();
        state.page_bucket.insert(page.page_id(), key);
        state.buckets.entry(key).or_default().used.push(page);
        state.allocations += 1;
        Ok(allocation)
    }

    fn with_page<T>(
        &self,
        id: AllocationId,
        f: impl FnOnce(&mut SubresourceAllocator) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let key = *state.page_bucket.get(&id.page()).ok_or(Error::UseAfterFree)?;
        let bucket = state.buckets.get_mut(&key).ok_or(Error::UseAfterFree)?;
        if let Some(i) = bucket.find_used(id.page()) {
            return f(&mut bucket.used[i]);
        }
        // Retained pages only hold freed slots
        match bucket.free.iter_mut().find(|r| r.page.page_id() == id.page()) {
            Some(retained) => f(&mut retained.page),
            None => Err(Error::UseAfterFree),
        }
    }

    /// Mark an allocation as waiting on deferred deletion
    pub fn mark_free_pending(&self, id: AllocationId) -> Result<()> {
        self.with_page(id, |page| page.mark_free_pending(id))
    }

    /// Slot status of an allocation
    pub fn status(&self, id: AllocationId) -> Result<SlotStatus> {
        self.with_page(id, |page| page.status(id))
    }

    /// Return an allocation to its shared page
    pub fn free(&self, id: AllocationId) -> Result<FreeOutcome> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let key = *state.page_bucket.get(&id.page()).ok_or(Error::UseAfterFree)?;
        let bucket = state.buckets.get_mut(&key).ok_or(Error::UseAfterFree)?;
        let Some(i) = bucket.find_used(id.page()) else {
            let retained = bucket.free.iter_mut().find(|r| r.page.page_id() == id.page());
            return match retained {
                Some(r) => r.page.free(id),
                None => Err(Error::UseAfterFree),
            };
        };

        let outcome = bucket.used[i].free(id)?;
        if outcome.reclaimable {
            let page = bucket.used.remove(i);
            bucket.free.push(RetainedPage {
                page,
                since: state.epoch,
            });
        }
        state.frees += 1;
        Ok(outcome)
    }

    /// Release shared pages retained longer than the retention window
    pub fn reclaim<B: DeviceMemoryBackend>(&self, epoch: u64, device: &DeviceMemoryManager<B>) -> usize {
        self.release_retained_pages(Some(epoch), device)
    }

    /// Release every retained shared page
    pub fn release_retained<B: DeviceMemoryBackend>(&self, device: &DeviceMemoryManager<B>) -> usize {
        self.release_retained_pages(None, device)
    }

    fn release_retained_pages<B: DeviceMemoryBackend>(
        &self,
        epoch: Option<u64>,
        device: &DeviceMemoryManager<B>,
    ) -> usize {
        let retention = self.retention_epochs;
        let expired: Vec<DeviceMemoryAllocation> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(epoch) = epoch {
                state.epoch = epoch;
            }
            let mut expired = Vec::new();
            for bucket in state.buckets.values_mut() {
                let mut i = 0;
                while i < bucket.free.len() {
                    let keep = epoch
                        .map(|e| e.saturating_sub(bucket.free[i].since) < retention)
                        .unwrap_or(false);
                    if keep {
                        i += 1;
                        continue;
                    }
                    let retained = bucket.free.swap_remove(i);
                    state.page_bucket.remove(&retained.page.page_id());
                    expired.push(retained.page.into_memory());
                }
            }
            state.buckets.retain(|_, b| !b.used.is_empty() || !b.free.is_empty());
            expired
        };

        let count = expired.len();
        for memory in expired {
            device.free(memory);
        }
        if count > 0 {
            log::debug!("pool: released {} shared pages", count);
        }
        count
    }

    /// Release every shared page, reporting live allocations as leaks
    pub fn teardown<B: DeviceMemoryBackend>(
        &self,
        device: &DeviceMemoryManager<B>,
    ) -> Vec<LiveSubAllocation> {
        let pages: Vec<SubresourceAllocator> = {
            let mut state = self.state.lock();
            state.page_bucket.clear();
            state
                .buckets
                .drain()
                .flat_map(|(_, bucket)| {
                    bucket
                        .used
                        .into_iter()
                        .chain(bucket.free.into_iter().map(|r| r.page))
                })
                .collect()
        };

        let mut leaks = Vec::new();
        for page in pages {
            for leak in page.live() {
                log::error!(
                    "{}: pooled {} bytes on page {} ({}, {})",
                    Error::LeakedAllocation,
                    leak.size,
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

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let mut stats = PoolStats {
            buckets: state.buckets.len(),
            allocations: state.allocations,
            frees: state.frees,
            ..PoolStats::default()
        };
        for bucket in state.buckets.values() {
            stats.used_pages += bucket.used.len();
            stats.retained_pages += bucket.free.len();
            let pages = bucket.used.iter().chain(bucket.free.iter().map(|r| &r.page));
            for page in pages {
                stats.reserved_bytes += page.size();
                stats.used_bytes += page.used_bytes();
                stats.live_allocations += u64::from(page.live_count());
                for category in AllocationCategory::ALL {
                    stats.category_bytes[category.index()] += page.category_bytes(category);
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tephra_core::HostBackend;

    fn setup() -> (DeviceMemoryManager<HostBackend>, PooledBufferAllocator) {
        let device = DeviceMemoryManager::new(HostBackend::discrete(1 << 24, 1 << 24));
        let pool = PooledBufferAllocator::new(&AllocatorConfig::desktop());
        (device, pool)
    }

    fn request(size: u64) -> PoolRequest {
        PoolRequest {
            size,
            alignment: 256,
            category: AllocationCategory::ConstantBuffer,
            flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
            memory_type_index: 1,
            tag: "test",
            owner: 0,
        }
    }

    #[test]
    fn test_requests_rounded_to_class() {
        let (device, pool) = setup();
        let a = pool.allocate(&request(100), &device).unwrap();
        assert_eq!(a.size(), 256);
        let b = pool.allocate(&request(300), &device).unwrap();
        assert_eq!(b.size(), 512);
        assert_ne!(a.id().page(), b.id().page());
        assert_eq!(a.id().origin(), AllocationOrigin::Pool);

        pool.free(a.into_id()).unwrap();
        pool.free(b.into_id()).unwrap();
        pool.release_retained(&device);
        assert_eq!(device.stats().allocation_count, 0);
    }

    #[test]
    fn test_same_class_shares_one_page() {
        let (device, pool) = setup();
        // 1 KiB class: 64 instances fill one 64 KiB page
        let allocations: Vec<_> = (0..64)
            .map(|_| pool.allocate(&request(1000), &device).unwrap())
            .collect();
        let page = allocations[0].id().page();
        assert!(allocations.iter().all(|a| a.id().page() == page));
        assert_eq!(device.stats().allocation_count, 1);

        // The 65th instance overflows onto a second page
        let extra = pool.allocate(&request(1000), &device).unwrap();
        assert_ne!(extra.id().page(), page);
        assert_eq!(pool.stats().live_allocations, 65);

        for a in allocations {
            pool.free(a.into_id()).unwrap();
        }
        pool.free(extra.into_id()).unwrap();
        assert_eq!(pool.stats().retained_pages, 2);
        pool.release_retained(&device);
    }

    #[test]
    fn test_flags_separate_buckets() {
        let (device, pool) = setup();
        let a = pool.allocate(&request(256), &device).unwrap();
        let mut cached = request(256);
        cached.flags |= MemoryPropertyFlags::HOST_CACHED;
        cached.memory_type_index = 2;
        let b = pool.allocate(&cached, &device).unwrap();
        assert_ne!(a.id().page(), b.id().page());
        assert_eq!(pool.stats().buckets, 2);
        pool.teardown(&device);
    }

    #[test]
    fn test_retained_page_reused_then_reclaimed() {
        let (device, pool) = setup();
        let a = pool.allocate(&request(256), &device).unwrap();
        let page = a.id().page();
        assert!(pool.free(a.into_id()).unwrap().reclaimable);

        let b = pool.allocate(&request(256), &device).unwrap();
        assert_eq!(b.id().page(), page);
        let id = b.into_id();
        pool.free(id).unwrap();
        assert_eq!(pool.free(id), Err(Error::DoubleFree));

        assert_eq!(pool.reclaim(1, &device), 0);
        assert_eq!(pool.reclaim(3, &device), 1);
        assert_eq!(pool.stats().buckets, 0);
        assert_eq!(pool.free(id), Err(Error::UseAfterFree));
    }

    #[test]
    fn test_oversized_request_rejected() {
        let (device, pool) = setup();
        assert_eq!(
            pool.allocate(&request(pool.threshold() + 1), &device).unwrap_err(),
            Error::InvalidParameter
        );
    }
}
