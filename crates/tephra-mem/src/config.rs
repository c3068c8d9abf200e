//! # Allocator Configuration
//!
//! Tunables for every layer of the allocator, with presets.

use tephra_core::{ByteSize, ResourceShape};

// =============================================================================
// PAGE SIZE POLICY
// =============================================================================

/// Default page size derivation for one heap.
///
/// The page size is `heap_size / heap_divisor`, clamped to
/// `[minimum, ceiling(shape)]`. Requests larger than the result get a
/// dedicated page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSizePolicy {
    /// Fraction of the heap a single page may take
    pub heap_divisor: u64,
    /// Upper bound for buffer-shaped pages
    pub buffer_ceiling: ByteSize,
    /// Upper bound for image-shaped pages
    pub image_ceiling: ByteSize,
    /// Lower bound for any page
    pub minimum: ByteSize,
}

impl PageSizePolicy {
    /// Desktop discrete GPU defaults
    pub const fn desktop() -> Self {
        Self {
            heap_divisor: 8,
            buffer_ceiling: ByteSize::from_mib(64),
            image_ceiling: ByteSize::from_mib(256),
            minimum: ByteSize::from_mib(1),
        }
    }

    /// Small heaps on mobile/embedded parts
    pub const fn embedded() -> Self {
        Self {
            heap_divisor: 16,
            buffer_ceiling: ByteSize::from_mib(16),
            image_ceiling: ByteSize::from_mib(16),
            minimum: ByteSize::KIB_64,
        }
    }

    /// Every page has exactly `bytes` bytes
    pub const fn fixed(bytes: u64) -> Self {
        Self {
            heap_divisor: 1,
            buffer_ceiling: ByteSize::from_bytes(bytes),
            image_ceiling: ByteSize::from_bytes(bytes),
            minimum: ByteSize::from_bytes(bytes),
        }
    }

    /// Default page size for a heap of `heap_size` bytes
    pub fn page_size(&self, heap_size: u64, shape: ResourceShape) -> u64 {
        let ceiling = match shape {
            ResourceShape::Buffer => self.buffer_ceiling,
            ResourceShape::Image => self.image_ceiling,
        };
        let share = heap_size / self.heap_divisor.max(1);
        share
            .min(ceiling.as_bytes())
            .max(self.minimum.as_bytes())
            .max(1)
    }
}

impl Default for PageSizePolicy {
    fn default() -> Self {
        Self::desktop()
    }
}

// =============================================================================
// POOL CONFIGURATION
// =============================================================================

/// Power-of-two size classes from 256 B to 64 KiB
pub const DEFAULT_SIZE_CLASSES: &[u64] = &[
    256,
    512,
    1024,
    2 * 1024,
    4 * 1024,
    8 * 1024,
    16 * 1024,
    32 * 1024,
    64 * 1024,
];

/// Pooled buffer allocator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Ascending size classes; the last one is the pooling threshold
    pub size_classes: &'static [u64],
    /// Instances of a class one shared page should hold
    pub instances_per_page: u64,
    /// Smallest shared page
    pub min_page_size: ByteSize,
    /// Largest shared page
    pub max_page_size: ByteSize,
}

impl PoolConfig {
    /// Constant buffers and per-frame transients
    pub const fn uniform() -> Self {
        Self {
            size_classes: DEFAULT_SIZE_CLASSES,
            instances_per_page: 64,
            min_page_size: ByteSize::KIB_64,
            max_page_size: ByteSize::from_mib(4),
        }
    }

    /// Largest request served by the pool
    pub fn threshold(&self) -> u64 {
        self.size_classes.last().copied().unwrap_or(0)
    }

    /// Index of the smallest class that holds `size`
    pub fn class_index(&self, size: u64) -> Option<usize> {
        self.size_classes.iter().position(|&class| class >= size)
    }

    /// Shared page size for a class
    pub fn page_size_for(&self, class_size: u64) -> u64 {
        class_size
            .saturating_mul(self.instances_per_page)
            .min(self.max_page_size.as_bytes())
            .max(self.min_page_size.as_bytes())
            .max(class_size)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::uniform()
    }
}

// =============================================================================
// EVICTION CONFIGURATION
// =============================================================================

/// Eviction controller configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionConfig {
    /// Run eviction passes at all
    pub enabled: bool,
    /// Fraction of the monitored heap above which a page is evicted
    pub high_water: f32,
    /// Low-water mark as a fraction of `high_water`
    pub low_water_ratio: f32,
    /// Heap to monitor; `None` picks the heap of the first device-local
    /// host-visible type, else of the first host-visible type
    pub monitored_heap: Option<u32>,
}

impl EvictionConfig {
    /// Eviction disabled
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            high_water: 0.9,
            low_water_ratio: 0.9,
            monitored_heap: None,
        }
    }

    /// Evict above 90% and resume below 81%
    pub const fn standard() -> Self {
        Self {
            enabled: true,
            ..Self::disabled()
        }
    }

    /// Low-water mark
    pub fn low_water(&self) -> f32 {
        self.high_water * self.low_water_ratio
    }
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self::standard()
    }
}

// =============================================================================
// STAGING CONFIGURATION
// =============================================================================

/// Staging buffer manager configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingConfig {
    /// Reclaim passes a free staging buffer is kept for reuse
    pub retention_epochs: u64,
    /// Minimum alignment of staging buffers
    pub alignment: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            retention_epochs: 8,
            alignment: 256,
        }
    }
}

// =============================================================================
// ALLOCATOR CONFIGURATION
// =============================================================================

/// Top-level memory manager configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AllocatorConfig {
    /// Default page sizes
    pub page_size: PageSizePolicy,
    /// Reclaim passes an empty page is retained before release
    pub retention_epochs: u64,
    /// Priority hint passed with every page request
    pub page_priority: f32,
    /// Pooled buffer allocator
    pub pool: PoolConfig,
    /// Eviction controller
    pub eviction: EvictionConfig,
    /// Staging buffers
    pub staging: StagingConfig,
}

impl AllocatorConfig {
    /// Defaults for a desktop discrete GPU
    pub fn desktop() -> Self {
        Self {
            page_size: PageSizePolicy::desktop(),
            retention_epochs: 3,
            page_priority: 0.5,
            pool: PoolConfig::uniform(),
            eviction: EvictionConfig::standard(),
            staging: StagingConfig::default(),
        }
    }

    /// Override page sizes
    pub fn with_page_size(mut self, policy: PageSizePolicy) -> Self {
        self.page_size = policy;
        self
    }

    /// Override page retention
    pub fn with_retention(mut self, epochs: u64) -> Self {
        self.retention_epochs = epochs;
        self
    }

    /// Override eviction
    pub fn with_eviction(mut self, eviction: EvictionConfig) -> Self {
        self.eviction = eviction;
        self
    }

    /// Override pooling
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::desktop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_clamps() {
        let policy = PageSizePolicy::desktop();
        // 8 GiB heap: share is 1 GiB, clamped to the ceilings
        let big = ByteSize::from_gib(8).as_bytes();
        assert_eq!(policy.page_size(big, ResourceShape::Buffer), 64 << 20);
        assert_eq!(policy.page_size(big, ResourceShape::Image), 256 << 20);
        // 4 MiB heap: share is 512 KiB, raised to the minimum
        assert_eq!(policy.page_size(4 << 20, ResourceShape::Image), 1 << 20);
        assert_eq!(PageSizePolicy::fixed(1024).page_size(big, ResourceShape::Image), 1024);
    }

    #[test]
    fn test_pool_classes() {
        let pool = PoolConfig::uniform();
        assert_eq!(pool.class_index(1), Some(0));
        assert_eq!(pool.class_index(257), Some(1));
        assert_eq!(pool.class_index(64 * 1024), Some(8));
        assert_eq!(pool.class_index(64 * 1024 + 1), None);
        assert_eq!(pool.threshold(), 64 * 1024);
        assert_eq!(pool.page_size_for(256), 64 * 1024);
        assert_eq!(pool.page_size_for(64 * 1024), 4 << 20);
    }

    #[test]
    fn test_hysteresis_marks() {
        let eviction = EvictionConfig::standard();
        assert!(eviction.low_water() < eviction.high_water);
    }
}
