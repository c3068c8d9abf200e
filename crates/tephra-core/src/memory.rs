//! # Memory Descriptors
//!
//! Memory heaps, memory types, capability flags and the allocation
//! categories used for accounting.

use core::fmt;

use arrayvec::ArrayVec;

// =============================================================================
// LIMITS
// =============================================================================

/// Maximum memory types a device may expose
pub const MAX_MEMORY_TYPES: usize = 32;
/// Maximum memory heaps a device may expose
pub const MAX_MEMORY_HEAPS: usize = 16;

// =============================================================================
// CAPABILITY FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Memory type capability flags
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct MemoryPropertyFlags: u32 {
        /// Device local memory
        const DEVICE_LOCAL = 1 << 0;
        /// Host visible memory (mappable)
        const HOST_VISIBLE = 1 << 1;
        /// Host coherent memory (no explicit flush needed)
        const HOST_COHERENT = 1 << 2;
        /// Host cached memory
        const HOST_CACHED = 1 << 3;
        /// Lazily allocated memory
        const LAZILY_ALLOCATED = 1 << 4;
    }
}

impl MemoryPropertyFlags {
    /// Device local and not host visible
    pub fn is_device_only(&self) -> bool {
        self.contains(Self::DEVICE_LOCAL) && !self.contains(Self::HOST_VISIBLE)
    }

    /// Can be mapped into the host address space
    pub fn is_mappable(&self) -> bool {
        self.contains(Self::HOST_VISIBLE)
    }

    /// Host writes need an explicit flush
    pub fn needs_flush(&self) -> bool {
        self.contains(Self::HOST_VISIBLE) && !self.contains(Self::HOST_COHERENT)
    }
}

bitflags::bitflags! {
    /// Memory heap flags
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct MemoryHeapFlags: u32 {
        /// Device local heap
        const DEVICE_LOCAL = 1 << 0;
    }
}

// =============================================================================
// HEAPS AND TYPES
// =============================================================================

/// A physical memory pool on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeap {
    /// Heap index
    pub index: u32,
    /// Heap size in bytes
    pub size: u64,
    /// Heap flags
    pub flags: MemoryHeapFlags,
}

/// A combination of capability flags available within one heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    /// Memory type index
    pub index: u32,
    /// Index of the backing heap
    pub heap_index: u32,
    /// Capability flags
    pub flags: MemoryPropertyFlags,
}

/// Heap and type tables enumerated once from the device
#[derive(Debug, Clone, Default)]
pub struct MemoryProperties {
    types: ArrayVec<MemoryType, MAX_MEMORY_TYPES>,
    heaps: ArrayVec<MemoryHeap, MAX_MEMORY_HEAPS>,
}

impl MemoryProperties {
    /// Create empty tables
    pub const fn new() -> Self {
        Self {
            types: ArrayVec::new_const(),
            heaps: ArrayVec::new_const(),
        }
    }

    /// Register a heap, returning its index.
    ///
    /// Returns `None` once [`MAX_MEMORY_HEAPS`] heaps exist.
    pub fn push_heap(&mut self, size: u64, flags: MemoryHeapFlags) -> Option<u32> {
        let index = self.heaps.len() as u32;
        self.heaps
            .try_push(MemoryHeap { index, size, flags })
            .ok()
            .map(|_| index)
    }

    /// Register a memory type on an existing heap, returning its index
    pub fn push_type(&mut self, heap_index: u32, flags: MemoryPropertyFlags) -> Option<u32> {
        if heap_index as usize >= self.heaps.len() {
            return None;
        }
        let index = self.types.len() as u32;
        self.types
            .try_push(MemoryType {
                index,
                heap_index,
                flags,
            })
            .ok()
            .map(|_| index)
    }

    /// All memory types
    pub fn types(&self) -> &[MemoryType] {
        &self.types
    }

    /// All heaps
    pub fn heaps(&self) -> &[MemoryHeap] {
        &self.heaps
    }

    /// Look up a memory type
    pub fn memory_type(&self, index: u32) -> Option<&MemoryType> {
        self.types.get(index as usize)
    }

    /// Look up a heap
    pub fn heap(&self, index: u32) -> Option<&MemoryHeap> {
        self.heaps.get(index as usize)
    }

    /// Heap backing a memory type
    pub fn heap_of_type(&self, type_index: u32) -> Option<&MemoryHeap> {
        self.memory_type(type_index)
            .and_then(|t| self.heap(t.heap_index))
    }

    /// Bit mask with one bit per memory type
    pub fn all_types_mask(&self) -> u32 {
        match self.types.len() {
            MAX_MEMORY_TYPES => u32::MAX,
            n => (1u32 << n) - 1,
        }
    }
}

/// Device limits relevant to memory management
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum number of live raw allocations
    pub max_allocation_count: u32,
    /// Granularity of flush/invalidate ranges on non-coherent memory
    pub non_coherent_atom_size: u64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_allocation_count: 4096,
            non_coherent_atom_size: 64,
        }
    }
}

// =============================================================================
// RESOURCE SHAPE
// =============================================================================

/// Coarse resource shape; buffer and image pages are kept apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceShape {
    /// Linear buffer-like resource
    Buffer = 0,
    /// Tiled image-like resource
    Image = 1,
}

impl ResourceShape {
    /// Number of shapes
    pub const COUNT: usize = 2;
    /// All shapes in index order
    pub const ALL: [ResourceShape; Self::COUNT] = [ResourceShape::Buffer, ResourceShape::Image];

    /// Dense index for per-shape tables
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ResourceShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer => write!(f, "buffer"),
            Self::Image => write!(f, "image"),
        }
    }
}

// =============================================================================
// ALLOCATION CATEGORY
// =============================================================================

/// Semantic use of an allocation.
///
/// Categories only feed accounting and the eviction candidate filter; they
/// never change where or how memory is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationCategory {
    /// Small constant/uniform buffer updates
    ConstantBuffer = 0,
    /// Per-frame transient data
    Transient = 1,
    /// Color/depth attachments
    RenderTarget = 2,
    /// Sampled image data
    Image = 3,
    /// Generic buffer
    Buffer = 4,
    /// Host-to-device transfer source
    Staging = 5,
}

impl AllocationCategory {
    /// Number of categories
    pub const COUNT: usize = 6;
    /// All categories in index order
    pub const ALL: [AllocationCategory; Self::COUNT] = [
        Self::ConstantBuffer,
        Self::Transient,
        Self::RenderTarget,
        Self::Image,
        Self::Buffer,
        Self::Staging,
    ];

    /// Dense index for per-category counters
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Category may be migrated to host memory under pressure
    #[inline]
    pub const fn is_evictable(self) -> bool {
        matches!(self, Self::Image)
    }

    /// Category is served by the pooled buffer allocator when small
    #[inline]
    pub const fn is_pooled(self) -> bool {
        matches!(self, Self::ConstantBuffer | Self::Transient)
    }

    /// Short name for reports
    pub const fn name(self) -> &'static str {
        match self {
            Self::ConstantBuffer => "constant-buffer",
            Self::Transient => "transient",
            Self::RenderTarget => "render-target",
            Self::Image => "image",
            Self::Buffer => "buffer",
            Self::Staging => "staging",
        }
    }
}

impl fmt::Display for AllocationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_tables() {
        let mut props = MemoryProperties::new();
        let vram = props.push_heap(1 << 30, MemoryHeapFlags::DEVICE_LOCAL).unwrap();
        let sys = props.push_heap(1 << 28, MemoryHeapFlags::empty()).unwrap();
        assert_eq!(props.push_type(vram, MemoryPropertyFlags::DEVICE_LOCAL), Some(0));
        assert_eq!(
            props.push_type(sys, MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT),
            Some(1)
        );
        assert_eq!(props.push_type(9, MemoryPropertyFlags::empty()), None);
        assert_eq!(props.all_types_mask(), 0b11);
        assert_eq!(props.heap_of_type(1).map(|h| h.size), Some(1 << 28));
    }

    #[test]
    fn test_flag_predicates() {
        let staging = MemoryPropertyFlags::HOST_VISIBLE;
        assert!(staging.needs_flush());
        assert!(!(staging | MemoryPropertyFlags::HOST_COHERENT).needs_flush());
        assert!(MemoryPropertyFlags::DEVICE_LOCAL.is_device_only());
    }

    #[test]
    fn test_category_tables() {
        for (i, category) in AllocationCategory::ALL.iter().enumerate() {
            assert_eq!(category.index(), i);
        }
        assert!(AllocationCategory::Image.is_evictable());
        assert!(!AllocationCategory::RenderTarget.is_evictable());
        assert!(AllocationCategory::ConstantBuffer.is_pooled());
    }
}
