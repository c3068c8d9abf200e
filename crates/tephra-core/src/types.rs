//! # Tephra Core Types
//!
//! Fundamental type definitions used across the allocator stack.
//!
//! These types provide:
//! - Strong typing for sizes, device handles and page identifiers
//! - Alignment helpers shared by every allocator layer
//! - Typed opaque handles for pooled objects

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

// =============================================================================
// ALIGNMENT
// =============================================================================

/// Align `value` up to `alignment` (a power of two).
///
/// Returns `None` on overflow.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> Option<u64> {
    let mask = alignment - 1;
    match value.checked_add(mask) {
        Some(v) => Some(v & !mask),
        None => None,
    }
}

/// Align `value` down to `alignment` (a power of two)
#[inline]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

/// Check that `alignment` is a usable power of two
#[inline]
pub const fn is_valid_alignment(alignment: u64) -> bool {
    alignment != 0 && alignment.is_power_of_two()
}

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes (for device allocations)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);
    /// 64 KiB
    pub const KIB_64: Self = Self(64 * 1024);
    /// 1 MiB
    pub const MIB_1: Self = Self(1024 * 1024);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from KiB
    #[inline]
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from MiB
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Create from GiB
    #[inline]
    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * 1024 * 1024 * 1024)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Get as KiB
    #[inline]
    pub const fn as_kib(self) -> u64 {
        self.0 / 1024
    }

    /// Get as MiB
    #[inline]
    pub const fn as_mib(self) -> u64 {
        self.0 / (1024 * 1024)
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(u64, &str); 3] = [
            (1024 * 1024 * 1024, "GiB"),
            (1024 * 1024, "MiB"),
            (1024, "KiB"),
        ];

        let Some(&(unit, name)) = UNITS.iter().find(|(unit, _)| self.0 >= *unit) else {
            return write!(f, "{} B", self.0);
        };
        if self.0 % unit == 0 {
            return write!(f, "{} {}", self.0 / unit, name);
        }
        // Two decimals, rounded to nearest
        let hundredths = (u128::from(self.0) * 100 + u128::from(unit / 2)) / u128::from(unit);
        write!(f, "{}.{:02} {}", hundredths / 100, hundredths % 100, name)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// DEVICE HANDLES
// =============================================================================

/// Raw device-memory object handle issued by the primitive interface
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DeviceMemoryHandle(u64);

impl DeviceMemoryHandle {
    /// Null handle
    pub const NULL: Self = Self(0);

    /// Wrap a raw handle value
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for DeviceMemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceMemory(0x{:x})", self.0)
    }
}

/// Identifier of one page (one raw allocation owned by a sub-allocator)
///
/// Page ids are issued once by the device memory manager and never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PageId(u64);

impl PageId {
    /// Wrap a raw page number
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page#{}", self.0)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Opaque typed handle to a pooled host-side object
///
/// Handles are type-safe wrappers that prevent mixing different object kinds.
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create a new handle
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Get the raw ID
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = core::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "Handle<{}>({})", short, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;
    use alloc::string::ToString;

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(100, 16), Some(112));
        assert_eq!(align_up(112, 16), Some(112));
        assert_eq!(align_up(u64::MAX, 16), None);
        assert_eq!(align_down(127, 64), 64);
        assert!(is_valid_alignment(1));
        assert!(!is_valid_alignment(0));
        assert!(!is_valid_alignment(24));
    }

    #[test]
    fn test_byte_size_units() {
        assert_eq!(ByteSize::from_kib(64), ByteSize::KIB_64);
        assert_eq!(ByteSize::from_mib(3).as_kib(), 3 * 1024);
        assert_eq!(ByteSize::from_gib(1).as_mib(), 1024);
    }

    #[test]
    fn test_byte_size_display_keeps_fraction() {
        assert_eq!(ByteSize::from_bytes(1000).to_string(), "1000 B");
        assert_eq!(ByteSize::from_kib(8).to_string(), "8 KiB");
        assert_eq!(ByteSize::from_bytes(1536).to_string(), "1.50 KiB");
        assert_eq!(ByteSize::from_bytes(1023 * 1024 * 1024 + 1).to_string(), "1023.00 MiB");
        assert_eq!(ByteSize::from_bytes(1024 * 1024 + 1024 * 1024 / 4).to_string(), "1.25 MiB");
        // 1.999 GiB is not reported as 1 GiB
        assert_eq!(ByteSize::from_bytes(2 * (1 << 30) - (1 << 20)).to_string(), "2.00 GiB");
        assert_eq!(format!("{:?}", ByteSize::from_mib(3)), "3 MiB");
    }

    #[test]
    fn test_handle_is_copy_without_marker_bounds() {
        struct Marker;
        let a: Handle<Marker> = Handle::new(7);
        let b = a;
        assert_eq!(a, b);
        assert_eq!(b.id(), 7);
    }
}
