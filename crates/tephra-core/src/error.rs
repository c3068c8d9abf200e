//! # Tephra Error Handling
//!
//! Error types for the device memory allocator stack.
//!
//! Error handling in Tephra follows these principles:
//! - Errors are typed and categorized by how a caller should react
//! - No panics in library code paths
//! - Recoverable failures are distinct from fatal ones
//! - Errors are `no_std` compatible and `Copy`

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Tephra Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Tephra unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided (zero size, non power-of-two alignment)
    InvalidParameter,
    /// Page, slot or fence not found
    NotFound,

    // =========================================================================
    // Allocation Errors
    // =========================================================================
    /// A single page request failed; callers fall back to a smaller request
    /// or another memory type
    PageAllocationFailed,
    /// Every fallback was exhausted. The allocator cannot make progress.
    DeviceOutOfMemory,
    /// No memory type satisfies the requested capabilities
    MemoryTypeNotFound,

    // =========================================================================
    // Lifetime Errors
    // =========================================================================
    /// Allocation is already freed or already queued for deletion
    DoubleFree,
    /// Handle refers to a slot that was recycled or never allocated
    UseAfterFree,
    /// Live allocations remained at allocator teardown
    LeakedAllocation,

    // =========================================================================
    // Mapping Errors
    // =========================================================================
    /// Memory type is not host-visible
    NotMappable,
    /// Mapping the page into host address space failed
    MappingFailed,

    // =========================================================================
    // Backend Errors
    // =========================================================================
    /// Error reported by the device-memory primitive interface
    Primitive(PrimitiveError),
}

impl Error {
    /// Whether a caller may recover by trying a different request
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PageAllocationFailed | Self::MemoryTypeNotFound | Self::Primitive(_)
        )
    }

    /// Whether this error indicates a programmer mistake
    pub const fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::DoubleFree | Self::UseAfterFree | Self::InvalidParameter
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),

            Self::PageAllocationFailed => write!(f, "page allocation failed"),
            Self::DeviceOutOfMemory => write!(f, "device out of memory"),
            Self::MemoryTypeNotFound => write!(f, "no compatible memory type"),

            Self::DoubleFree => write!(f, "allocation freed twice"),
            Self::UseAfterFree => write!(f, "stale allocation handle"),
            Self::LeakedAllocation => write!(f, "allocation leaked at teardown"),

            Self::NotMappable => write!(f, "memory is not host-visible"),
            Self::MappingFailed => write!(f, "memory mapping failed"),

            Self::Primitive(e) => write!(f, "device memory primitive error: {}", e),
        }
    }
}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// Errors reported by the raw device-memory primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveError {
    /// Device heap exhausted
    OutOfDeviceMemory,
    /// Host memory exhausted
    OutOfHostMemory,
    /// Device allocation-count limit reached
    TooManyObjects,
    /// Mapping request rejected
    MapFailed,
    /// Handle not known to the device
    InvalidHandle,
}

impl fmt::Display for PrimitiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfDeviceMemory => write!(f, "out of device memory"),
            Self::OutOfHostMemory => write!(f, "out of host memory"),
            Self::TooManyObjects => write!(f, "too many allocations"),
            Self::MapFailed => write!(f, "map failed"),
            Self::InvalidHandle => write!(f, "invalid handle"),
        }
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<PrimitiveError> for Error {
    fn from(e: PrimitiveError) -> Self {
        match e {
            PrimitiveError::MapFailed => Error::MappingFailed,
            other => Error::Primitive(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_split() {
        assert!(Error::PageAllocationFailed.is_recoverable());
        assert!(!Error::DeviceOutOfMemory.is_recoverable());
        assert!(Error::DoubleFree.is_programmer_error());
        assert!(!Error::DeviceOutOfMemory.is_programmer_error());
    }

    #[test]
    fn test_primitive_conversion() {
        assert_eq!(Error::from(PrimitiveError::MapFailed), Error::MappingFailed);
        assert_eq!(
            Error::from(PrimitiveError::OutOfDeviceMemory),
            Error::Primitive(PrimitiveError::OutOfDeviceMemory)
        );
    }
}
