//! # Tephra Core
//!
//! Foundational types, traits and error taxonomy for the Tephra device
//! memory allocator.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        tephra-core                           │
//! │  ┌─────────────┐  ┌──────────────┐  ┌─────────────────────┐  │
//! │  │   Traits    │  │    Types     │  │       Error         │  │
//! │  │ (Backend,   │  │ (ByteSize,   │  │   (recoverable vs   │  │
//! │  │  Timeline)  │  │  PageId)     │  │    fatal taxonomy)  │  │
//! │  └─────────────┘  └──────────────┘  └─────────────────────┘  │
//! │  ┌─────────────────────────┐  ┌───────────────────────────┐  │
//! │  │ Memory (heaps, types,   │  │ HostBackend (system RAM   │  │
//! │  │ flags, categories)      │  │ primitive simulation)     │  │
//! │  └─────────────────────────┘  └───────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod host;
pub mod memory;
pub mod sync;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use error::{Error, PrimitiveError, Result};
pub use host::{HostBackend, HostBackendStats};
pub use memory::*;
pub use sync::Timeline;
pub use traits::*;
pub use types::*;

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

static_assertions::assert_impl_all!(ByteSize: Send, Sync, Copy);
static_assertions::assert_impl_all!(PageId: Send, Sync, Copy);
static_assertions::assert_impl_all!(DeviceMemoryHandle: Send, Sync, Copy);
static_assertions::assert_impl_all!(Error: Send, Sync, Copy);
static_assertions::assert_impl_all!(HostBackend: DeviceMemoryBackend);
static_assertions::assert_impl_all!(Timeline: SubmissionTimeline);
