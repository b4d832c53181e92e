//! # UVM Error Handling
//!
//! Error types for the residency engine.
//!
//! Errors fall in four groups:
//! - Resource exhaustion (`OutOfMemory`), recoverable through an
//!   eviction-enabled retry
//! - The internal `MoreProcessingRequired` signal, raised when an allocation
//!   only succeeded after the block lock was dropped; never surfaced to users
//! - Device-fatal conditions (`GpuFatal`, `ChannelError`) that latch
//! - User input errors reported to the faulting context

use core::fmt;

use crate::processor::GpuId;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// UVM Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// UVM unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,
    /// Resource is busy
    Busy,
    /// Operation not supported by this processor or configuration
    NotSupported,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Out of memory, even after eviction
    OutOfMemory,
    /// The block lock was dropped to complete an allocation; the caller must
    /// revalidate its state and redo the logical operation
    MoreProcessingRequired,
    /// Page-table storage could not be written
    PageTableError,

    // =========================================================================
    // User Input Errors
    // =========================================================================
    /// No managed range covers the address
    InvalidAddress,
    /// Access type not valid for this processor
    InvalidAccessType,
    /// Access exceeds the logical permission of the range
    AccessDenied,

    // =========================================================================
    // Device Errors
    // =========================================================================
    /// GPU hit an uncorrectable error and is permanently unusable
    GpuFatal(GpuId),
    /// A copy-engine channel faulted
    ChannelError,
}

impl Error {
    /// Is this the internal retry signal?
    #[inline]
    pub const fn is_retry(&self) -> bool {
        matches!(self, Self::MoreProcessingRequired)
    }

    /// Does this error latch the device (and dependent address spaces)?
    #[inline]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::GpuFatal(_) | Self::ChannelError)
    }

    /// Should this error be reported back to the faulting context?
    #[inline]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidAddress | Self::InvalidAccessType | Self::AccessDenied
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::Busy => write!(f, "resource busy"),
            Self::NotSupported => write!(f, "operation not supported"),

            // Memory
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::MoreProcessingRequired => write!(f, "more processing required"),
            Self::PageTableError => write!(f, "page table update failed"),

            // User input
            Self::InvalidAddress => write!(f, "invalid address"),
            Self::InvalidAccessType => write!(f, "invalid access type"),
            Self::AccessDenied => write!(f, "access exceeds logical permission"),

            // Device
            Self::GpuFatal(gpu) => write!(f, "GPU {} is in a fatal state", gpu),
            Self::ChannelError => write!(f, "copy engine channel error"),
        }
    }
}
