//! # Protections and Access Types
//!
//! Mapping permissions are totally ordered:
//!
//! ```text
//! None < ReadOnly < ReadWrite < ReadWriteAtomic
//! ```
//!
//! A block tracks one page bitmap per [`PteBit`]; a page mapped with
//! protection `p` has the bits for every level up to and including `p` set.

use core::fmt;

// =============================================================================
// PROTECTION
// =============================================================================

/// Mapping protection of a page on one processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Prot {
    /// Not mapped
    #[default]
    None = 0,
    /// Read-only
    ReadOnly = 1,
    /// Read and write
    ReadWrite = 2,
    /// Read, write and atomics
    ReadWriteAtomic = 3,
}

impl Prot {
    /// Every valid (non-`None`) protection, weakest first
    pub const VALID: [Prot; 3] = [Prot::ReadOnly, Prot::ReadWrite, Prot::ReadWriteAtomic];

    /// Highest PTE bit implied by this protection
    #[inline]
    pub const fn highest_bit(self) -> Option<PteBit> {
        match self {
            Self::None => None,
            Self::ReadOnly => Some(PteBit::Read),
            Self::ReadWrite => Some(PteBit::Write),
            Self::ReadWriteAtomic => Some(PteBit::Atomic),
        }
    }

    /// Protection whose highest bit is `bit`
    #[inline]
    pub const fn from_highest_bit(bit: PteBit) -> Self {
        match bit {
            PteBit::Read => Self::ReadOnly,
            PteBit::Write => Self::ReadWrite,
            PteBit::Atomic => Self::ReadWriteAtomic,
        }
    }

    /// Does this protection include the given bit?
    #[inline]
    pub const fn has(self, bit: PteBit) -> bool {
        self as u8 > bit as u8
    }

    /// Is this protection writable?
    #[inline]
    pub const fn is_writable(self) -> bool {
        self as u8 >= Self::ReadWrite as u8
    }

    /// Strongest protection the revocation of `bit` leaves in place
    #[inline]
    pub const fn below(bit: PteBit) -> Self {
        match bit {
            PteBit::Read => Self::None,
            PteBit::Write => Self::ReadOnly,
            PteBit::Atomic => Self::ReadWrite,
        }
    }
}

impl fmt::Display for Prot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::ReadOnly => write!(f, "ro"),
            Self::ReadWrite => write!(f, "rw"),
            Self::ReadWriteAtomic => write!(f, "rwa"),
        }
    }
}

// =============================================================================
// PTE BITS
// =============================================================================

/// Permission bit tracked per page and processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PteBit {
    /// Readable
    Read = 0,
    /// Writable
    Write = 1,
    /// Atomics allowed
    Atomic = 2,
}

impl PteBit {
    /// Number of bits tracked for GPUs
    pub const COUNT: usize = 3;

    /// All bits, weakest first
    pub const ALL: [PteBit; 3] = [PteBit::Read, PteBit::Write, PteBit::Atomic];

    /// Index into per-bit arrays
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

// =============================================================================
// ACCESS TYPE
// =============================================================================

/// Kind of access that caused a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum AccessType {
    /// Speculative prefetch; serviced as a read
    Prefetch = 0,
    /// Load
    Read = 1,
    /// Store
    Write = 2,
    /// Atomic read-modify-write
    Atomic = 3,
}

impl AccessType {
    /// Minimum protection that satisfies the access
    #[inline]
    pub const fn required_prot(self) -> Prot {
        match self {
            Self::Prefetch | Self::Read => Prot::ReadOnly,
            Self::Write => Prot::ReadWrite,
            Self::Atomic => Prot::ReadWriteAtomic,
        }
    }

    /// Does the access modify memory?
    #[inline]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::Atomic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prot_ordering_and_bits() {
        assert!(Prot::ReadWriteAtomic > Prot::ReadWrite);
        assert!(Prot::ReadWrite.has(PteBit::Read));
        assert!(Prot::ReadWrite.has(PteBit::Write));
        assert!(!Prot::ReadWrite.has(PteBit::Atomic));
        assert!(!Prot::None.has(PteBit::Read));
        assert_eq!(Prot::below(PteBit::Write), Prot::ReadOnly);
        assert_eq!(Prot::from_highest_bit(PteBit::Atomic), Prot::ReadWriteAtomic);
        assert_eq!(Prot::ReadOnly.highest_bit(), Some(PteBit::Read));
    }

    #[test]
    fn test_access_type_required_prot() {
        assert_eq!(AccessType::Prefetch.required_prot(), Prot::ReadOnly);
        assert_eq!(AccessType::Atomic.required_prot(), Prot::ReadWriteAtomic);
        assert!(AccessType::Write.is_write());
        assert!(AccessType::Atomic > AccessType::Write);
    }
}
