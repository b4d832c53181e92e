//! # UVM Core Types
//!
//! Addresses, sizes and apertures used across the residency engine.
//!
//! These types provide:
//! - Strong typing for virtual vs. physical addresses
//! - The fixed page and block geometry
//! - Apertures naming which memory a physical address belongs to

use core::fmt;
use core::ops::{Add, Sub};

use crate::processor::{GpuId, ProcessorId};

// =============================================================================
// GEOMETRY
// =============================================================================

/// System page shift
pub const PAGE_SHIFT: u32 = 12;
/// System page size (4 KiB)
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
/// 64 KiB, the typical GPU big page size
pub const PAGE_SIZE_64K: u64 = 64 * 1024;
/// 128 KiB, the alternative GPU big page size
pub const PAGE_SIZE_128K: u64 = 128 * 1024;
/// 2 MiB, the largest GPU leaf and the maximum VA block size
pub const PAGE_SIZE_2M: u64 = 2 * 1024 * 1024;
/// Maximum size of a VA block
pub const BLOCK_SIZE_MAX: u64 = PAGE_SIZE_2M;
/// Maximum number of system pages tracked by one VA block
pub const PAGES_PER_BLOCK_MAX: usize = (BLOCK_SIZE_MAX / PAGE_SIZE) as usize;

// =============================================================================
// VIRTUAL ADDRESS
// =============================================================================

/// A virtual address in the unified address space shared by CPU and GPUs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Create a new virtual address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Align down to boundary
    #[inline]
    pub const fn align_down(self, alignment: u64) -> Self {
        Self(self.0 & !(alignment - 1))
    }

    /// Align up to boundary
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl Add<u64> for VirtAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = u64;

    fn sub(self, rhs: VirtAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// PHYSICAL ADDRESS
// =============================================================================

/// Physical address within one aperture (sysmem or a GPU's vidmem)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl Add<u64> for PhysAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr(0x{:016x})", self.0)
    }
}

// =============================================================================
// APERTURE
// =============================================================================

/// Memory a physical address belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Aperture {
    /// System memory
    Sysmem,
    /// Video memory of the given GPU
    Vidmem(GpuId),
}

impl Aperture {
    /// Processor whose memory this aperture names
    #[inline]
    pub const fn owner(self) -> ProcessorId {
        match self {
            Self::Sysmem => ProcessorId::CPU,
            Self::Vidmem(gpu) => ProcessorId::from_gpu(gpu),
        }
    }

    /// Aperture holding the memory of a processor
    #[inline]
    pub const fn of(processor: ProcessorId) -> Self {
        match processor.gpu() {
            Some(gpu) => Self::Vidmem(gpu),
            None => Self::Sysmem,
        }
    }
}

/// A physical address qualified by its aperture
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemAddr {
    /// Which memory
    pub aperture: Aperture,
    /// Address within the aperture
    pub addr: PhysAddr,
}

impl MemAddr {
    /// Create a new aperture-qualified address
    #[inline]
    pub const fn new(aperture: Aperture, addr: PhysAddr) -> Self {
        Self { aperture, addr }
    }

    /// Offset by bytes within the same aperture
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self {
            aperture: self.aperture,
            addr: self.addr.offset(bytes),
        }
    }

    /// Is `next` exactly `bytes` past `self` in the same aperture?
    #[inline]
    pub fn is_followed_by(self, next: MemAddr, bytes: u64) -> bool {
        self.aperture == next.aperture && self.addr.raw().wrapping_add(bytes) == next.addr.raw()
    }
}

// =============================================================================
// SIZE TYPE
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);
    /// 4 KiB
    pub const KIB_4: Self = Self(4 * 1024);
    /// 64 KiB
    pub const KIB_64: Self = Self(64 * 1024);
    /// 2 MiB
    pub const MIB_2: Self = Self(2 * 1024 * 1024);

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

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Number of system pages covered (rounded down)
    #[inline]
    pub const fn pages(self) -> usize {
        (self.0 / PAGE_SIZE) as usize
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 * 1024 {
            write!(f, "{} GiB", self.0 / (1024 * 1024 * 1024))
        } else if self.0 >= 1024 * 1024 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        assert_eq!(PAGES_PER_BLOCK_MAX, 512);
        assert_eq!(PAGE_SIZE_2M / PAGE_SIZE_64K, 32);
    }

    #[test]
    fn test_virt_addr_alignment() {
        let addr = VirtAddr::new(0x20_1000);
        assert!(addr.is_aligned(PAGE_SIZE));
        assert!(!addr.is_aligned(PAGE_SIZE_2M));
        assert_eq!(addr.align_down(PAGE_SIZE_2M), VirtAddr::new(0x20_0000));
        assert_eq!(addr.align_up(PAGE_SIZE_2M), VirtAddr::new(0x40_0000));
    }

    #[test]
    fn test_mem_addr_contiguity() {
        let gpu = GpuId::new(1);
        let a = MemAddr::new(Aperture::Vidmem(gpu), PhysAddr::new(0x1000));
        assert!(a.is_followed_by(a.offset(PAGE_SIZE), PAGE_SIZE));
        let b = MemAddr::new(Aperture::Sysmem, PhysAddr::new(0x2000));
        assert!(!a.is_followed_by(b, PAGE_SIZE));
        assert_eq!(Aperture::Vidmem(gpu).owner(), ProcessorId::from_gpu(gpu));
        assert_eq!(Aperture::of(ProcessorId::CPU), Aperture::Sysmem);
    }
}
