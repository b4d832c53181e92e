//! # GPU Chunks
//!
//! Physically contiguous, power-of-two sized pieces of GPU memory.
//!
//! A chunk handle is an exclusive owner: it is not `Clone`, so a chunk is
//! held by exactly one VA block (or one retry object) at a time and must be
//! handed back to its allocator explicitly.

use alloc::sync::Weak;
use alloc::vec::Vec;
use core::fmt;

use uvm_core::{Aperture, Error, GpuId, MemAddr, PhysAddr, Result, PAGE_SIZE, PAGE_SIZE_2M};

// =============================================================================
// CHUNK SIZES
// =============================================================================

bitflags::bitflags! {
    /// Set of chunk sizes; each flag's value is the size in bytes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChunkSizes: u64 {
        /// 4 KiB
        const SIZE_4K = 1 << 12;
        /// 64 KiB
        const SIZE_64K = 1 << 16;
        /// 128 KiB
        const SIZE_128K = 1 << 17;
        /// 2 MiB (root chunk)
        const SIZE_2M = 1 << 21;
    }
}

impl ChunkSizes {
    /// Sizes most GPUs support natively
    pub const DEFAULT: Self = Self::SIZE_4K.union(Self::SIZE_64K).union(Self::SIZE_2M);

    /// Iterate sizes, largest first
    pub fn sizes_desc(self) -> impl Iterator<Item = u64> {
        let bits = self.bits();
        (12..=21u32).rev().map(|shift| 1u64 << shift).filter(move |s| bits & s != 0)
    }

    /// Largest supported size strictly below `size`
    pub fn next_smaller(self, size: u64) -> Option<u64> {
        self.sizes_desc().find(|s| *s < size)
    }

    /// Smallest supported size
    pub fn smallest(self) -> Option<u64> {
        self.sizes_desc().last()
    }
}

// =============================================================================
// GPU CHUNK
// =============================================================================

/// Exclusive handle to a chunk of GPU memory
#[derive(PartialEq, Eq)]
pub struct GpuChunk {
    gpu: GpuId,
    addr: PhysAddr,
    size: u64,
}

impl GpuChunk {
    /// Create a chunk handle; only allocators mint these
    pub(crate) const fn new(gpu: GpuId, addr: PhysAddr, size: u64) -> Self {
        Self { gpu, addr, size }
    }

    /// Owning GPU
    #[inline]
    pub const fn gpu(&self) -> GpuId {
        self.gpu
    }

    /// Physical start address
    #[inline]
    pub const fn addr(&self) -> PhysAddr {
        self.addr
    }

    /// Size in bytes
    #[inline]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Number of system pages
    #[inline]
    pub const fn pages(&self) -> usize {
        (self.size / PAGE_SIZE) as usize
    }

    /// Aperture-qualified address of the byte at `offset`
    #[inline]
    pub const fn mem_addr(&self, offset: u64) -> MemAddr {
        MemAddr::new(Aperture::Vidmem(self.gpu), self.addr.offset(offset))
    }

    /// Address of the root (2M) chunk containing this chunk
    #[inline]
    pub const fn root_addr(&self) -> PhysAddr {
        PhysAddr::new(self.addr.raw() & !(PAGE_SIZE_2M - 1))
    }

    /// Address of subchunk `index` when split into `size` pieces
    #[inline]
    pub fn subchunk_addr(&self, index: usize, size: u64) -> Option<PhysAddr> {
        let offset = index as u64 * size;
        (size <= self.size && offset < self.size).then(|| self.addr.offset(offset))
    }
}

impl fmt::Debug for GpuChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuChunk({:?} 0x{:x}+0x{:x})",
            self.gpu,
            self.addr.raw(),
            self.size
        )
    }
}

// =============================================================================
// ALLOCATOR TRAITS
// =============================================================================

/// Outcome of a split; a failed split hands the chunk back untouched
pub type SplitResult = core::result::Result<Vec<GpuChunk>, (Error, GpuChunk)>;

/// Per-GPU chunk allocator
///
/// `alloc` with `evict == false` never blocks on eviction and fails with
/// `OutOfMemory` when memory is exhausted. Callers holding a block lock must
/// drop it before retrying with `evict == true`.
pub trait ChunkAllocator: Send + Sync {
    /// GPU whose memory this allocator manages
    fn gpu(&self) -> GpuId;

    /// Natively supported chunk sizes
    fn supported_sizes(&self) -> ChunkSizes;

    /// Allocate an evictable user chunk
    fn alloc(&self, size: u64, evict: bool) -> Result<GpuChunk>;

    /// Allocate a kernel chunk (page tables, staging); never evicted
    fn alloc_kernel(&self, size: u64, evict: bool) -> Result<GpuChunk>;

    /// Return a chunk
    fn free(&self, chunk: GpuChunk);

    /// Split a chunk into equal subchunks of `size`, in address order
    fn split(&self, chunk: GpuChunk, size: u64) -> SplitResult;

    /// Merge address-ordered sibling subchunks back into their parent
    fn merge(&self, chunks: Vec<GpuChunk>) -> Result<GpuChunk>;

    /// Hint that the root chunk holds resident data
    fn mark_used(&self, chunk: &GpuChunk);

    /// Hint that the root chunk holds no resident data and is cheap to evict
    fn mark_unused(&self, chunk: &GpuChunk);

    /// Register the callback used to evict allocated roots
    fn set_eviction_handler(&self, handler: Weak<dyn EvictionHandler>);
}

/// Callback asked to give back every chunk inside a root chunk
///
/// Invoked with no allocator lock held.
pub trait EvictionHandler: Send + Sync {
    /// Migrate the data in `[root, root + size)` away and free its chunks
    fn evict_root(&self, gpu: GpuId, root: PhysAddr, size: u64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_sizes() {
        let sizes = ChunkSizes::DEFAULT;
        let desc: Vec<u64> = sizes.sizes_desc().collect();
        assert_eq!(desc, alloc::vec![PAGE_SIZE_2M, 64 * 1024, PAGE_SIZE]);
        assert_eq!(sizes.next_smaller(PAGE_SIZE_2M), Some(64 * 1024));
        assert_eq!(sizes.next_smaller(PAGE_SIZE), None);
        assert_eq!(sizes.smallest(), Some(PAGE_SIZE));
    }

    #[test]
    fn test_chunk_addressing() {
        let chunk = GpuChunk::new(GpuId::new(0), PhysAddr::new(0x40_0000 + 0x1_0000), 0x1_0000);
        assert_eq!(chunk.root_addr(), PhysAddr::new(0x40_0000));
        assert_eq!(chunk.pages(), 16);
        assert_eq!(chunk.subchunk_addr(3, PAGE_SIZE), Some(PhysAddr::new(0x41_3000)));
        assert_eq!(chunk.subchunk_addr(16, PAGE_SIZE), None);
    }
}
