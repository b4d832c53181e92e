//! # GPUs
//!
//! What the VA layer knows about one GPU: its page-table capabilities and
//! the collaborators that manage its memory, page tables and copy engine.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use uvm_cmd::CopyEngine;
use uvm_core::{Error, GpuId, MappingConfig, ProcessorId, Result};
use uvm_mem::{ChunkAllocator, ChunkSizes, PageSizes, PageTree};

/// Page-table capabilities of a GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuCaps {
    /// Big page size (64K or 128K)
    pub big_page_size: u64,
    /// Levels usable for leaves
    pub page_sizes: PageSizes,
    /// Big pages of local memory use a swizzled layout
    pub swizzling: bool,
}

/// A GPU registered with a VA space
pub struct VaGpu {
    id: GpuId,
    caps: GpuCaps,
    chunks: Arc<dyn ChunkAllocator>,
    page_tree: Arc<dyn PageTree>,
    copy_engine: Arc<dyn CopyEngine>,
    fatal: AtomicBool,
}

impl VaGpu {
    /// Bundle a GPU's collaborators
    pub fn new(
        caps: GpuCaps,
        chunks: Arc<dyn ChunkAllocator>,
        page_tree: Arc<dyn PageTree>,
        copy_engine: Arc<dyn CopyEngine>,
    ) -> Self {
        let id = chunks.gpu();
        debug_assert_eq!(page_tree.gpu(), id);
        debug_assert_eq!(copy_engine.gpu(), id);
        Self {
            id,
            caps,
            chunks,
            page_tree,
            copy_engine,
            fatal: AtomicBool::new(false),
        }
    }

    /// GPU id
    #[inline]
    pub fn id(&self) -> GpuId {
        self.id
    }

    /// Processor id
    #[inline]
    pub fn processor(&self) -> ProcessorId {
        ProcessorId::from_gpu(self.id)
    }

    /// Capabilities
    #[inline]
    pub fn caps(&self) -> &GpuCaps {
        &self.caps
    }

    /// Chunk sizes backing user memory
    #[inline]
    pub fn chunk_sizes(&self) -> ChunkSizes {
        self.chunks.supported_sizes()
    }

    /// Chunk allocator
    #[inline]
    pub fn chunks(&self) -> &dyn ChunkAllocator {
        &*self.chunks
    }

    /// Page tree
    #[inline]
    pub fn page_tree(&self) -> &dyn PageTree {
        &*self.page_tree
    }

    /// Copy engine
    #[inline]
    pub fn copy_engine(&self) -> &dyn CopyEngine {
        &*self.copy_engine
    }

    /// Is local memory swizzled under big PTEs?
    #[inline]
    pub fn swizzles(&self, config: &MappingConfig) -> bool {
        self.caps.swizzling && config.enable_swizzling
    }

    /// Can the GPU map a block with big PTEs?
    #[inline]
    pub fn uses_big_ptes(&self, config: &MappingConfig) -> bool {
        config.enable_big_ptes && self.caps.page_sizes.contains(PageSizes::BIG)
    }

    /// Can the GPU map a block with one 2M PTE?
    ///
    /// Swizzling GPUs never do: a 2M leaf over local memory would need the
    /// whole block converted.
    #[inline]
    pub fn uses_2m_ptes(&self, config: &MappingConfig) -> bool {
        config.enable_2m_ptes && self.caps.page_sizes.contains(PageSizes::SIZE_2M) && !self.swizzles(config)
    }

    /// Has the GPU hit a fatal error?
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    /// Latch the fatal state; returns `true` the first time
    pub fn set_fatal(&self) -> bool {
        !self.fatal.swap(true, Ordering::AcqRel)
    }

    /// Fail with `GpuFatal` once the GPU is dead
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_fatal() {
            Err(Error::GpuFatal(self.id))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for VaGpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaGpu")
            .field("id", &self.id)
            .field("caps", &self.caps)
            .field("fatal", &self.is_fatal())
            .finish_non_exhaustive()
    }
}
