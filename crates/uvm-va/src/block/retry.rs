//! Retry context of block operations.
//!
//! Block operations run under the block lock and only allocate without
//! eviction there. When an allocation comes up short the operation records
//! what it needed and unwinds with `MoreProcessingRequired`; the driver loop
//! drops the lock, allocates with eviction allowed, and runs the operation
//! again with the preallocated resources available.

use alloc::vec::Vec;

use uvm_core::{Error, GpuId, Result, VirtAddr};
use uvm_mem::{GpuChunk, PageSize, PteRange};

use crate::context::VaContext;

/// Allocation an operation could not make without eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryNeed {
    /// A user chunk
    Chunk {
        /// GPU to allocate on
        gpu: GpuId,
        /// Chunk size
        size: u64,
    },
    /// Page-table storage for a range
    Ptes {
        /// GPU whose tree needs tables
        gpu: GpuId,
        /// Level
        size: PageSize,
        /// First address
        start: VirtAddr,
        /// Length in bytes
        len: u64,
    },
}

/// Resources carried across retries of one block operation
#[derive(Debug, Default)]
pub struct VaBlockRetry {
    free_chunks: Vec<GpuChunk>,
    pte_refs: Vec<PteRange>,
    pub(crate) pending: Option<RetryNeed>,
    attempts: u32,
}

impl VaBlockRetry {
    /// Empty retry context
    pub fn new() -> Self {
        Self::default()
    }

    /// Times the operation was re-run
    #[inline]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Take a preallocated chunk matching `gpu` and `size`
    pub(crate) fn take_chunk(&mut self, gpu: GpuId, size: u64) -> Option<GpuChunk> {
        let index = self
            .free_chunks
            .iter()
            .position(|c| c.gpu() == gpu && c.size() == size)?;
        Some(self.free_chunks.swap_remove(index))
    }

    /// Record an allocation failure and return the status that unwinds the
    /// operation; the first need of an attempt wins
    pub(crate) fn need(&mut self, need: RetryNeed) -> Error {
        log::debug!("block operation needs {:?}", need);
        self.pending.get_or_insert(need);
        Error::MoreProcessingRequired
    }

    /// Satisfy the pending need with eviction allowed
    ///
    /// Called with no block lock held.
    pub(crate) fn prepare(&mut self, ctx: &VaContext) -> Result<()> {
        self.attempts += 1;
        match self.pending.take() {
            None => Ok(()),
            Some(RetryNeed::Chunk { gpu, size }) => {
                let chunk = ctx.gpu(gpu)?.chunks().alloc(size, true)?;
                self.free_chunks.push(chunk);
                Ok(())
            }
            Some(RetryNeed::Ptes { gpu, size, start, len }) => {
                let range = ctx.gpu(gpu)?.page_tree().get_or_alloc_ptes(size, start, len, true)?;
                self.pte_refs.push(range);
                Ok(())
            }
        }
    }

    /// Return unused resources
    pub(crate) fn release(&mut self, ctx: &VaContext) {
        for chunk in self.free_chunks.drain(..) {
            match ctx.gpu_any(chunk.gpu()) {
                Some(gpu) => gpu.chunks().free(chunk),
                None => log::error!("leaking {:?}: GPU is gone", chunk),
            }
        }
        self.pte_refs.clear();
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_need_records_and_unwinds() {
        let mut retry = VaBlockRetry::new();
        let gpu = GpuId::new(1);
        let err = retry.need(RetryNeed::Chunk { gpu, size: 4096 });
        assert_eq!(err, Error::MoreProcessingRequired);
        assert!(err.is_retry());
        assert_eq!(retry.pending, Some(RetryNeed::Chunk { gpu, size: 4096 }));
        assert!(retry.take_chunk(gpu, 4096).is_none());
    }
}
