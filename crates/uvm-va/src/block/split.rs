//! # Block Split
//!
//! Splitting a block at a page boundary `B` into `[start, B)` and
//! `[B, end]`.
//!
//! ```text
//!   phase 1 (may fail, retried with eviction)
//!     ├─ remap without leaves crossing B: no 2M leaf, 4K leaves in the big
//!     │  region that straddles B (un-swizzles it)
//!     └─ split every chunk straddling B; on failure merge back what was
//!        split so far, on every GPU
//!   phase 2 (cannot fail)
//!     └─ move everything at or above B into the new block: page masks,
//!        chunks, CPU pages, PTE ranges and their shadows
//! ```
//!
//! A failed split leaves the residency, protections and chunks of the
//! block as they were. Only the page-table shape may differ, and the next
//! mapping sync merges it back.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use uvm_core::{Error, GpuId, PageIndex, PageMask, PageRegion, Result, VirtAddr, PAGE_SIZE};
use uvm_mem::{ChunkAllocator, ChunkLayout, ChunkSizes, GpuChunk, PteValue};

use super::pte::ShapeLimits;
use super::state::{BigRegions, BlockState, GpuPtes, GpuState};
use super::VaBlock;
use crate::context::VaContext;
use crate::gpu::VaGpu;
use crate::perf::PerfEvent;
use crate::range::VaRange;

/// Chunks replacing one straddling chunk, in address order
type Pieces = Vec<GpuChunk>;

/// Split `chunk`, mapped at `va`, until no piece straddles `boundary`
///
/// On failure every piece made so far comes back, in address order, so the
/// caller can merge them again.
fn split_straddling(
    chunks: &dyn ChunkAllocator,
    sizes: ChunkSizes,
    chunk: GpuChunk,
    va: VirtAddr,
    boundary: VirtAddr,
) -> core::result::Result<Pieces, (Error, Pieces)> {
    let size = chunk.size();
    if boundary <= va || boundary >= va + size {
        return Ok(alloc::vec![chunk]);
    }
    let Some(smaller) = sizes.next_smaller(size) else {
        return Err((Error::InvalidParameter, alloc::vec![chunk]));
    };
    let subchunks = chunks
        .split(chunk, smaller)
        .map_err(|(err, chunk)| (err, alloc::vec![chunk]))?;

    let mut pieces = Vec::with_capacity(subchunks.len());
    let mut rest = subchunks.into_iter();
    let mut sub_va = va;
    while let Some(sub) = rest.next() {
        match split_straddling(chunks, sizes, sub, sub_va, boundary) {
            Ok(split) => pieces.extend(split),
            Err((err, split)) => {
                pieces.extend(split);
                pieces.extend(rest);
                return Err((err, pieces));
            }
        }
        sub_va = sub_va + smaller;
    }
    Ok(pieces)
}

/// Undo [`split_straddling`]: merge address-ordered pieces back into one
/// chunk of `size`
fn merge_pieces(chunks: &dyn ChunkAllocator, sizes: ChunkSizes, mut pieces: Pieces, size: u64) -> Result<GpuChunk> {
    if pieces.len() == 1 && pieces[0].size() == size {
        return pieces.pop().ok_or(Error::InvalidParameter);
    }
    let smaller = sizes.next_smaller(size).ok_or(Error::InvalidParameter)?;
    let mut siblings = Vec::new();
    let mut group = Vec::new();
    let mut bytes = 0;
    for piece in pieces {
        bytes += piece.size();
        group.push(piece);
        if bytes == smaller {
            siblings.push(merge_pieces(chunks, sizes, core::mem::take(&mut group), smaller)?);
            bytes = 0;
        }
    }
    if !group.is_empty() {
        log::error!("{:?}: pieces do not add up to 0x{:x}", chunks.gpu(), size);
        return Err(Error::InvalidParameter);
    }
    chunks.merge(siblings)
}

/// Hand the chunks keyed by first page to the slots of `layout`
fn assign_chunks(layout: &ChunkLayout, base: PageIndex, by_page: &mut HashMap<PageIndex, GpuChunk>) -> Vec<Option<GpuChunk>> {
    layout
        .entries()
        .iter()
        .map(|entry| {
            let chunk = by_page.remove(&(base + entry.region.first));
            debug_assert!(chunk.as_ref().map_or(true, |c| c.size() == entry.size));
            chunk
        })
        .collect()
}

impl GpuState {
    /// Keep `[start, boundary)`, return the state of `[boundary, end]`
    #[allow(clippy::too_many_arguments)]
    fn split_off(
        &mut self,
        gpu: &VaGpu,
        start: VirtAddr,
        boundary: VirtAddr,
        end: VirtAddr,
        boundary_page: PageIndex,
        pages: usize,
        straddling: Option<(usize, Pieces)>,
    ) -> GpuState {
        let sizes = gpu.chunk_sizes();
        let last = VirtAddr::new(boundary.raw() - 1);
        let lower_layout = ChunkLayout::new(start, last, sizes);
        let upper_layout = ChunkLayout::new(boundary, end, sizes);

        let mut by_page = HashMap::new();
        for (entry, slot) in self.layout.entries().iter().zip(self.chunks.iter_mut()) {
            if let Some(chunk) = slot.take() {
                by_page.insert(entry.region.first, chunk);
            }
        }
        if let Some((index, pieces)) = straddling {
            let mut page = self.layout.entries()[index].region.first;
            for piece in pieces {
                let count = piece.pages();
                by_page.insert(page, piece);
                page += count;
            }
        }
        self.chunks = assign_chunks(&lower_layout, 0, &mut by_page);
        let upper_chunks = assign_chunks(&upper_layout, boundary_page, &mut by_page);
        for (_, chunk) in by_page.drain() {
            log::error!("{:?}: {:?} fits neither half of the split", gpu.id(), chunk);
            gpu.chunks().free(chunk);
        }
        self.layout = lower_layout;

        let big_page_size = gpu.caps().big_page_size;
        let old_big = self.big;
        let lower_big = BigRegions::new(start, last, big_page_size);
        let upper_big = BigRegions::new(boundary, end, big_page_size);
        debug_assert!(self.ptes.range_2m.is_none(), "split with a 2M reservation");

        let ptes = &mut self.ptes;
        let upper_small = ptes.small.split_off(boundary_page);
        let upper_big_ptes = ptes.big[old_big.count - upper_big.count..].to_vec();
        ptes.big.truncate(lower_big.count);
        let (lower_4k, upper_4k) = match ptes.range_4k.take() {
            Some(range) => range.split(boundary, boundary),
            None => (None, None),
        };
        let (lower_big_range, upper_big_range) = match ptes.range_big.take() {
            Some(range) => range.split(boundary.align_down(big_page_size), boundary.align_up(big_page_size)),
            None => (None, None),
        };
        ptes.range_4k = lower_4k;
        ptes.range_big = lower_big_range;
        self.big = lower_big;

        let cut = PageRegion::new(boundary_page, pages);
        let upper_swizzled = self.swizzled.shifted_down(boundary_page);
        self.swizzled.region_clear(cut);
        let upper_procs = self.procs.split_off(boundary_page, pages);

        GpuState {
            layout: upper_layout,
            chunks: upper_chunks,
            procs: upper_procs,
            swizzled: upper_swizzled,
            big: upper_big,
            ptes: GpuPtes {
                range_2m: None,
                range_big: upper_big_range,
                range_4k: upper_4k,
                slot: PteValue::Invalid,
                big: upper_big_ptes,
                small: upper_small,
            },
        }
    }
}

impl BlockState {
    /// Pages of every big region that straddles `boundary_page`
    fn straddling_big_pages(&self, boundary_page: PageIndex) -> PageMask {
        let mut pages = PageMask::new();
        for (_, state) in self.gpu_states() {
            if let Some(index) = state.big.index_of(boundary_page) {
                let region = state.big.region(index);
                if region.first < boundary_page {
                    pages.region_fill(region);
                }
            }
        }
        pages
    }

    /// Split the chunk of `id` straddling `boundary_page`, if any
    fn split_gpu_chunk(
        &mut self,
        ctx: &VaContext,
        id: GpuId,
        boundary_page: PageIndex,
    ) -> Result<Option<(GpuId, usize, Pieces)>> {
        let gpu = ctx.gpu(id)?.clone();
        let start = self.start;
        let Some(state) = self.gpu_mut(id) else {
            return Ok(None);
        };
        let Some(index) = state.layout.chunk_index(boundary_page) else {
            return Ok(None);
        };
        let entry = state.layout.entries()[index];
        if entry.region.first == boundary_page {
            return Ok(None);
        }
        let Some(chunk) = state.chunks[index].take() else {
            return Ok(None);
        };

        let va = start + entry.region.first as u64 * PAGE_SIZE;
        let boundary = start + boundary_page as u64 * PAGE_SIZE;
        match split_straddling(gpu.chunks(), gpu.chunk_sizes(), chunk, va, boundary) {
            Ok(pieces) => {
                log::trace!("{:?}: split 0x{:x} chunk into {} pieces", id, entry.size, pieces.len());
                Ok(Some((id, index, pieces)))
            }
            Err((err, pieces)) => match merge_pieces(gpu.chunks(), gpu.chunk_sizes(), pieces, entry.size) {
                Ok(chunk) => {
                    state.chunks[index] = Some(chunk);
                    Err(err)
                }
                Err(merge_err) => {
                    log::error!("{:?}: cannot merge chunk back after failed split: {}", id, merge_err);
                    Err(ctx.mark_fatal(id))
                }
            },
        }
    }

    /// Put a split chunk back together
    fn restore_chunk(&mut self, ctx: &VaContext, id: GpuId, index: usize, pieces: Pieces) {
        let Some(gpu) = ctx.gpu_any(id).cloned() else {
            return;
        };
        let Some(state) = self.gpu_mut(id) else {
            return;
        };
        let size = state.layout.entries()[index].size;
        match merge_pieces(gpu.chunks(), gpu.chunk_sizes(), pieces, size) {
            Ok(chunk) => state.chunks[index] = Some(chunk),
            Err(err) => {
                log::error!("{:?}: cannot merge chunk back after failed split: {}", id, err);
                ctx.mark_fatal(id);
            }
        }
    }

    /// Phase 1 chunk work on every GPU, all or nothing
    fn split_chunks(&mut self, ctx: &VaContext, boundary_page: PageIndex) -> Result<Vec<(GpuId, usize, Pieces)>> {
        let ids: Vec<GpuId> = self.gpu_states().map(|(id, _)| id).collect();
        let mut done = Vec::new();
        for id in ids {
            match self.split_gpu_chunk(ctx, id, boundary_page) {
                Ok(Some(split)) => done.push(split),
                Ok(None) => {}
                Err(err) => {
                    while let Some((gpu, index, pieces)) = done.pop() {
                        self.restore_chunk(ctx, gpu, index, pieces);
                    }
                    return Err(err);
                }
            }
        }
        Ok(done)
    }

    /// Phase 2: move `[boundary_page, pages)` into a new state
    fn split_off(
        &mut self,
        ctx: &VaContext,
        boundary_page: PageIndex,
        mut straddling: Vec<(GpuId, usize, Pieces)>,
        range: Arc<VaRange>,
    ) -> BlockState {
        let pages = self.pages();
        let boundary = self.page_addr(boundary_page);
        let end = self.end;
        let mut upper = BlockState::new(boundary, end, range);
        self.end = VirtAddr::new(boundary.raw() - 1);

        upper.cpu.pages = self.cpu.pages.split_off(boundary_page);
        upper.cpu.shadow = self.cpu.shadow.split_off(boundary_page);
        upper.cpu.procs = self.cpu.procs.split_off(boundary_page, pages);

        upper.gpus.resize_with(self.gpus.len(), || None);
        for index in 0..self.gpus.len() {
            let id = GpuId::new(index as u8);
            let Some(gpu) = ctx.gpu_any(id).cloned() else {
                continue;
            };
            let Some(state) = self.gpus[index].as_deref_mut() else {
                continue;
            };
            let pieces = straddling
                .iter()
                .position(|(g, ..)| *g == id)
                .map(|i| straddling.swap_remove(i))
                .map(|(_, slot, pieces)| (slot, pieces));
            let upper_state = state.split_off(&gpu, self.start, boundary, end, boundary_page, pages, pieces);
            upper.gpus[index] = Some(Box::new(upper_state));
        }
        debug_assert!(straddling.is_empty());

        upper.read_duplicated = self.read_duplicated.shifted_down(boundary_page);
        self.read_duplicated.region_clear(PageRegion::new(boundary_page, pages));
        upper.tracker = self.tracker.clone();

        self.perf_notify(ctx, &PerfEvent::BlockShrink);
        self.update_masks(ctx);
        upper.update_masks(ctx);
        upper
    }
}

impl VaBlock {
    /// Split the block so that it ends at `new_end`; the rest moves to a new
    /// block belonging to `upper_range`
    ///
    /// On failure the block keeps its residency, protections and chunks.
    pub(crate) fn split(&self, ctx: &VaContext, new_end: VirtAddr, upper_range: Arc<VaRange>) -> Result<VaBlock> {
        let boundary = new_end + 1;
        if !boundary.is_aligned(PAGE_SIZE) || boundary <= self.start() || new_end >= self.end() {
            return Err(Error::InvalidParameter);
        }
        let boundary_page = ((boundary - self.start()) / PAGE_SIZE) as usize;

        let upper = self.with_retry(ctx, |state, retry| {
            let limits = ShapeLimits {
                no_2m: true,
                force_4k: state.straddling_big_pages(boundary_page),
            };
            state.sync_mappings(ctx, retry, &limits)?;
            state.wait_tracker(ctx)?;
            let straddling = state.split_chunks(ctx, boundary_page)?;
            Ok(state.split_off(ctx, boundary_page, straddling, upper_range.clone()))
        })?;
        self.end.store(new_end.raw(), core::sync::atomic::Ordering::Release);
        log::debug!("{:?}: split at {:?}", self.start(), boundary);

        let block = VaBlock::from_state(upper);
        Self::check(ctx, &block.state.lock());
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvm_core::{PhysAddr, PAGE_SIZE_2M};
    use uvm_mem::SoftChunkPool;

    const K64: u64 = 64 * 1024;

    fn pool() -> SoftChunkPool {
        SoftChunkPool::new(GpuId::new(0), PhysAddr::new(0), 1, ChunkSizes::DEFAULT)
    }

    #[test]
    fn test_split_straddling_only_splits_along_the_boundary() {
        let pool = pool();
        let root = pool.alloc(PAGE_SIZE_2M, false).unwrap();
        let boundary = VirtAddr::new(PAGE_SIZE_2M + 5 * PAGE_SIZE);
        let pieces = split_straddling(&pool, ChunkSizes::DEFAULT, root, VirtAddr::new(PAGE_SIZE_2M), boundary).unwrap();

        assert_eq!(pieces.len(), 16 + 31);
        assert!(pieces[..16].iter().all(|c| c.size() == PAGE_SIZE));
        assert!(pieces[16..].iter().all(|c| c.size() == K64));
        assert_eq!(pieces[16].addr(), PhysAddr::new(K64));

        let merged = merge_pieces(&pool, ChunkSizes::DEFAULT, pieces, PAGE_SIZE_2M).unwrap();
        assert_eq!(merged.size(), PAGE_SIZE_2M);
        assert_eq!(merged.addr(), PhysAddr::new(0));
    }

    #[test]
    fn test_chunk_on_one_side_is_left_alone() {
        let pool = pool();
        let chunk = pool.alloc(K64, false).unwrap();
        let pieces = split_straddling(&pool, ChunkSizes::DEFAULT, chunk, VirtAddr::new(0), VirtAddr::new(K64)).unwrap();
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].size(), K64);
    }

    #[test]
    fn test_failed_split_hands_back_the_chunk() {
        let pool = pool();
        let root = pool.alloc(PAGE_SIZE_2M, false).unwrap();
        pool.inject_split_failures(1);
        let (err, pieces) =
            split_straddling(&pool, ChunkSizes::DEFAULT, root, VirtAddr::new(0), VirtAddr::new(K64)).unwrap_err();
        assert_eq!(err, Error::OutOfMemory);
        let root = merge_pieces(&pool, ChunkSizes::DEFAULT, pieces, PAGE_SIZE_2M).unwrap();
        assert_eq!(root.size(), PAGE_SIZE_2M);
    }
}
