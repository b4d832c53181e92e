//! # Chunk Layout
//!
//! Which chunk size backs each page of a VA block.
//!
//! Every page is backed by the largest supported chunk whose naturally
//! aligned placement covers the page and stays inside the block:
//!
//! ```text
//! block   [  4K  |  4K  |      64K      |        ...        |  4K  ]
//!          ^unaligned start                                  ^unaligned end
//! ```
//!
//! The layout only depends on the block bounds, so splitting a block can
//! only ever split the chunk that straddles the new boundary; chunks fully on
//! one side keep their size.

use alloc::vec::Vec;

use uvm_core::{PageIndex, PageRegion, VirtAddr, PAGE_SIZE};

use crate::chunk::ChunkSizes;

/// One chunk slot of a layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutEntry {
    /// Pages covered, block-relative
    pub region: PageRegion,
    /// Chunk size in bytes
    pub size: u64,
}

/// Chunk slots covering a block, in address order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLayout {
    entries: Vec<LayoutEntry>,
}

/// Largest supported chunk size for `page` of the block `[start, end]`
pub fn chunk_size_for_page(start: VirtAddr, end: VirtAddr, sizes: ChunkSizes, page: PageIndex) -> u64 {
    let addr = start.raw() + page as u64 * PAGE_SIZE;
    sizes
        .sizes_desc()
        .find(|size| {
            let window = addr & !(size - 1);
            window >= start.raw() && window + size - 1 <= end.raw()
        })
        .unwrap_or(PAGE_SIZE)
}

impl ChunkLayout {
    /// Layout of the block `[start, end]` (inclusive end)
    pub fn new(start: VirtAddr, end: VirtAddr, sizes: ChunkSizes) -> Self {
        let mut entries = Vec::new();
        let mut addr = start.raw();
        while addr <= end.raw() {
            let size = sizes
                .sizes_desc()
                .find(|size| addr & (size - 1) == 0 && addr + size - 1 <= end.raw())
                .unwrap_or(PAGE_SIZE);
            let first = ((addr - start.raw()) / PAGE_SIZE) as usize;
            let pages = (size / PAGE_SIZE) as usize;
            entries.push(LayoutEntry {
                region: PageRegion::new(first, first + pages),
                size,
            });
            addr += size;
        }
        Self { entries }
    }

    /// Number of chunk slots
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the layout empty?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All slots
    #[inline]
    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }

    /// Slot index backing a page
    pub fn chunk_index(&self, page: PageIndex) -> Option<usize> {
        let index = self.entries.partition_point(|e| e.region.outer <= page);
        (index < self.entries.len() && self.entries[index].region.contains(page)).then_some(index)
    }

    /// Slot backing a page
    pub fn entry_for(&self, page: PageIndex) -> Option<LayoutEntry> {
        self.chunk_index(page).map(|i| self.entries[i])
    }

    /// Slots intersecting a region
    pub fn entries_in(&self, region: PageRegion) -> impl Iterator<Item = (usize, LayoutEntry)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(move |(_, e)| !e.region.intersect(&region).is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvm_core::PAGE_SIZE_2M;

    const K64: u64 = 64 * 1024;

    #[test]
    fn test_full_block_is_one_root() {
        let start = VirtAddr::new(PAGE_SIZE_2M);
        let end = VirtAddr::new(2 * PAGE_SIZE_2M - 1);
        let layout = ChunkLayout::new(start, end, ChunkSizes::DEFAULT);
        assert_eq!(layout.len(), 1);
        assert_eq!(layout.entries()[0].size, PAGE_SIZE_2M);
        assert_eq!(layout.chunk_index(511), Some(0));
    }

    #[test]
    fn test_unaligned_block() {
        // 8K of 4K chunks, then 64K chunks, then a 4K tail
        let start = VirtAddr::new(K64 - 2 * PAGE_SIZE);
        let end = VirtAddr::new(3 * K64 + PAGE_SIZE - 1);
        let layout = ChunkLayout::new(start, end, ChunkSizes::DEFAULT);
        let sizes: Vec<u64> = layout.entries().iter().map(|e| e.size).collect();
        assert_eq!(sizes, alloc::vec![PAGE_SIZE, PAGE_SIZE, K64, K64, PAGE_SIZE]);
        assert_eq!(layout.chunk_index(2), Some(2));
        assert_eq!(layout.entry_for(17).unwrap().region, PageRegion::new(2, 18));
        assert_eq!(layout.chunk_index(35), None);
    }

    #[test]
    fn test_layout_matches_per_page_rule() {
        let start = VirtAddr::new(PAGE_SIZE_2M + 3 * PAGE_SIZE);
        let end = VirtAddr::new(PAGE_SIZE_2M + 37 * K64 / 2 - 1);
        let layout = ChunkLayout::new(start, end, ChunkSizes::DEFAULT);
        let pages = ((end.raw() - start.raw() + 1) / PAGE_SIZE) as usize;
        for page in 0..pages {
            let entry = layout.entry_for(page).unwrap();
            assert_eq!(entry.size, chunk_size_for_page(start, end, ChunkSizes::DEFAULT, page));
        }
    }

    #[test]
    fn test_split_only_splits_straddling_chunk() {
        let start = VirtAddr::new(0);
        let end = VirtAddr::new(4 * K64 - 1);
        let whole = ChunkLayout::new(start, end, ChunkSizes::DEFAULT);
        let boundary = VirtAddr::new(K64 + 3 * PAGE_SIZE);
        let lower = ChunkLayout::new(start, VirtAddr::new(boundary.raw() - 1), ChunkSizes::DEFAULT);

        assert_eq!(whole.entries()[0], lower.entries()[0]);
        assert!(lower.entries()[1..].iter().all(|e| e.size == PAGE_SIZE));
    }
}
