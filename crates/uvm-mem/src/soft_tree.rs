//! # Software Page Tree
//!
//! A [`PageTree`] that keeps its tables in host memory, backed by kernel
//! chunks of the GPU's allocator for accounting.
//!
//! Besides recording what a real MMU would see, the tree models the TLB of
//! its GPU closely enough to catch ordering bugs: for every 4K page it keeps
//! the set of leaf levels that may be cached since the last invalidate.
//! Whenever an entry write makes a page translate through a level other than
//! the ones already cached, both translations could be live in the TLB at
//! once. That is counted as a coherence violation.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;
use spin::Mutex;
use uvm_core::{Error, GpuId, MemAddr, Prot, Result, VirtAddr, PAGE_SIZE, PAGE_SIZE_2M};

use crate::chunk::{ChunkAllocator, GpuChunk};
use crate::page_tree::{Membar, PageSize, PageSizes, PageTree, PteRange, PteStorage, PteValue, TlbBatch, TlbRange};

// =============================================================================
// RECORDS
// =============================================================================

/// One TLB invalidate as issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlbInvalidate {
    /// Invalidated ranges (empty when `all`)
    pub ranges: Vec<TlbRange>,
    /// Whole address space invalidated
    pub all: bool,
    /// Barrier
    pub membar: Membar,
}

/// Result of walking the tables for one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Physical address of the byte
    pub target: MemAddr,
    /// Protection
    pub prot: Prot,
    /// Level of the leaf
    pub size: PageSize,
}

// =============================================================================
// TABLES
// =============================================================================

#[derive(Debug)]
struct Table {
    entries: Vec<PteValue>,
    refs: u32,
    backing: GpuChunk,
}

#[derive(Debug)]
struct Region {
    slot: PteValue,
    slot_refs: u32,
    big: Option<Table>,
    small: Option<Table>,
}

impl Region {
    fn new() -> Self {
        Self {
            slot: PteValue::Invalid,
            slot_refs: 0,
            big: None,
            small: None,
        }
    }

    fn has_lower(&self) -> bool {
        self.big.is_some() || self.small.is_some()
    }

    fn is_unused(&self) -> bool {
        self.slot_refs == 0 && !self.has_lower() && self.slot == PteValue::Invalid
    }

    fn table(&self, size: PageSize) -> Option<&Table> {
        match size {
            PageSize::Big => self.big.as_ref(),
            PageSize::Size4K => self.small.as_ref(),
            PageSize::Size2M => None,
        }
    }

    fn table_mut(&mut self, size: PageSize) -> Option<&mut Table> {
        match size {
            PageSize::Big => self.big.as_mut(),
            PageSize::Size4K => self.small.as_mut(),
            PageSize::Size2M => None,
        }
    }

    fn slot_reset_value(&self) -> PteValue {
        if self.has_lower() {
            PteValue::NextLevel
        } else {
            PteValue::Invalid
        }
    }
}

const fn initial_entry(size: PageSize) -> PteValue {
    match size {
        PageSize::Big => PteValue::NextLevel,
        _ => PteValue::Invalid,
    }
}

#[derive(Debug)]
struct TreeState {
    big_page_size: u64,
    regions: BTreeMap<u64, Region>,
    /// Leaf levels possibly cached per 4K page, keyed by page number
    cached: HashMap<u64, u8>,
    invalidates: Vec<TlbInvalidate>,
    writes: u64,
    violations: u64,
}

impl TreeState {
    fn region_base(va: u64) -> u64 {
        va & !(PAGE_SIZE_2M - 1)
    }

    fn walk(&self, va: u64) -> Option<Translation> {
        let base = Self::region_base(va);
        let region = self.regions.get(&base)?;
        let leaf = |value: &PteValue, entry_size: u64, size: PageSize| match value {
            PteValue::Leaf { target, prot } => Some(Translation {
                target: target.offset(va & (entry_size - 1)),
                prot: *prot,
                size,
            }),
            _ => None,
        };
        match region.slot {
            PteValue::Leaf { .. } => return leaf(&region.slot, PAGE_SIZE_2M, PageSize::Size2M),
            PteValue::Invalid => return None,
            PteValue::NextLevel => {}
        }
        if let Some(big) = &region.big {
            let index = ((va - base) / self.big_page_size) as usize;
            match &big.entries[index] {
                PteValue::NextLevel => {}
                value => return leaf(value, self.big_page_size, PageSize::Big),
            }
        }
        let small = region.small.as_ref()?;
        leaf(&small.entries[((va - base) / PAGE_SIZE) as usize], PAGE_SIZE, PageSize::Size4K)
    }

    fn effective_level(&self, va: u64) -> u8 {
        self.walk(va).map_or(0, |t| t.size.flag().bits())
    }

    /// Fold the current translation of `[start, end)` into the cached sets
    fn observe(&mut self, gpu: GpuId, start: u64, end: u64) {
        let mut violated = false;
        let mut page = start & !(PAGE_SIZE - 1);
        while page < end {
            let level = self.effective_level(page);
            let key = page / PAGE_SIZE;
            let cached = self.cached.get(&key).copied().unwrap_or(0) | level;
            if cached != 0 {
                self.cached.insert(key, cached);
            }
            if cached.count_ones() > 1 && !violated {
                log::error!(
                    "{:?}: page 0x{:x} translated at levels {:?} without an invalidate",
                    gpu,
                    page,
                    PageSizes::from_bits_truncate(cached)
                );
                violated = true;
            }
            page += PAGE_SIZE;
        }
        if violated {
            self.violations += 1;
        }
    }

    fn flush(&mut self, start: u64, end: u64) {
        let mut page = start & !(PAGE_SIZE - 1);
        while page < end {
            let key = page / PAGE_SIZE;
            if self.cached.contains_key(&key) {
                let level = self.effective_level(page);
                if level == 0 {
                    self.cached.remove(&key);
                } else {
                    self.cached.insert(key, level);
                }
            }
            page += PAGE_SIZE;
        }
    }

    fn flush_all(&mut self) {
        let keys: Vec<u64> = self.cached.keys().copied().collect();
        for key in keys {
            let level = self.effective_level(key * PAGE_SIZE);
            if level == 0 {
                self.cached.remove(&key);
            } else {
                self.cached.insert(key, level);
            }
        }
    }

    fn set_entry(&mut self, gpu: GpuId, size: PageSize, va: u64, value: PteValue) {
        let base = Self::region_base(va);
        let big = self.big_page_size;
        let Some(region) = self.regions.get_mut(&base) else {
            debug_assert!(false, "write to unallocated region 0x{:x}", va);
            return;
        };
        let entry_size = size.bytes(big);
        let entry_va = va & !(entry_size - 1);
        match size {
            PageSize::Size2M => region.slot = value,
            _ => {
                let Some(table) = region.table_mut(size) else {
                    debug_assert!(false, "write to missing {:?} table at 0x{:x}", size, va);
                    return;
                };
                table.entries[((entry_va - base) / entry_size) as usize] = value;
            }
        }
        self.writes += 1;
        self.observe(gpu, entry_va, entry_va + entry_size);
    }

    /// Reset entries of `size` fully inside `[start, end)`
    fn reset_span(&mut self, gpu: GpuId, size: PageSize, start: u64, end: u64) {
        let entry_size = size.bytes(self.big_page_size);
        let mut va = (start + entry_size - 1) & !(entry_size - 1);
        while va + entry_size <= end {
            let base = Self::region_base(va);
            let value = match self.regions.get(&base) {
                Some(region) if size == PageSize::Size2M => region.slot_reset_value(),
                Some(region) if region.table(size).is_some() => initial_entry(size),
                _ => {
                    va += entry_size;
                    continue;
                }
            };
            self.set_entry(gpu, size, va, value);
            va += entry_size;
        }
    }
}

// =============================================================================
// SOFT PAGE TREE
// =============================================================================

struct TreeInner {
    gpu: GpuId,
    sizes: PageSizes,
    big_page_size: u64,
    chunks: Arc<dyn ChunkAllocator>,
    state: Mutex<TreeState>,
}

impl TreeInner {
    fn finish(&self, spare: Vec<GpuChunk>) {
        for chunk in spare {
            self.chunks.free(chunk);
        }
    }
}

impl PteStorage for TreeInner {
    fn retain(&self, size: PageSize, start: VirtAddr) {
        let mut state = self.state.lock();
        let Some(region) = state.regions.get_mut(&TreeState::region_base(start.raw())) else {
            debug_assert!(false, "retain of unallocated region {:?}", start);
            return;
        };
        match size {
            PageSize::Size2M => region.slot_refs += 1,
            _ => {
                if let Some(table) = region.table_mut(size) {
                    table.refs += 1;
                }
            }
        }
    }

    fn release(&self, size: PageSize, start: VirtAddr, len: u64) {
        let mut spare = Vec::new();
        {
            let mut state = self.state.lock();
            let base = TreeState::region_base(start.raw());
            if len > 0 {
                state.reset_span(self.gpu, size, start.raw(), start.raw() + len);
            }

            let Some(region) = state.regions.get_mut(&base) else {
                debug_assert!(false, "release of unallocated region {:?}", start);
                return;
            };
            let slot_update = match size {
                PageSize::Size2M => {
                    region.slot_refs -= 1;
                    (region.slot_refs == 0).then(|| region.slot_reset_value())
                }
                _ => {
                    let table = match size {
                        PageSize::Big => &mut region.big,
                        _ => &mut region.small,
                    };
                    let freed = match table.as_mut() {
                        Some(t) => {
                            t.refs -= 1;
                            t.refs == 0
                        }
                        None => false,
                    };
                    if freed {
                        if let Some(t) = table.take() {
                            spare.push(t.backing);
                        }
                    }
                    (region.slot_refs == 0 && !region.has_lower() && region.slot != PteValue::Invalid)
                        .then_some(PteValue::Invalid)
                }
            };
            if let Some(value) = slot_update {
                state.set_entry(self.gpu, PageSize::Size2M, base, value);
            } else {
                // Entries of a freed table no longer translate
                state.observe(self.gpu, base, base + PAGE_SIZE_2M);
            }
            if state.regions.get(&base).is_some_and(Region::is_unused) {
                state.regions.remove(&base);
            }
        }
        self.finish(spare);
    }

    fn reset(&self, size: PageSize, start: VirtAddr, len: u64) {
        let mut state = self.state.lock();
        state.reset_span(self.gpu, size, start.raw(), start.raw() + len);
    }
}

impl fmt::Debug for TreeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeInner")
            .field("gpu", &self.gpu)
            .field("sizes", &self.sizes)
            .field("big_page_size", &self.big_page_size)
            .finish_non_exhaustive()
    }
}

/// Host-memory page tree for one GPU
#[derive(Debug, Clone)]
pub struct SoftPageTree {
    inner: Arc<TreeInner>,
}

impl SoftPageTree {
    /// Create a tree whose tables are charged to `chunks`
    pub fn new(chunks: Arc<dyn ChunkAllocator>, big_page_size: u64, sizes: PageSizes) -> Self {
        debug_assert!(big_page_size.is_power_of_two() && big_page_size > PAGE_SIZE);
        Self {
            inner: Arc::new(TreeInner {
                gpu: chunks.gpu(),
                sizes: sizes | PageSizes::SIZE_4K,
                big_page_size,
                chunks,
                state: Mutex::new(TreeState {
                    big_page_size,
                    regions: BTreeMap::new(),
                    cached: HashMap::new(),
                    invalidates: Vec::new(),
                    writes: 0,
                    violations: 0,
                }),
            }),
        }
    }

    /// Translate an address as the GPU would
    pub fn translate(&self, va: VirtAddr) -> Option<Translation> {
        self.inner.state.lock().walk(va.raw())
    }

    /// Current value of the entry of `size` mapping `va`
    pub fn entry(&self, size: PageSize, va: VirtAddr) -> Option<PteValue> {
        let state = self.inner.state.lock();
        let base = TreeState::region_base(va.raw());
        let region = state.regions.get(&base)?;
        match size {
            PageSize::Size2M => Some(region.slot),
            _ => {
                let entry_size = size.bytes(self.inner.big_page_size);
                region
                    .table(size)
                    .map(|t| t.entries[((va.raw() - base) / entry_size) as usize])
            }
        }
    }

    /// Invalidates issued so far
    pub fn invalidates(&self) -> Vec<TlbInvalidate> {
        self.inner.state.lock().invalidates.clone()
    }

    /// Drain the invalidate log
    pub fn take_invalidates(&self) -> Vec<TlbInvalidate> {
        core::mem::take(&mut self.inner.state.lock().invalidates)
    }

    /// Entry writes so far
    pub fn write_count(&self) -> u64 {
        self.inner.state.lock().writes
    }

    /// Writes that left two leaf levels possibly cached for one page
    pub fn coherence_violations(&self) -> u64 {
        self.inner.state.lock().violations
    }

    /// Allocated big and 4K tables
    pub fn table_count(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .regions
            .values()
            .map(|r| r.big.is_some() as usize + r.small.is_some() as usize)
            .sum()
    }
}

impl PageTree for SoftPageTree {
    fn gpu(&self) -> GpuId {
        self.inner.gpu
    }

    fn big_page_size(&self) -> u64 {
        self.inner.big_page_size
    }

    fn page_sizes(&self) -> PageSizes {
        self.inner.sizes
    }

    fn get_or_alloc_ptes(&self, size: PageSize, start: VirtAddr, len: u64, evict: bool) -> Result<PteRange> {
        let base = TreeState::region_base(start.raw());
        if len == 0 || start.raw() + len > base + PAGE_SIZE_2M {
            return Err(Error::InvalidParameter);
        }
        if !self.inner.sizes.contains(size.flag()) {
            return Err(Error::NotSupported);
        }

        let present = {
            let mut state = self.inner.state.lock();
            let region = state.regions.entry(base).or_insert_with(Region::new);
            match size {
                PageSize::Size2M => {
                    region.slot_refs += 1;
                    true
                }
                _ => match region.table_mut(size) {
                    Some(table) => {
                        table.refs += 1;
                        true
                    }
                    None => false,
                },
            }
        };

        if !present {
            // Allocation may evict, which re-enters the tree
            let chunk = match self.inner.chunks.alloc_kernel(PAGE_SIZE, evict) {
                Ok(chunk) => chunk,
                Err(err) => {
                    let mut state = self.inner.state.lock();
                    if state.regions.get(&base).is_some_and(Region::is_unused) {
                        state.regions.remove(&base);
                    }
                    return Err(err);
                }
            };

            let mut spare = Vec::new();
            {
                let mut state = self.inner.state.lock();
                let entries = (PAGE_SIZE_2M / size.bytes(self.inner.big_page_size)) as usize;
                let region = state.regions.entry(base).or_insert_with(Region::new);
                let table = match size {
                    PageSize::Big => &mut region.big,
                    _ => &mut region.small,
                };
                match table {
                    Some(t) => {
                        t.refs += 1;
                        spare.push(chunk);
                    }
                    None => {
                        *table = Some(Table {
                            entries: alloc::vec![initial_entry(size); entries],
                            refs: 1,
                            backing: chunk,
                        });
                    }
                }
                if region.slot_refs == 0 && region.slot == PteValue::Invalid {
                    state.set_entry(self.inner.gpu, PageSize::Size2M, base, PteValue::NextLevel);
                }
            }
            self.inner.finish(spare);
        }

        log::trace!("{:?}: reserved {:?} PTEs at {:?}+0x{:x}", self.inner.gpu, size, start, len);
        let storage: Arc<dyn PteStorage> = self.inner.clone();
        Ok(PteRange::new(
            size,
            size.bytes(self.inner.big_page_size),
            start,
            len,
            storage,
        ))
    }

    fn write_pte(&self, range: &PteRange, index: usize, value: PteValue) {
        debug_assert!(index < range.entry_count());
        let va = range.entry_va(index);
        self.inner
            .state
            .lock()
            .set_entry(self.inner.gpu, range.size(), va.raw(), value);
    }

    fn invalidate_tlb(&self, batch: &TlbBatch) {
        if batch.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock();
        if batch.invalidates_all() {
            state.flush_all();
        } else {
            for range in batch.ranges() {
                state.flush(range.start.raw(), range.end());
            }
        }
        state.invalidates.push(TlbInvalidate {
            ranges: batch.ranges().to_vec(),
            all: batch.invalidates_all(),
            membar: batch.membar(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkSizes;
    use crate::pool::SoftChunkPool;
    use uvm_core::{Aperture, PhysAddr};

    const BIG: u64 = 64 * 1024;

    fn tree() -> (Arc<SoftChunkPool>, SoftPageTree) {
        let pool = Arc::new(SoftChunkPool::new(
            GpuId::new(0),
            PhysAddr::new(0x4000_0000),
            4,
            ChunkSizes::DEFAULT,
        ));
        let tree = SoftPageTree::new(pool.clone(), BIG, PageSizes::all());
        (pool, tree)
    }

    fn leaf(addr: u64) -> PteValue {
        PteValue::Leaf {
            target: MemAddr::new(Aperture::Vidmem(GpuId::new(0)), PhysAddr::new(addr)),
            prot: Prot::ReadWrite,
        }
    }

    #[test]
    fn test_walk_through_levels() {
        let (_pool, tree) = tree();
        let base = VirtAddr::new(PAGE_SIZE_2M);
        let small = tree.get_or_alloc_ptes(PageSize::Size4K, base, PAGE_SIZE_2M, true).unwrap();
        let big = tree.get_or_alloc_ptes(PageSize::Big, base, PAGE_SIZE_2M, true).unwrap();
        assert_eq!(tree.entry(PageSize::Size2M, base), Some(PteValue::NextLevel));

        tree.write_pte(&small, 1, leaf(0x10_0000));
        let t = tree.translate(base + PAGE_SIZE + 8).unwrap();
        assert_eq!(t.size, PageSize::Size4K);
        assert_eq!(t.target.addr, PhysAddr::new(0x10_0008));

        // A big entry of Invalid hides the 4K entry
        tree.write_pte(&big, 0, PteValue::Invalid);
        assert_eq!(tree.translate(base + PAGE_SIZE), None);
        assert_eq!(tree.coherence_violations(), 0);
    }

    #[test]
    fn test_level_change_without_invalidate_is_flagged() {
        let (_pool, tree) = tree();
        let base = VirtAddr::new(0);
        let small = tree.get_or_alloc_ptes(PageSize::Size4K, base, BIG, true).unwrap();
        let big = tree.get_or_alloc_ptes(PageSize::Big, base, BIG, true).unwrap();
        tree.write_pte(&small, 0, leaf(0x20_0000));
        tree.write_pte(&big, 0, leaf(0x30_0000));
        assert_eq!(tree.coherence_violations(), 1);
    }

    #[test]
    fn test_level_change_with_invalidate_is_clean() {
        let (_pool, tree) = tree();
        let base = VirtAddr::new(0);
        let small = tree.get_or_alloc_ptes(PageSize::Size4K, base, BIG, true).unwrap();
        let big = tree.get_or_alloc_ptes(PageSize::Big, base, BIG, true).unwrap();
        tree.write_pte(&small, 0, leaf(0x20_0000));

        tree.write_pte(&small, 0, PteValue::Invalid);
        let mut batch = TlbBatch::new();
        batch.add(base, BIG, PageSizes::SIZE_4K);
        batch.set_membar(Membar::Gpu);
        tree.invalidate_tlb(&batch);
        tree.write_pte(&big, 0, leaf(0x30_0000));

        assert_eq!(tree.coherence_violations(), 0);
        assert_eq!(tree.invalidates().len(), 1);
        assert_eq!(tree.invalidates()[0].membar, Membar::Gpu);
        assert_eq!(tree.translate(base + 0x1234).unwrap().size, PageSize::Big);
    }

    #[test]
    fn test_tables_are_refcounted_and_freed() {
        let (pool, tree) = tree();
        let base = VirtAddr::new(0);
        let range = tree.get_or_alloc_ptes(PageSize::Size4K, base, 16 * PAGE_SIZE, true).unwrap();
        assert_eq!(tree.table_count(), 1);
        assert_eq!(pool.stats().bytes_in_use, PAGE_SIZE);

        let (lower, upper) = range.split(base + 8 * PAGE_SIZE, base + 8 * PAGE_SIZE);
        let (lower, upper) = (lower.unwrap(), upper.unwrap());
        assert_eq!(upper.entry_count(), 8);
        assert_eq!(upper.index_of(base + 9 * PAGE_SIZE), Some(1));

        drop(lower);
        assert_eq!(tree.table_count(), 1);
        drop(upper);
        assert_eq!(tree.table_count(), 0);
        assert_eq!(pool.stats().bytes_in_use, 0);
        assert_eq!(tree.entry(PageSize::Size2M, base), None);
    }

    #[test]
    fn test_split_resets_gap_entries() {
        let (_pool, tree) = tree();
        let base = VirtAddr::new(0);
        let range = tree.get_or_alloc_ptes(PageSize::Big, base, 4 * BIG, true).unwrap();
        tree.write_pte(&range, 1, leaf(0x10_0000));
        let (lower, upper) = range.split(base + BIG, base + 2 * BIG);
        assert_eq!(tree.entry(PageSize::Big, base + BIG), Some(PteValue::NextLevel));
        assert_eq!(lower.unwrap().entry_count(), 1);
        assert_eq!(upper.unwrap().entry_count(), 2);
    }

    #[test]
    fn test_table_allocation_respects_evict_flag() {
        let (pool, tree) = tree();
        pool.inject_nonevicting_failures(1);
        let err = tree
            .get_or_alloc_ptes(PageSize::Size4K, VirtAddr::new(0), PAGE_SIZE, false)
            .unwrap_err();
        assert_eq!(err, Error::OutOfMemory);
        assert!(tree.get_or_alloc_ptes(PageSize::Size4K, VirtAddr::new(0), PAGE_SIZE, true).is_ok());
    }

    #[test]
    fn test_2m_reservation_controls_slot() {
        let (_pool, tree) = tree();
        let base = VirtAddr::new(PAGE_SIZE_2M);
        let slot = tree.get_or_alloc_ptes(PageSize::Size2M, base, PAGE_SIZE_2M, true).unwrap();
        let small = tree.get_or_alloc_ptes(PageSize::Size4K, base, PAGE_SIZE_2M, true).unwrap();
        // The 2M owner decides when the slot points down
        assert_eq!(tree.entry(PageSize::Size2M, base), Some(PteValue::Invalid));
        tree.write_pde(&slot);
        tree.write_pte(&small, 3, leaf(0x1000));
        assert!(tree.translate(base + 3 * PAGE_SIZE).is_some());

        drop(slot);
        assert_eq!(tree.entry(PageSize::Size2M, base), Some(PteValue::NextLevel));
        drop(small);
        assert_eq!(tree.entry(PageSize::Size2M, base), None);
    }
}
