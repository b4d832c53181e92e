//! # GPU Page-Table Adapter
//!
//! The interface a VA block uses to edit one GPU's page tables.
//!
//! Each 2M-aligned region of the address space has three levels:
//!
//! ```text
//!          2M slot  ── Leaf (2M PTE) | NextLevel (PDE) | Invalid
//!             │
//!     ┌───────┴────────┐
//!     ▼                ▼
//!  big table        4K table
//!  Leaf | Invalid   Leaf | Invalid
//!  | NextLevel ──────▶ (consult the 4K entry)
//! ```
//!
//! A big entry of `Invalid` faults without consulting the 4K table; a big
//! entry of `NextLevel` defers to the 4K entry. New big tables start out as
//! `NextLevel`, new 4K tables as `Invalid`.
//!
//! Page-table storage is reserved through [`PteRange`] handles. Tables are
//! reference counted per handle, so sibling blocks produced by a split share
//! the tables they were carved from.

use alloc::sync::Arc;
use core::fmt;

use arrayvec::ArrayVec;
use uvm_core::{GpuId, MemAddr, Prot, Result, VirtAddr, PAGE_SIZE, PAGE_SIZE_2M};

// =============================================================================
// PAGE SIZES
// =============================================================================

/// Page-table level, named by the leaf size it maps
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageSize {
    /// 4K PTEs
    Size4K,
    /// Big PTEs (64K or 128K)
    Big,
    /// The 2M slot (PTE or PDE)
    Size2M,
}

impl PageSize {
    /// Leaf size in bytes, given the GPU's big page size
    #[inline]
    pub const fn bytes(self, big_page_size: u64) -> u64 {
        match self {
            Self::Size4K => PAGE_SIZE,
            Self::Big => big_page_size,
            Self::Size2M => PAGE_SIZE_2M,
        }
    }

    /// Flag for this level
    #[inline]
    pub const fn flag(self) -> PageSizes {
        match self {
            Self::Size4K => PageSizes::SIZE_4K,
            Self::Big => PageSizes::BIG,
            Self::Size2M => PageSizes::SIZE_2M,
        }
    }
}

bitflags::bitflags! {
    /// Set of page-table levels
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageSizes: u8 {
        /// 4K level
        const SIZE_4K = 1 << 0;
        /// Big level
        const BIG = 1 << 1;
        /// 2M level
        const SIZE_2M = 1 << 2;
    }
}

// =============================================================================
// PTE VALUES
// =============================================================================

/// Value of one page-table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PteValue {
    /// Faults
    #[default]
    Invalid,
    /// Maps memory
    Leaf {
        /// Physical target of the first byte
        target: MemAddr,
        /// Protection
        prot: Prot,
    },
    /// Defers to the next level (a PDE at 2M, "use 4K" at big)
    NextLevel,
}

impl PteValue {
    /// Is this a valid leaf?
    #[inline]
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf { .. })
    }

    /// Leaf protection (`None` for non-leaves)
    #[inline]
    pub const fn prot(&self) -> Prot {
        match self {
            Self::Leaf { prot, .. } => *prot,
            _ => Prot::None,
        }
    }

    /// Leaf target
    #[inline]
    pub const fn target(&self) -> Option<MemAddr> {
        match self {
            Self::Leaf { target, .. } => Some(*target),
            _ => None,
        }
    }
}

// =============================================================================
// MEMBAR AND TLB BATCHES
// =============================================================================

/// Memory barrier accompanying a TLB invalidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Membar {
    /// No barrier
    #[default]
    None,
    /// GPU-local barrier
    Gpu,
    /// System-wide barrier
    Sys,
}

/// One range of a TLB invalidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbRange {
    /// Start address
    pub start: VirtAddr,
    /// Length in bytes
    pub len: u64,
    /// Levels whose cached entries must go
    pub levels: PageSizes,
}

impl TlbRange {
    /// Exclusive end
    #[inline]
    pub fn end(&self) -> u64 {
        self.start.raw() + self.len
    }

    /// Does this range cover `other`?
    #[inline]
    pub fn covers(&self, other: &TlbRange) -> bool {
        self.start.raw() <= other.start.raw() && other.end() <= self.end()
    }
}

/// Ranges tracked before a batch degrades to a full invalidate
pub const TLB_BATCH_RANGES: usize = 8;

/// Accumulated TLB invalidates, issued at once
#[derive(Debug, Clone, Default)]
pub struct TlbBatch {
    ranges: ArrayVec<TlbRange, TLB_BATCH_RANGES>,
    membar: Membar,
    invalidate_all: bool,
}

impl TlbBatch {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a range; ranges covered by one already batched are folded in
    pub fn add(&mut self, start: VirtAddr, len: u64, levels: PageSizes) {
        if self.invalidate_all || len == 0 {
            return;
        }
        let range = TlbRange { start, len, levels };
        if let Some(existing) = self.ranges.iter_mut().find(|r| r.covers(&range)) {
            existing.levels |= levels;
            return;
        }
        let mut merged_levels = levels;
        self.ranges.retain(|r| {
            let covered = range.covers(r);
            if covered {
                merged_levels |= r.levels;
            }
            !covered
        });
        let range = TlbRange {
            levels: merged_levels,
            ..range
        };
        if self.ranges.try_push(range).is_err() {
            self.invalidate_all = true;
            self.ranges.clear();
        }
    }

    /// Raise the barrier to at least `membar`
    #[inline]
    pub fn set_membar(&mut self, membar: Membar) {
        self.membar = self.membar.max(membar);
    }

    /// Batched ranges
    #[inline]
    pub fn ranges(&self) -> &[TlbRange] {
        &self.ranges
    }

    /// Barrier
    #[inline]
    pub fn membar(&self) -> Membar {
        self.membar
    }

    /// Has the batch overflowed into a full invalidate?
    #[inline]
    pub fn invalidates_all(&self) -> bool {
        self.invalidate_all
    }

    /// Is there nothing to invalidate?
    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.invalidate_all && self.ranges.is_empty()
    }
}

// =============================================================================
// PTE RANGES
// =============================================================================

/// Owner of page-table storage, notified as handles come and go
pub trait PteStorage: Send + Sync {
    /// Another handle now references the table holding `start`
    fn retain(&self, size: PageSize, start: VirtAddr);

    /// A handle covering `[start, start + len)` went away; entries fully
    /// inside the span return to their initial value
    fn release(&self, size: PageSize, start: VirtAddr, len: u64);

    /// Return entries fully inside the span to their initial value
    fn reset(&self, size: PageSize, start: VirtAddr, len: u64);
}

/// Reservation of the entries of one level covering a VA span
pub struct PteRange {
    size: PageSize,
    entry_size: u64,
    start: VirtAddr,
    len: u64,
    storage: Arc<dyn PteStorage>,
}

impl PteRange {
    /// Create a handle; used by page-tree implementations
    pub fn new(
        size: PageSize,
        entry_size: u64,
        start: VirtAddr,
        len: u64,
        storage: Arc<dyn PteStorage>,
    ) -> Self {
        Self {
            size,
            entry_size,
            start,
            len,
            storage,
        }
    }

    /// Level
    #[inline]
    pub fn size(&self) -> PageSize {
        self.size
    }

    /// Bytes mapped by one entry
    #[inline]
    pub fn entry_size(&self) -> u64 {
        self.entry_size
    }

    /// First covered address
    #[inline]
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// Covered length
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Does the handle cover nothing?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Exclusive end
    #[inline]
    pub fn end(&self) -> VirtAddr {
        self.start + self.len
    }

    fn first_entry(&self) -> u64 {
        self.start.raw() & !(self.entry_size - 1)
    }

    /// Number of entries touched by the span
    pub fn entry_count(&self) -> usize {
        if self.len == 0 {
            return 0;
        }
        let last = (self.end().raw() - 1) & !(self.entry_size - 1);
        ((last - self.first_entry()) / self.entry_size) as usize + 1
    }

    /// Address mapped by entry `index`
    #[inline]
    pub fn entry_va(&self, index: usize) -> VirtAddr {
        VirtAddr::new(self.first_entry() + index as u64 * self.entry_size)
    }

    /// Entry index mapping `va`
    #[inline]
    pub fn index_of(&self, va: VirtAddr) -> Option<usize> {
        (va >= self.start && va < self.end())
            .then(|| ((va.raw() & !(self.entry_size - 1)) - self.first_entry()) as usize / self.entry_size as usize)
    }

    fn sub(&self, start: VirtAddr, end: VirtAddr) -> PteRange {
        self.storage.retain(self.size, start);
        PteRange {
            size: self.size,
            entry_size: self.entry_size,
            start,
            len: end - start,
            storage: self.storage.clone(),
        }
    }

    /// Split into `[start, lower_end)` and `[upper_start, end)`
    ///
    /// Entries in the gap between the halves are reset. Both halves keep
    /// referencing the same table.
    pub fn split(mut self, lower_end: VirtAddr, upper_start: VirtAddr) -> (Option<PteRange>, Option<PteRange>) {
        debug_assert!(lower_end <= upper_start);
        let end = self.end();
        let lower_end = lower_end.min(end).max(self.start);
        let upper_start = upper_start.max(self.start).min(end);

        let lower = (lower_end > self.start).then(|| self.sub(self.start, lower_end));
        let upper = (upper_start < end).then(|| self.sub(upper_start, end));
        if upper_start > lower_end {
            self.storage.reset(self.size, lower_end, upper_start - lower_end);
        }
        // Drop now only gives up this handle's reference
        self.len = 0;
        (lower, upper)
    }
}

impl Drop for PteRange {
    fn drop(&mut self) {
        self.storage.release(self.size, self.start, self.len);
    }
}

impl fmt::Debug for PteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PteRange")
            .field("size", &self.size)
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}

// =============================================================================
// PAGE TREE
// =============================================================================

/// Page-table adapter for one GPU
pub trait PageTree: Send + Sync {
    /// GPU whose tables these are
    fn gpu(&self) -> GpuId;

    /// Big page size in bytes
    fn big_page_size(&self) -> u64;

    /// Levels usable for leaves
    fn page_sizes(&self) -> PageSizes;

    /// Reserve the entries of `size` covering `[start, start + len)`,
    /// allocating tables as needed
    ///
    /// With `evict == false` a table allocation never evicts and fails with
    /// `OutOfMemory` instead.
    fn get_or_alloc_ptes(&self, size: PageSize, start: VirtAddr, len: u64, evict: bool) -> Result<PteRange>;

    /// Write entry `index` of a reserved range
    fn write_pte(&self, range: &PteRange, index: usize, value: PteValue);

    /// Point the 2M slot at the lower-level tables
    fn write_pde(&self, range: &PteRange) {
        debug_assert_eq!(range.size(), PageSize::Size2M);
        self.write_pte(range, 0, PteValue::NextLevel);
    }

    /// Invalidate cached translations, then apply the barrier
    fn invalidate_tlb(&self, batch: &TlbBatch);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tlb_batch_folds_covered_ranges() {
        let mut batch = TlbBatch::new();
        batch.add(VirtAddr::new(0x1000), 0x1000, PageSizes::SIZE_4K);
        batch.add(VirtAddr::new(0x3000), 0x1000, PageSizes::SIZE_4K);
        assert_eq!(batch.ranges().len(), 2);

        batch.add(VirtAddr::new(0), PAGE_SIZE_2M, PageSizes::SIZE_2M);
        assert_eq!(batch.ranges().len(), 1);
        assert_eq!(batch.ranges()[0].levels, PageSizes::SIZE_2M | PageSizes::SIZE_4K);

        batch.add(VirtAddr::new(0x10000), 0x10000, PageSizes::BIG);
        assert_eq!(batch.ranges().len(), 1);
        assert!(batch.ranges()[0].levels.contains(PageSizes::BIG));
    }

    #[test]
    fn test_tlb_batch_overflow_and_membar() {
        let mut batch = TlbBatch::new();
        for i in 0..=TLB_BATCH_RANGES as u64 {
            batch.add(VirtAddr::new(i * 0x10000), PAGE_SIZE, PageSizes::SIZE_4K);
        }
        assert!(batch.invalidates_all());
        batch.set_membar(Membar::Sys);
        batch.set_membar(Membar::Gpu);
        assert_eq!(batch.membar(), Membar::Sys);
    }

    #[test]
    fn test_pte_value_accessors() {
        assert!(!PteValue::NextLevel.is_leaf());
        assert_eq!(PteValue::Invalid.prot(), Prot::None);
        let target = MemAddr::new(uvm_core::Aperture::Sysmem, uvm_core::PhysAddr::new(0x2000));
        let leaf = PteValue::Leaf {
            target,
            prot: Prot::ReadWrite,
        };
        assert_eq!(leaf.target(), Some(target));
        assert_eq!(leaf.prot(), Prot::ReadWrite);
    }
}
