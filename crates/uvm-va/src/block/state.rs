//! Per-block residency and mapping state.
//!
//! Everything here is protected by the block lock. The top-level processor
//! masks are derived from the per-processor page masks and re-derived by
//! [`BlockState::update_masks`] after every change.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use uvm_cmd::Tracker;
use uvm_core::{
    GpuId, MemAddr, PageIndex, PageMask, PageRegion, ProcessorId, ProcessorMask, Prot, PteBit, Topology, VirtAddr,
    PAGE_SIZE, PAGE_SIZE_2M,
};
use uvm_mem::{ChunkLayout, CpuPage, GpuChunk, PageSize, PteRange, PteValue};

use crate::context::VaContext;
use crate::gpu::VaGpu;
use crate::perf::{BlockPerf, PerfCtx};
use crate::range::VaRange;

// =============================================================================
// PER-PROCESSOR PAGES
// =============================================================================

/// Residency and protection masks of one processor
#[derive(Debug, Clone, Default)]
pub(crate) struct ProcPages {
    /// Pages with a valid copy on this processor
    pub resident: PageMask,
    /// Pages mapped with each permission bit; ATOMIC ⊆ WRITE ⊆ READ
    pub pte_bits: [PageMask; PteBit::COUNT],
}

impl ProcPages {
    #[inline]
    pub fn mapped(&self) -> &PageMask {
        &self.pte_bits[PteBit::Read.index()]
    }

    pub fn prot(&self, page: PageIndex) -> Prot {
        PteBit::ALL
            .iter()
            .rev()
            .find(|bit| self.pte_bits[bit.index()].test(page))
            .map_or(Prot::None, |bit| Prot::from_highest_bit(*bit))
    }

    pub fn set_prot(&mut self, page: PageIndex, prot: Prot) {
        for bit in PteBit::ALL {
            self.pte_bits[bit.index()].assign(page, prot.has(bit));
        }
    }

    /// Clear `bit` and every stronger bit on `pages`; returns the pages that lost it
    pub fn revoke(&mut self, pages: &PageMask, bit: PteBit) -> PageMask {
        let lost = self.pte_bits[bit.index()] & *pages;
        for stronger in PteBit::ALL.iter().filter(|b| b.index() >= bit.index()) {
            self.pte_bits[stronger.index()].andnot_assign(pages);
        }
        lost
    }

    pub fn unmap(&mut self, pages: &PageMask) -> PageMask {
        self.revoke(pages, PteBit::Read)
    }

    /// Keep pages below `boundary`, return the rest shifted down
    pub fn split_off(&mut self, boundary: PageIndex, pages: usize) -> ProcPages {
        let upper = ProcPages {
            resident: self.resident.shifted_down(boundary),
            pte_bits: self.pte_bits.map(|m| m.shifted_down(boundary)),
        };
        let cut = PageRegion::new(boundary, pages);
        self.resident.region_clear(cut);
        for mask in self.pte_bits.iter_mut() {
            mask.region_clear(cut);
        }
        upper
    }
}

// =============================================================================
// CPU STATE
// =============================================================================

#[derive(Debug)]
pub(crate) struct CpuState {
    /// Backing page of each block page
    pub pages: Vec<Option<CpuPage>>,
    pub procs: ProcPages,
    /// What the CPU page tables currently hold
    pub shadow: Vec<Option<(MemAddr, Prot)>>,
}

impl CpuState {
    fn new(pages: usize) -> Self {
        Self {
            pages: (0..pages).map(|_| None).collect(),
            procs: ProcPages::default(),
            shadow: alloc::vec![None; pages],
        }
    }
}

// =============================================================================
// GPU STATE
// =============================================================================

/// Big-page regions fully inside a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BigRegions {
    /// Address of the first region
    pub va: VirtAddr,
    /// Block page of the first region
    pub first_page: PageIndex,
    /// Pages per region
    pub pages_per: usize,
    /// Number of regions
    pub count: usize,
}

impl BigRegions {
    pub fn new(start: VirtAddr, end: VirtAddr, big_page_size: u64) -> Self {
        let va = start.align_up(big_page_size);
        let count = if va.raw() > end.raw() {
            0
        } else {
            ((end.raw() - va.raw() + 1) / big_page_size) as usize
        };
        Self {
            va,
            first_page: ((va.raw().saturating_sub(start.raw())) / PAGE_SIZE) as usize,
            pages_per: (big_page_size / PAGE_SIZE) as usize,
            count,
        }
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        (self.pages_per as u64) * PAGE_SIZE
    }

    #[inline]
    pub fn region(&self, index: usize) -> PageRegion {
        let first = self.first_page + index * self.pages_per;
        PageRegion::new(first, first + self.pages_per)
    }

    #[inline]
    pub fn region_va(&self, index: usize) -> VirtAddr {
        self.va + index as u64 * self.bytes()
    }

    pub fn index_of(&self, page: PageIndex) -> Option<usize> {
        if page < self.first_page {
            return None;
        }
        let index = (page - self.first_page) / self.pages_per;
        (index < self.count).then_some(index)
    }
}

/// Page-table storage and shadow entries of one GPU
#[derive(Debug)]
pub(crate) struct GpuPtes {
    pub range_2m: Option<PteRange>,
    pub range_big: Option<PteRange>,
    pub range_4k: Option<PteRange>,
    /// 2M slot, meaningful while `range_2m` is held
    pub slot: PteValue,
    /// One entry per full big region
    pub big: Vec<PteValue>,
    /// One entry per page
    pub small: Vec<PteValue>,
}

impl GpuPtes {
    pub fn new(pages: usize, big_regions: usize) -> Self {
        Self {
            range_2m: None,
            range_big: None,
            range_4k: None,
            slot: PteValue::Invalid,
            big: alloc::vec![PteValue::NextLevel; big_regions],
            small: alloc::vec![PteValue::Invalid; pages],
        }
    }

    /// Is the block mapped by one 2M leaf?
    #[inline]
    pub fn is_2m(&self) -> bool {
        self.range_2m.is_some() && self.slot.is_leaf()
    }

    /// Translation the shadow entries give for `page`
    pub fn effective(&self, page: PageIndex, big: &BigRegions) -> Option<(MemAddr, Prot, PageSize)> {
        if self.range_2m.is_some() {
            match self.slot {
                PteValue::Leaf { target, prot } => {
                    return Some((target.offset(page as u64 * PAGE_SIZE), prot, PageSize::Size2M));
                }
                PteValue::Invalid => return None,
                PteValue::NextLevel => {}
            }
        }
        if let Some(index) = big.index_of(page) {
            match self.big[index] {
                PteValue::Leaf { target, prot } => {
                    let offset = (page - big.region(index).first) as u64 * PAGE_SIZE;
                    return Some((target.offset(offset), prot, PageSize::Big));
                }
                PteValue::Invalid => return None,
                PteValue::NextLevel => {}
            }
        }
        match self.small[page] {
            PteValue::Leaf { target, prot } => Some((target, prot, PageSize::Size4K)),
            _ => None,
        }
    }

    /// Forget every range; the shadows go back to fresh tables
    pub fn release_all(&mut self) {
        self.range_2m = None;
        self.slot = PteValue::Invalid;
        self.release_lower();
    }

    pub fn release_lower(&mut self) {
        self.range_big = None;
        self.range_4k = None;
        self.big.fill(PteValue::NextLevel);
        self.small.fill(PteValue::Invalid);
    }
}

#[derive(Debug)]
pub(crate) struct GpuState {
    pub layout: ChunkLayout,
    /// Chunk of each layout entry
    pub chunks: Vec<Option<GpuChunk>>,
    pub procs: ProcPages,
    /// Pages of this GPU's memory stored in the swizzled layout
    pub swizzled: PageMask,
    pub big: BigRegions,
    pub ptes: GpuPtes,
}

impl GpuState {
    fn new(start: VirtAddr, end: VirtAddr, gpu: &VaGpu) -> Self {
        let layout = ChunkLayout::new(start, end, gpu.chunk_sizes());
        let big = BigRegions::new(start, end, gpu.caps().big_page_size);
        let pages = ((end.raw() - start.raw() + 1) / PAGE_SIZE) as usize;
        Self {
            chunks: (0..layout.len()).map(|_| None).collect(),
            layout,
            procs: ProcPages::default(),
            swizzled: PageMask::new(),
            big,
            ptes: GpuPtes::new(pages, big.count),
        }
    }

    /// Memory backing `page`, if its chunk is allocated
    pub fn chunk_addr(&self, page: PageIndex) -> Option<MemAddr> {
        let index = self.layout.chunk_index(page)?;
        let entry = self.layout.entries()[index];
        let chunk = self.chunks[index].as_ref()?;
        Some(chunk.mem_addr((page - entry.region.first) as u64 * PAGE_SIZE))
    }
}

// =============================================================================
// BLOCK STATE
// =============================================================================

/// State of a VA block, guarded by the block lock
#[derive(Debug)]
pub(crate) struct BlockState {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub range: Arc<VaRange>,
    pub cpu: CpuState,
    /// Indexed by GPU id
    pub gpus: Vec<Option<Box<GpuState>>>,
    pub resident: ProcessorMask,
    pub mapped: ProcessorMask,
    pub read_duplicated: PageMask,
    pub tracker: Tracker,
    pub perf: BlockPerf,
}

impl BlockState {
    pub fn new(start: VirtAddr, end: VirtAddr, range: Arc<VaRange>) -> Self {
        debug_assert!(start <= end && end.raw() - start.raw() < PAGE_SIZE_2M);
        debug_assert_eq!(start.align_down(PAGE_SIZE_2M), end.align_down(PAGE_SIZE_2M));
        let pages = ((end.raw() - start.raw() + 1) / PAGE_SIZE) as usize;
        Self {
            start,
            end,
            range,
            cpu: CpuState::new(pages),
            gpus: Vec::new(),
            resident: ProcessorMask::empty(),
            mapped: ProcessorMask::empty(),
            read_duplicated: PageMask::new(),
            tracker: Tracker::new(),
            perf: BlockPerf::default(),
        }
    }

    #[inline]
    pub fn pages(&self) -> usize {
        ((self.end.raw() - self.start.raw() + 1) / PAGE_SIZE) as usize
    }

    #[inline]
    pub fn region(&self) -> PageRegion {
        PageRegion::with_pages(self.pages())
    }

    #[inline]
    pub fn page_addr(&self, page: PageIndex) -> VirtAddr {
        self.start + page as u64 * PAGE_SIZE
    }

    /// Block covers one whole 2M-aligned region
    #[inline]
    pub fn is_full_2m(&self) -> bool {
        self.start.is_aligned(PAGE_SIZE_2M) && self.end.raw() - self.start.raw() + 1 == PAGE_SIZE_2M
    }

    pub fn perf_ctx<'a>(&self, ctx: &'a VaContext) -> PerfCtx<'a> {
        PerfCtx {
            block_start: self.start,
            pages: self.pages(),
            now_ns: ctx.now_ns(),
            topology: ctx.topology(),
            events: &**ctx.events(),
        }
    }

    // -------------------------------------------------------------------------
    // Sub-state access
    // -------------------------------------------------------------------------

    pub fn gpu(&self, gpu: GpuId) -> Option<&GpuState> {
        self.gpus.get(gpu.index()).and_then(|g| g.as_deref())
    }

    pub fn gpu_mut(&mut self, gpu: GpuId) -> Option<&mut GpuState> {
        self.gpus.get_mut(gpu.index()).and_then(|g| g.as_deref_mut())
    }

    /// GPU sub-state, created on first use
    pub fn gpu_or_init(&mut self, gpu: &VaGpu) -> &mut GpuState {
        let index = gpu.id().index();
        if self.gpus.len() <= index {
            self.gpus.resize_with(index + 1, || None);
        }
        let (start, end) = (self.start, self.end);
        self.gpus[index].get_or_insert_with(|| Box::new(GpuState::new(start, end, gpu)))
    }

    /// GPU sub-states with their ids
    pub fn gpu_states(&self) -> impl Iterator<Item = (GpuId, &GpuState)> + '_ {
        self.gpus
            .iter()
            .enumerate()
            .filter_map(|(i, g)| g.as_deref().map(|g| (GpuId::new(i as u8), g)))
    }

    pub fn procs(&self, processor: ProcessorId) -> Option<&ProcPages> {
        match processor.gpu() {
            None => Some(&self.cpu.procs),
            Some(gpu) => self.gpu(gpu).map(|g| &g.procs),
        }
    }

    pub fn procs_mut(&mut self, processor: ProcessorId) -> Option<&mut ProcPages> {
        match processor.gpu() {
            None => Some(&mut self.cpu.procs),
            Some(gpu) => self.gpu_mut(gpu).map(|g| &mut g.procs),
        }
    }

    /// Processors with per-page state
    pub fn processors(&self) -> ProcessorMask {
        self.gpu_states()
            .fold(ProcessorMask::single(ProcessorId::CPU), |mask, (id, _)| {
                mask.with(ProcessorId::from_gpu(id))
            })
    }

    // -------------------------------------------------------------------------
    // Residency queries
    // -------------------------------------------------------------------------

    pub fn resident_mask(&self, processor: ProcessorId) -> PageMask {
        self.procs(processor).map_or(PageMask::new(), |p| p.resident)
    }

    pub fn resident_processors(&self, page: PageIndex) -> ProcessorMask {
        let mut mask = ProcessorMask::empty();
        if self.cpu.procs.resident.test(page) {
            mask.set(ProcessorId::CPU);
        }
        for (id, gpu) in self.gpu_states() {
            if gpu.procs.resident.test(page) {
                mask.set(ProcessorId::from_gpu(id));
            }
        }
        mask
    }

    /// Pages resident on at least one processor
    pub fn resident_anywhere(&self) -> PageMask {
        self.gpu_states()
            .fold(self.cpu.procs.resident, |mask, (_, g)| mask | g.procs.resident)
    }

    pub fn prot(&self, processor: ProcessorId, page: PageIndex) -> Prot {
        self.procs(processor).map_or(Prot::None, |p| p.prot(page))
    }

    /// Closest resident processor of `page` as seen from `requester`
    pub fn closest_resident(
        &self,
        topology: &Topology,
        page: PageIndex,
        requester: ProcessorId,
        restrict: Option<ProcessorMask>,
    ) -> Option<ProcessorId> {
        let residents = self.resident_processors(page);
        topology.closest_in(requester, restrict.map_or(residents, |r| residents.and(r)))
    }

    /// Processor whose copy `processor` maps for `page`
    pub fn mapping_target(&self, topology: &Topology, processor: ProcessorId, page: PageIndex) -> Option<ProcessorId> {
        let policy = self.range.policy();
        if policy.is_uvm_lite(processor) {
            let preferred = policy.preferred_location?;
            let residents = self.resident_processors(page);
            return (residents.test(preferred) && topology.can_access(processor, preferred)).then_some(preferred);
        }
        self.closest_resident(topology, page, processor, None)
    }

    /// Memory holding `owner`'s copy of `page`
    pub fn mem_addr(&self, owner: ProcessorId, page: PageIndex) -> Option<MemAddr> {
        match owner.gpu() {
            None => self.cpu.pages.get(page)?.as_ref().map(|p| p.mem_addr(0)),
            Some(gpu) => self.gpu(gpu)?.chunk_addr(page),
        }
    }

    /// Is `owner`'s copy of `page` in the swizzled layout?
    pub fn is_swizzled(&self, owner: ProcessorId, page: PageIndex) -> bool {
        owner
            .gpu()
            .and_then(|g| self.gpu(g))
            .is_some_and(|g| g.swizzled.test(page))
    }

    // -------------------------------------------------------------------------
    // Derived masks
    // -------------------------------------------------------------------------

    /// Re-derive the processor masks and the eviction hints
    pub fn update_masks(&mut self, ctx: &VaContext) {
        let full_2m = self.is_full_2m();
        let mut resident = ProcessorMask::empty();
        let mut mapped = ProcessorMask::empty();
        if !self.cpu.procs.resident.is_empty() {
            resident.set(ProcessorId::CPU);
        }
        if !self.cpu.procs.mapped().is_empty() {
            mapped.set(ProcessorId::CPU);
        }
        for (index, slot) in self.gpus.iter().enumerate() {
            let Some(gpu_state) = slot.as_deref() else {
                continue;
            };
            let id = GpuId::new(index as u8);
            let processor = ProcessorId::from_gpu(id);
            let is_resident = !gpu_state.procs.resident.is_empty();
            resident.assign(processor, is_resident);
            mapped.assign(processor, !gpu_state.procs.mapped().is_empty());

            // Root chunks backing a whole block are eviction candidates only
            // while nothing is resident in them
            if full_2m && is_resident != self.resident.test(processor) {
                if let (Some(gpu), [Some(chunk)]) = (ctx.gpu_any(id), gpu_state.chunks.as_slice()) {
                    if chunk.size() == PAGE_SIZE_2M {
                        if is_resident {
                            gpu.chunks().mark_used(chunk);
                        } else {
                            gpu.chunks().mark_unused(chunk);
                        }
                    }
                }
            }
        }
        self.resident = resident;
        self.mapped = mapped;
    }

    /// Recompute the read-duplicated bits of `pages`
    pub fn update_read_duplicated(&mut self, pages: &PageMask) {
        for page in pages.iter() {
            let duplicated = self.resident_processors(page).weight() >= 2;
            self.read_duplicated.assign(page, duplicated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proc_pages_prot_round_trip() {
        let mut procs = ProcPages::default();
        for (page, prot) in Prot::VALID.iter().enumerate() {
            procs.set_prot(page, *prot);
        }
        assert_eq!(procs.prot(0), Prot::ReadOnly);
        assert_eq!(procs.prot(2), Prot::ReadWriteAtomic);
        assert_eq!(procs.prot(3), Prot::None);

        let lost = procs.revoke(&PageMask::from_region(PageRegion::new(0, 3)), PteBit::Write);
        assert_eq!(lost.weight(), 2);
        assert_eq!(procs.prot(1), Prot::ReadOnly);
        assert_eq!(procs.prot(2), Prot::ReadOnly);
    }

    #[test]
    fn test_proc_pages_split_off() {
        let mut procs = ProcPages::default();
        procs.resident.region_fill(PageRegion::new(10, 20));
        procs.set_prot(15, Prot::ReadWrite);
        let upper = procs.split_off(12, 512);
        assert_eq!(procs.resident.weight(), 2);
        assert_eq!(upper.resident.weight(), 8);
        assert_eq!(upper.prot(3), Prot::ReadWrite);
        assert_eq!(procs.prot(15), Prot::None);
    }

    #[test]
    fn test_big_regions_of_unaligned_block() {
        let k64 = 64 * 1024;
        let start = VirtAddr::new(PAGE_SIZE_2M + 3 * PAGE_SIZE);
        let end = VirtAddr::new(PAGE_SIZE_2M + 3 * k64 + PAGE_SIZE - 1);
        let big = BigRegions::new(start, end, k64);
        assert_eq!(big.count, 2);
        assert_eq!(big.first_page, 13);
        assert_eq!(big.region(1), PageRegion::new(29, 45));
        assert_eq!(big.index_of(12), None);
        assert_eq!(big.index_of(44), Some(1));
        assert_eq!(big.index_of(45), None);
        assert_eq!(big.region_va(1), VirtAddr::new(PAGE_SIZE_2M + 2 * k64));
    }
}
