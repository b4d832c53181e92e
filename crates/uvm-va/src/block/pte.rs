//! # Mapping Synchronization
//!
//! Brings the page tables of every processor in line with the block's
//! logical state (residency plus the per-processor permission bits).
//!
//! GPU page tables are rewritten in one pass over all GPUs:
//!
//! ```text
//!   shape      pick 2M / big / 4K leaves from the desired mappings
//!     │
//!   phase A    reserve PTE storage (no eviction; may ask for a retry)
//!     │
//!   phase B    write stale leaves: in place when the level and the memory
//!     │        layout stay the same, invalid otherwise
//!   phase C    one TLB invalidate per GPU
//!     │
//!   swizzle    convert big pages whose layout changes
//!     │
//!   phase D    write new leaves bottom-up, then the 2M slot
//! ```
//!
//! A leaf is never replaced by a leaf of another level without an
//! invalidate in between, so no TLB can hold translations of two levels for
//! the same address.

use alloc::sync::Arc;
use alloc::vec::Vec;

use uvm_cmd::{ChannelType, CopyAddr};
use uvm_core::{
    Aperture, Error, MappingConfig, MemAddr, PageMask, PageRegion, ProcessorId, Prot, PteBit, Result, ToolsEvent,
    Topology, VirtAddr, PAGE_SIZE, PAGE_SIZE_2M,
};
use uvm_mem::{Membar, PageSize, PageSizes, PteRange, PteValue, TlbBatch};

use super::retry::{RetryNeed, VaBlockRetry};
use super::state::{BlockState, GpuPtes};
use crate::context::VaContext;
use crate::gpu::VaGpu;

// =============================================================================
// SHAPES
// =============================================================================

/// Mapping a processor should have for one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DesiredMapping {
    /// Processor whose copy is mapped
    pub owner: ProcessorId,
    /// Memory of that copy
    pub target: MemAddr,
    pub prot: Prot,
}

/// Restrictions on the leaf sizes a sync may pick
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ShapeLimits {
    /// No 2M leaves
    pub no_2m: bool,
    /// Pages that must be mapped with 4K leaves
    pub force_4k: PageMask,
}

/// Page-table layout of one GPU for the whole block
#[derive(Debug)]
struct Shape {
    mapped: bool,
    is_2m: bool,
    slot: PteValue,
    big: Vec<PteValue>,
    small: Vec<PteValue>,
    /// Own memory to keep in the swizzled layout
    swizzled: PageMask,
}

/// One leaf covering `region`, if every page maps the same way with
/// contiguous memory starting at an `align`-aligned address
fn uniform_leaf(maps: &[Option<DesiredMapping>], region: PageRegion, align: u64) -> Option<PteValue> {
    let first = maps[region.first]?;
    if !first.target.addr.is_aligned(align) {
        return None;
    }
    for (i, page) in region.iter().enumerate() {
        let map = maps[page]?;
        if map.prot != first.prot || map.owner != first.owner || map.target != first.target.offset(i as u64 * PAGE_SIZE) {
            return None;
        }
    }
    Some(PteValue::Leaf {
        target: first.target,
        prot: first.prot,
    })
}

impl Shape {
    fn compute(
        block: &BlockState,
        gpu: &VaGpu,
        config: &MappingConfig,
        maps: &[Option<DesiredMapping>],
        foreign: &PageMask,
        limits: &ShapeLimits,
    ) -> Option<Self> {
        let state = block.gpu(gpu.id())?;
        let pages = maps.len();
        let big = state.big;
        let mut shape = Self {
            mapped: maps.iter().any(Option::is_some),
            is_2m: false,
            slot: PteValue::NextLevel,
            big: alloc::vec![PteValue::NextLevel; big.count],
            small: alloc::vec![PteValue::Invalid; pages],
            swizzled: PageMask::new(),
        };
        if !shape.mapped {
            return Some(shape);
        }

        if block.is_full_2m() && gpu.uses_2m_ptes(config) && !limits.no_2m {
            if let Some(leaf) = uniform_leaf(maps, PageRegion::with_pages(pages), PAGE_SIZE_2M) {
                shape.is_2m = true;
                shape.slot = leaf;
                return Some(shape);
            }
        }

        let own = Aperture::Vidmem(gpu.id());
        let swizzles = gpu.swizzles(config);
        let mut covered = PageMask::new();
        if gpu.uses_big_ptes(config) {
            for index in 0..big.count {
                let region = big.region(index);
                if !limits.force_4k.region_empty(region) {
                    continue;
                }
                let Some(leaf) = uniform_leaf(maps, region, big.bytes()) else {
                    continue;
                };
                if swizzles && leaf.target().is_some_and(|t| t.aperture == own) {
                    // Swizzled memory is only readable through this GPU's
                    // big leaves
                    if !foreign.region_empty(region) {
                        continue;
                    }
                    shape.swizzled.region_fill(region);
                }
                shape.big[index] = leaf;
                covered.region_fill(region);
            }
        }

        for (page, map) in maps.iter().enumerate() {
            if let (false, Some(map)) = (covered.test(page), map) {
                shape.small[page] = PteValue::Leaf {
                    target: map.target,
                    prot: map.prot,
                };
            }
        }
        Some(shape)
    }
}

/// Barrier needed before `old` can be considered gone
fn membar_for(old: PteValue, new: PteValue, own: Aperture) -> Membar {
    match (old, new) {
        (PteValue::Leaf { target: a, prot: pa }, PteValue::Leaf { target: b, prot: pb }) if a == b && pb >= pa => {
            Membar::None
        }
        (PteValue::Leaf { target, .. }, _) if target.aperture == own => Membar::Gpu,
        (PteValue::Leaf { .. }, _) => Membar::Sys,
        _ => Membar::None,
    }
}

/// Barrier needed before all valid lower leaves can be considered gone
fn lower_membar(ptes: &GpuPtes, own: Aperture) -> Membar {
    ptes.big
        .iter()
        .chain(ptes.small.iter())
        .map(|old| membar_for(*old, PteValue::Invalid, own))
        .max()
        .unwrap_or(Membar::None)
}

fn lower_valid(ptes: &GpuPtes) -> bool {
    ptes.big.iter().chain(ptes.small.iter()).any(PteValue::is_leaf)
}

/// Entry of `range` mapping `va`
fn entry_index(range: Option<&PteRange>, va: VirtAddr) -> Option<(&PteRange, usize)> {
    let range = range?;
    let index = range.index_of(va);
    debug_assert!(index.is_some(), "{:?} outside {:?}", va, range);
    Some((range, index?))
}

struct GpuPlan {
    gpu: Arc<VaGpu>,
    shape: Shape,
    batch: TlbBatch,
    /// Targets mapped before the sync, for tools
    old: Vec<Option<MemAddr>>,
}

// =============================================================================
// SYNC
// =============================================================================

impl BlockState {
    /// Drop permissions the current residency can no longer back
    pub(crate) fn reconcile_mappings(&mut self, topology: &Topology) {
        for processor in self.processors().iter() {
            let Some(mapped) = self.procs(processor).map(|p| *p.mapped()) else {
                continue;
            };
            let mut unmap = PageMask::new();
            let mut read_only = PageMask::new();
            let mut no_atomic = PageMask::new();
            for page in mapped.iter() {
                let Some(owner) = self.mapping_target(topology, processor, page) else {
                    unmap.set(page);
                    continue;
                };
                if self.resident_processors(page).weight() > 1 {
                    read_only.set(page);
                } else if !topology.native_atomics(processor, owner) {
                    no_atomic.set(page);
                }
            }
            if let Some(procs) = self.procs_mut(processor) {
                procs.unmap(&unmap);
                procs.revoke(&read_only, PteBit::Write);
                procs.revoke(&no_atomic, PteBit::Atomic);
            }
        }
    }

    pub(super) fn desired_mappings(&self, topology: &Topology, processor: ProcessorId) -> Vec<Option<DesiredMapping>> {
        let mut maps = alloc::vec![None; self.pages()];
        let Some(procs) = self.procs(processor) else {
            return maps;
        };
        for page in procs.mapped().iter() {
            let Some(owner) = self.mapping_target(topology, processor, page) else {
                continue;
            };
            let Some(target) = self.mem_addr(owner, page) else {
                debug_assert!(false, "page {} resident on {:?} without backing", page, owner);
                continue;
            };
            maps[page] = Some(DesiredMapping {
                owner,
                target,
                prot: procs.prot(page),
            });
        }
        maps
    }

    /// Pages of each GPU's memory mapped by some other processor
    fn foreign_mappings(&self, desired: &[(ProcessorId, Vec<Option<DesiredMapping>>)]) -> Vec<PageMask> {
        let mut foreign = alloc::vec![PageMask::new(); self.gpus.len()];
        for (processor, maps) in desired {
            for (page, map) in maps.iter().enumerate() {
                let Some(map) = map.filter(|m| m.owner != *processor) else {
                    continue;
                };
                if let Some(mask) = map.owner.gpu().and_then(|g| foreign.get_mut(g.index())) {
                    mask.set(page);
                }
            }
        }
        foreign
    }

    /// Make every page table match the logical state
    pub(crate) fn sync_mappings(
        &mut self,
        ctx: &VaContext,
        retry: &mut VaBlockRetry,
        limits: &ShapeLimits,
    ) -> Result<()> {
        let topology = ctx.topology();
        self.reconcile_mappings(topology);
        // Mappings only ever expose completed copies
        self.wait_tracker(ctx)?;

        let desired: Vec<(ProcessorId, Vec<Option<DesiredMapping>>)> = self
            .processors()
            .iter()
            .map(|p| (p, self.desired_mappings(topology, p)))
            .collect();
        let foreign = self.foreign_mappings(&desired);

        let mut plans = Vec::new();
        for (processor, maps) in &desired {
            let Some(id) = processor.gpu() else {
                continue;
            };
            let gpu = ctx.gpu(id)?.clone();
            let own_foreign = foreign.get(id.index()).copied().unwrap_or_default();
            let Some(shape) = Shape::compute(self, &gpu, &ctx.config().mapping, maps, &own_foreign, limits) else {
                continue;
            };
            let old = match self.gpu(id) {
                Some(state) => (0..self.pages())
                    .map(|page| state.ptes.effective(page, &state.big).map(|(t, ..)| t))
                    .collect(),
                None => Vec::new(),
            };
            plans.push(GpuPlan {
                gpu,
                shape,
                batch: TlbBatch::new(),
                old,
            });
        }

        // Phase A
        let mut short = None;
        for plan in &plans {
            match self.reserve_ptes(&plan.gpu, &plan.shape, retry) {
                Ok(()) => {}
                Err(Error::MoreProcessingRequired) => {
                    short = Some(Error::MoreProcessingRequired);
                }
                Err(err) => return Err(err),
            }
        }
        let degraded = short.is_some();
        if degraded {
            log::debug!("{:?}: PTE storage short, invalidating only", self.start);
        }

        // Phase B
        let mut swizzle_changes = alloc::vec![PageMask::new(); self.gpus.len()];
        if !degraded {
            for plan in &plans {
                if let Some(state) = self.gpu(plan.gpu.id()) {
                    let old = state.swizzled;
                    swizzle_changes[plan.gpu.id().index()] = old.andnot(&plan.shape.swizzled) | plan.shape.swizzled.andnot(&old);
                }
            }
        }
        for plan in &mut plans {
            plan.batch = self.invalidate_stale(&plan.gpu, &plan.shape, &swizzle_changes, degraded);
        }
        let cpu_maps: Vec<Option<(MemAddr, Prot)>> = desired
            .iter()
            .find(|(p, _)| p.is_cpu())
            .map(|(_, maps)| maps.iter().map(|m| m.map(|m| (m.target, m.prot))).collect())
            .unwrap_or_default();
        let cpu_old: Vec<Option<MemAddr>> = self.cpu.shadow.iter().map(|s| s.map(|(t, _)| t)).collect();
        self.unmap_stale_cpu(ctx, &cpu_maps);

        // Phase C
        for plan in &plans {
            if !plan.batch.is_empty() {
                plan.gpu.page_tree().invalidate_tlb(&plan.batch);
            }
        }
        if let Some(err) = short {
            self.settle_degraded(ctx, &plans)?;
            return Err(err);
        }

        let mut converted = false;
        for plan in &plans {
            converted |= self.convert_swizzle(ctx, &plan.gpu, &plan.shape.swizzled)?;
        }
        if converted {
            self.wait_tracker(ctx)?;
        }

        // Phase D
        for plan in &plans {
            self.write_shape(&plan.gpu, &plan.shape);
        }
        self.map_cpu(ctx, &cpu_maps);

        for (processor, maps) in &desired {
            let old = match processor.gpu() {
                None => &cpu_old,
                Some(id) => match plans.iter().find(|p| p.gpu.id() == id) {
                    Some(plan) => &plan.old,
                    None => continue,
                },
            };
            self.notify_remote_maps(ctx, *processor, maps, old);
        }
        Ok(())
    }

    /// Leave the block consistent after a sync that only invalidated
    ///
    /// The lock is dropped before the retry, so swizzling is kept only under
    /// live own big leaves and every permission the page tables do not back
    /// is dropped. The re-run grants them again.
    fn settle_degraded(&mut self, ctx: &VaContext, plans: &[GpuPlan]) -> Result<()> {
        let mut converted = false;
        for plan in plans {
            let id = plan.gpu.id();
            let own = Aperture::Vidmem(id);
            let Some(state) = self.gpu(id) else {
                continue;
            };
            let mut keep = PageMask::new();
            for index in 0..state.big.count {
                let region = state.big.region(index);
                let live = matches!(
                    state.ptes.effective(region.first, &state.big),
                    Some((target, _, PageSize::Big)) if target.aperture == own
                );
                if live && state.swizzled.region_full(region) {
                    keep.region_fill(region);
                }
            }
            converted |= self.convert_swizzle(ctx, &plan.gpu, &keep)?;
        }
        if converted {
            self.wait_tracker(ctx)?;
        }

        let topology = ctx.topology();
        for processor in self.processors().iter() {
            let desired = self.desired_mappings(topology, processor);
            let mut stale = PageMask::new();
            for (page, map) in desired.iter().enumerate() {
                let Some(map) = map else {
                    continue;
                };
                let actual = match processor.gpu() {
                    None => self.cpu.shadow[page],
                    Some(id) => self
                        .gpu(id)
                        .and_then(|g| g.ptes.effective(page, &g.big))
                        .map(|(target, prot, _)| (target, prot)),
                };
                if actual != Some((map.target, map.prot)) {
                    stale.set(page);
                }
            }
            if stale.is_empty() {
                continue;
            }
            log::trace!("{:?}: dropping {} unbacked pages of {:?}", self.start, stale.weight(), processor);
            if let Some(procs) = self.procs_mut(processor) {
                procs.unmap(&stale);
            }
        }
        self.update_masks(ctx);
        Ok(())
    }

    fn reserve_ptes(&mut self, gpu: &VaGpu, shape: &Shape, retry: &mut VaBlockRetry) -> Result<()> {
        if !shape.mapped {
            return Ok(());
        }
        let (start, end) = (self.start, self.end);
        let id = gpu.id();
        let Some(state) = self.gpu_mut(id) else {
            return Ok(());
        };
        let tree = gpu.page_tree();
        let mut reserve = |size: PageSize, start, len| {
            tree.get_or_alloc_ptes(size, start, len, false).map_err(|err| match err {
                Error::OutOfMemory => retry.need(RetryNeed::Ptes { gpu: id, size, start, len }),
                err => err,
            })
        };
        let ptes = &mut state.ptes;

        if shape.is_2m {
            if ptes.range_2m.is_none() {
                let range = reserve(PageSize::Size2M, start.align_down(PAGE_SIZE_2M), PAGE_SIZE_2M)?;
                ptes.slot = if ptes.range_big.is_some() || ptes.range_4k.is_some() {
                    PteValue::NextLevel
                } else {
                    PteValue::Invalid
                };
                ptes.range_2m = Some(range);
            }
            return Ok(());
        }
        if ptes.range_4k.is_none() && shape.small.iter().any(PteValue::is_leaf) {
            ptes.range_4k = Some(reserve(PageSize::Size4K, start, end.raw() - start.raw() + 1)?);
        }
        if ptes.range_big.is_none() && shape.big.iter().any(PteValue::is_leaf) {
            let big = state.big;
            ptes.range_big = Some(reserve(PageSize::Big, big.va, big.count as u64 * big.bytes())?);
        }
        Ok(())
    }

    /// Phase B for one GPU
    fn invalidate_stale(&mut self, gpu: &VaGpu, shape: &Shape, swizzle_changes: &[PageMask], degraded: bool) -> TlbBatch {
        let mut batch = TlbBatch::new();
        let start = self.start;
        let base = start.align_down(PAGE_SIZE_2M);
        let pages = self.pages();
        let own = Aperture::Vidmem(gpu.id());
        let tree = gpu.page_tree();
        let Some(state) = self.gpu_mut(gpu.id()) else {
            return batch;
        };
        let big = state.big;
        let ptes = &mut state.ptes;

        // Memory whose layout changes in this sync cannot be remapped in place
        let stable = |value: &PteValue, region: PageRegion| match value.target().and_then(|t| t.aperture.owner().gpu()) {
            Some(owner) => swizzle_changes.get(owner.index()).map_or(true, |m| m.region_empty(region)),
            None => true,
        };
        let in_place = |old: &PteValue, new: PteValue, region: PageRegion| {
            if !degraded && new.is_leaf() && stable(old, region) && stable(&new, region) {
                new
            } else {
                PteValue::Invalid
            }
        };

        if let Some(range) = ptes.range_2m.as_ref() {
            let old = ptes.slot;
            let full = PageRegion::with_pages(pages);
            let update = if old.is_leaf() {
                let new = if shape.is_2m { shape.slot } else { PteValue::Invalid };
                Some((in_place(&old, new, full), membar_for(old, new, own), PageSizes::SIZE_2M))
            } else if shape.is_2m && old == PteValue::NextLevel && lower_valid(ptes) {
                // Hide the lower levels until the 2M leaf replaces them
                Some((PteValue::Invalid, lower_membar(ptes, own), PageSizes::all()))
            } else {
                None
            };
            if let Some((value, membar, levels)) = update.filter(|(value, ..)| *value != old) {
                tree.write_pte(range, 0, value);
                ptes.slot = value;
                batch.add(base, PAGE_SIZE_2M, levels);
                batch.set_membar(membar);
            }
            if shape.is_2m {
                return batch;
            }
        }

        for index in 0..big.count {
            let old = ptes.big[index];
            let new = shape.big[index];
            if !old.is_leaf() || old == new {
                continue;
            }
            let region = big.region(index);
            let value = in_place(&old, new, region);
            let Some((range, entry)) = entry_index(ptes.range_big.as_ref(), big.region_va(index)) else {
                continue;
            };
            tree.write_pte(range, entry, value);
            batch.add(big.region_va(index), big.bytes(), PageSizes::BIG);
            batch.set_membar(membar_for(old, value, own));
            ptes.big[index] = value;
        }

        for page in 0..ptes.small.len() {
            let old = ptes.small[page];
            let new = shape.small[page];
            if !old.is_leaf() || old == new {
                continue;
            }
            let value = in_place(&old, new, PageRegion::single(page));
            let va = start + page as u64 * PAGE_SIZE;
            let Some((range, entry)) = entry_index(ptes.range_4k.as_ref(), va) else {
                continue;
            };
            tree.write_pte(range, entry, value);
            batch.add(va, PAGE_SIZE, PageSizes::SIZE_4K);
            batch.set_membar(membar_for(old, value, own));
            ptes.small[page] = value;
        }
        batch
    }

    /// Phase D for one GPU
    fn write_shape(&mut self, gpu: &VaGpu, shape: &Shape) {
        let start = self.start;
        let tree = gpu.page_tree();
        let Some(state) = self.gpu_mut(gpu.id()) else {
            return;
        };
        let big = state.big;
        let ptes = &mut state.ptes;

        if !shape.mapped {
            ptes.release_all();
            return;
        }
        if shape.is_2m {
            let Some(range) = ptes.range_2m.as_ref() else {
                debug_assert!(false, "2M shape without a 2M reservation");
                return;
            };
            if ptes.slot != shape.slot {
                tree.write_pte(range, 0, shape.slot);
                ptes.slot = shape.slot;
            }
            ptes.release_lower();
            return;
        }

        for page in 0..ptes.small.len() {
            let value = shape.small[page];
            if ptes.small[page] == value {
                continue;
            }
            let va = start + page as u64 * PAGE_SIZE;
            if let Some((range, entry)) = entry_index(ptes.range_4k.as_ref(), va) {
                tree.write_pte(range, entry, value);
                ptes.small[page] = value;
            }
        }
        for index in 0..big.count {
            let value = shape.big[index];
            if ptes.big[index] == value {
                continue;
            }
            if let Some((range, entry)) = entry_index(ptes.range_big.as_ref(), big.region_va(index)) {
                tree.write_pte(range, entry, value);
                ptes.big[index] = value;
            }
        }
        if let Some(range) = ptes.range_2m.take() {
            tree.write_pde(&range);
            ptes.slot = PteValue::Invalid;
        }
    }

    /// Move big pages of `gpu`'s memory between the linear and swizzled
    /// layouts; returns whether any copy was pushed
    fn convert_swizzle(&mut self, ctx: &VaContext, gpu: &VaGpu, swizzled: &PageMask) -> Result<bool> {
        let id = gpu.id();
        let big_page_size = gpu.caps().big_page_size;
        let Some(state) = self.gpu(id) else {
            return Ok(false);
        };
        let changed = state.swizzled.andnot(swizzled) | swizzled.andnot(&state.swizzled);
        if changed.is_empty() {
            return Ok(false);
        }

        let mut copies = Vec::new();
        for index in 0..state.big.count {
            let region = state.big.region(index);
            if changed.region_empty(region) || state.procs.resident.region_empty(region) {
                continue;
            }
            let Some(mem) = state.chunk_addr(region.first) else {
                continue;
            };
            let (dst, src) = if swizzled.region_full(region) {
                (CopyAddr::swizzled(mem, big_page_size), CopyAddr::linear(mem))
            } else {
                (CopyAddr::linear(mem), CopyAddr::swizzled(mem, big_page_size))
            };
            copies.push((dst, src));
        }

        if !copies.is_empty() {
            log::trace!("{:?}: converting {} big pages on {:?}", self.start, copies.len(), id);
            let engine = gpu.copy_engine();
            let mut push = engine
                .begin_push(ChannelType::GpuInternal, &self.tracker, "swizzle conversion")
                .map_err(|_| ctx.mark_fatal(id))?;
            for (dst, src) in &copies {
                push.memcopy(*dst, *src, big_page_size);
            }
            let token = engine.end_push(push).map_err(|_| ctx.mark_fatal(id))?;
            self.tracker.add(token);
        }
        if let Some(state) = self.gpu_mut(id) {
            state.swizzled = *swizzled;
        }
        Ok(!copies.is_empty())
    }

    fn unmap_stale_cpu(&mut self, ctx: &VaContext, maps: &[Option<(MemAddr, Prot)>]) {
        let mut stale = PageMask::new();
        for (page, current) in self.cpu.shadow.iter().enumerate() {
            if current.is_some() && *current != maps.get(page).copied().flatten() {
                stale.set(page);
            }
        }
        for run in stale.subregions(self.region()) {
            ctx.cpu_mappings()
                .unmap_range(self.page_addr(run.first), run.len() as u64 * PAGE_SIZE);
            for page in run.iter() {
                self.cpu.shadow[page] = None;
            }
        }
    }

    fn map_cpu(&mut self, ctx: &VaContext, maps: &[Option<(MemAddr, Prot)>]) {
        for (page, map) in maps.iter().enumerate() {
            let Some((target, prot)) = *map else {
                continue;
            };
            if self.cpu.shadow[page] != Some((target, prot)) {
                ctx.cpu_mappings().map_page(self.page_addr(page), target, prot);
                self.cpu.shadow[page] = Some((target, prot));
            }
        }
    }

    fn notify_remote_maps(
        &self,
        ctx: &VaContext,
        processor: ProcessorId,
        maps: &[Option<DesiredMapping>],
        old: &[Option<MemAddr>],
    ) {
        let mut by_owner: Vec<(ProcessorId, PageMask)> = Vec::new();
        for (page, map) in maps.iter().enumerate() {
            let Some(map) = map.filter(|m| m.owner != processor) else {
                continue;
            };
            if old.get(page).copied().flatten() == Some(map.target) {
                continue;
            }
            match by_owner.iter_mut().find(|(owner, _)| *owner == map.owner) {
                Some((_, mask)) => mask.set(page),
                None => by_owner.push((map.owner, PageMask::from_page(page))),
            }
        }
        for (residency, mask) in by_owner {
            self.notify_runs(ctx, &mask, |addr, bytes| ToolsEvent::MapRemote {
                processor,
                residency,
                addr,
                bytes,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvm_core::{GpuId, PhysAddr};

    fn map(owner: ProcessorId, addr: u64, prot: Prot) -> Option<DesiredMapping> {
        Some(DesiredMapping {
            owner,
            target: MemAddr::new(Aperture::of(owner), PhysAddr::new(addr)),
            prot,
        })
    }

    #[test]
    fn test_uniform_leaf_needs_contiguous_aligned_memory() {
        let gpu = ProcessorId::from_gpu(GpuId::new(0));
        let base = 0x20_0000;
        let mut maps: Vec<_> = (0..16).map(|i| map(gpu, base + i * PAGE_SIZE, Prot::ReadOnly)).collect();
        let region = PageRegion::new(0, 16);
        assert!(uniform_leaf(&maps, region, 16 * PAGE_SIZE).is_some());

        maps[7] = map(gpu, base + 7 * PAGE_SIZE, Prot::ReadWrite);
        assert!(uniform_leaf(&maps, region, 16 * PAGE_SIZE).is_none());
        maps[7] = map(gpu, 0x90_0000, Prot::ReadOnly);
        assert!(uniform_leaf(&maps, region, 16 * PAGE_SIZE).is_none());
        maps[7] = None;
        assert!(uniform_leaf(&maps, region, 16 * PAGE_SIZE).is_none());

        let shifted: Vec<_> = (0..16).map(|i| map(gpu, base + (i + 1) * PAGE_SIZE, Prot::ReadOnly)).collect();
        assert!(uniform_leaf(&shifted, region, 16 * PAGE_SIZE).is_none());
    }

    #[test]
    fn test_membar_choice() {
        let own = Aperture::Vidmem(GpuId::new(0));
        let vid = MemAddr::new(own, PhysAddr::new(0x1000));
        let sys = MemAddr::new(Aperture::Sysmem, PhysAddr::new(0x1000));
        let leaf = |target, prot| PteValue::Leaf { target, prot };

        assert_eq!(
            membar_for(leaf(vid, Prot::ReadOnly), leaf(vid, Prot::ReadWrite), own),
            Membar::None
        );
        assert_eq!(
            membar_for(leaf(vid, Prot::ReadWrite), leaf(vid, Prot::ReadOnly), own),
            Membar::Gpu
        );
        assert_eq!(membar_for(leaf(sys, Prot::ReadOnly), PteValue::Invalid, own), Membar::Sys);
        assert_eq!(membar_for(PteValue::Invalid, leaf(sys, Prot::ReadOnly), own), Membar::None);
    }
}
