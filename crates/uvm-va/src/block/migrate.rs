//! # Residency Changes
//!
//! Populating backing memory and copying pages between processors.
//!
//! ```text
//!   populate ──▶ unmap / revoke ──▶ copy runs ──▶ residency update ──▶ events
//!   (may retry,                     (pushes, tracked
//!    nothing mutated yet)            by the block)
//! ```
//!
//! A copy run is a range of pages with one source whose memory is
//! contiguous on both sides. GPUs that cannot reach each other stage the
//! data through the block's CPU pages in two hops.

use alloc::sync::Arc;
use alloc::vec::Vec;

use uvm_cmd::{ChannelType, CopyAddr, Push, Tracker};
use uvm_core::{
    Error, GpuId, MakeResidentCause, MemAddr, PageIndex, PageMask, PageRegion, ProcessorId, ProcessorMask, Prot, PteBit, Result,
    ToolsEvent, Topology, PAGE_SIZE,
};
use uvm_mem::CpuPage;

use super::retry::{RetryNeed, VaBlockRetry};
use super::state::BlockState;
use crate::context::VaContext;
use crate::gpu::VaGpu;
use crate::perf::PerfEvent;

/// What happens to the other copies of pages made resident
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResidencyMode {
    /// The destination becomes the only copy
    Move,
    /// The destination gets an additional read-only copy
    Duplicate,
}

// =============================================================================
// COPY PLANNING
// =============================================================================

/// How one page reaches the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageCopy {
    src: ProcessorId,
    src_addr: CopyAddr,
    /// Staging page for copies between unconnected GPUs
    stage: Option<MemAddr>,
    dst_addr: CopyAddr,
}

impl PageCopy {
    /// Can `next` extend a run that ends with `self`?
    fn continues(&self, next: &PageCopy) -> bool {
        let follows = |a: CopyAddr, b: CopyAddr| a.swizzled == b.swizzled && a.mem.is_followed_by(b.mem, PAGE_SIZE);
        self.src == next.src
            && follows(self.src_addr, next.src_addr)
            && follows(self.dst_addr, next.dst_addr)
            && match (self.stage, next.stage) {
                (None, None) => true,
                (Some(a), Some(b)) => a.is_followed_by(b, PAGE_SIZE),
                _ => false,
            }
    }
}

#[derive(Debug)]
struct CopyRun {
    first: PageIndex,
    pages: usize,
    copy: PageCopy,
}

impl CopyRun {
    #[inline]
    fn bytes(&self) -> u64 {
        self.pages as u64 * PAGE_SIZE
    }
}

/// Pushes opened while issuing one batch of copies
#[derive(Default)]
struct PushSet {
    open: Vec<(Arc<VaGpu>, ChannelType, Push)>,
}

impl PushSet {
    fn get(&mut self, ctx: &VaContext, gpu: &Arc<VaGpu>, channel: ChannelType, wait_on: &Tracker) -> Result<&mut Push> {
        let index = match self
            .open
            .iter()
            .position(|(g, c, _)| g.id() == gpu.id() && *c == channel)
        {
            Some(index) => index,
            None => {
                gpu.check()?;
                let push = gpu
                    .copy_engine()
                    .begin_push(channel, wait_on, "make resident")
                    .map_err(|_| ctx.mark_fatal(gpu.id()))?;
                self.open.push((gpu.clone(), channel, push));
                self.open.len() - 1
            }
        };
        Ok(&mut self.open[index].2)
    }

    /// Submit everything; tokens land in `tracker`
    fn finish(self, ctx: &VaContext, tracker: &mut Tracker) -> Result<()> {
        let mut result = Ok(());
        for (gpu, _, push) in self.open {
            match gpu.copy_engine().end_push(push) {
                Ok(token) => tracker.add(token),
                Err(_) => {
                    let err = ctx.mark_fatal(gpu.id());
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        result
    }
}

fn copy_addr(mem: MemAddr, swizzled: bool, big_page_size: u64) -> CopyAddr {
    if swizzled {
        CopyAddr::swizzled(mem, big_page_size)
    } else {
        CopyAddr::linear(mem)
    }
}

// =============================================================================
// MAKE RESIDENT
// =============================================================================

impl BlockState {
    /// Wait for every tracked copy; a failed channel makes its GPU fatal
    pub(crate) fn wait_tracker(&mut self, ctx: &VaContext) -> Result<()> {
        if self.tracker.is_empty() {
            return Ok(());
        }
        let mut failed = None;
        for token in self.tracker.tokens() {
            if let Err(err) = token.wait() {
                log::warn!("{:?}: copy on {:?} failed: {}", self.start, token.channel(), err);
                failed.get_or_insert(token.channel().gpu);
            }
        }
        self.tracker.clear();
        match failed {
            Some(gpu) => Err(ctx.mark_fatal(gpu)),
            None => Ok(()),
        }
    }

    /// Best copy source for `page` going to `dst`, and whether it must be
    /// staged through system memory
    fn copy_source(&self, topology: &Topology, dst: ProcessorId, page: PageIndex) -> Option<(ProcessorId, bool)> {
        let residents = self.resident_processors(page).without(dst);
        let direct: ProcessorMask = residents
            .iter()
            .filter(|src| topology.can_copy_direct(*src, dst))
            .collect();
        match topology.closest_any(dst, direct) {
            Some(src) => Some((src, false)),
            None => topology.closest_any(dst, residents).map(|src| (src, true)),
        }
    }

    /// Allocate what `dst` needs to receive `pages`
    ///
    /// Nothing else is changed, so a failure here leaves the block as it
    /// was.
    pub(crate) fn populate(
        &mut self,
        ctx: &VaContext,
        retry: &mut VaBlockRetry,
        dst: ProcessorId,
        pages: &PageMask,
    ) -> Result<()> {
        let needed = pages.andnot(&self.resident_mask(dst));
        if needed.is_empty() {
            return Ok(());
        }
        let mut staging = PageMask::new();
        for page in needed.iter() {
            if let Some((_, true)) = self.copy_source(ctx.topology(), dst, page) {
                staging.set(page);
            }
        }
        match dst.gpu() {
            None => self.populate_cpu(ctx, &(needed | staging)),
            Some(id) => {
                self.populate_cpu(ctx, &staging)?;
                self.populate_gpu(ctx, retry, id, &needed)
            }
        }
    }

    fn populate_cpu(&mut self, ctx: &VaContext, pages: &PageMask) -> Result<()> {
        for page in pages.iter() {
            if self.cpu.pages[page].is_none() {
                self.cpu.pages[page] = Some(ctx.sysmem().alloc_page()?);
            }
        }
        Ok(())
    }

    fn populate_gpu(&mut self, ctx: &VaContext, retry: &mut VaBlockRetry, id: GpuId, pages: &PageMask) -> Result<()> {
        let gpu = ctx.gpu(id)?.clone();
        let region = self.region();
        let start = self.start;
        let state = self.gpu_or_init(&gpu);
        for run in pages.subregions(region) {
            for (index, entry) in state.layout.entries_in(run) {
                if state.chunks[index].is_some() {
                    continue;
                }
                let chunk = match retry.take_chunk(id, entry.size) {
                    Some(chunk) => chunk,
                    None => match gpu.chunks().alloc(entry.size, false) {
                        Ok(chunk) => chunk,
                        Err(Error::OutOfMemory) => {
                            return Err(retry.need(RetryNeed::Chunk { gpu: id, size: entry.size }));
                        }
                        Err(err) => return Err(err),
                    },
                };
                log::trace!("{:?}: page {} backed by {:?}", start, entry.region.first, chunk);
                state.chunks[index] = Some(chunk);
            }
        }
        Ok(())
    }

    /// Make `pages` resident on `dst`
    pub(crate) fn make_resident(
        &mut self,
        ctx: &VaContext,
        retry: &mut VaBlockRetry,
        dst: ProcessorId,
        pages: &PageMask,
        cause: MakeResidentCause,
        mode: ResidencyMode,
    ) -> Result<()> {
        let pages = *pages & PageMask::from_region(self.region());
        self.populate(ctx, retry, dst, &pages)?;

        let needed = pages.andnot(&self.resident_mask(dst));
        let duplicated = pages & self.read_duplicated;
        match mode {
            ResidencyMode::Move => self.unmap_for_move(dst, &needed, &duplicated),
            ResidencyMode::Duplicate => {
                let mut shared = PageMask::new();
                for page in pages.iter() {
                    if self.resident_processors(page).with(dst).weight() >= 2 {
                        shared.set(page);
                    }
                }
                self.revoke(ctx, self.processors(), &shared, PteBit::Write);
            }
        }

        let (first_touch, sources) = self.copy_pages(ctx, dst, &needed, cause)?;

        if let Some(procs) = self.procs_mut(dst) {
            procs.resident |= needed;
        }
        match mode {
            ResidencyMode::Move => {
                for other in self.processors().without(dst).iter() {
                    if let Some(procs) = self.procs_mut(other) {
                        procs.resident.andnot_assign(&pages);
                    }
                }
                if !duplicated.is_empty() {
                    self.read_duplicated.andnot_assign(&duplicated);
                    self.notify_runs(ctx, &duplicated, |addr, bytes| ToolsEvent::ReadDuplicateInvalidate {
                        residency: dst,
                        addr,
                        bytes,
                    });
                }
            }
            ResidencyMode::Duplicate => {
                self.update_read_duplicated(&pages);
                let added = needed & self.read_duplicated;
                for run in added.subregions(self.region()) {
                    ctx.notify(ToolsEvent::ReadDuplicate {
                        processors: self.resident_processors(run.first),
                        addr: self.page_addr(run.first),
                        bytes: run.len() as u64 * PAGE_SIZE,
                    });
                }
            }
        }

        if !first_touch.is_empty() {
            self.notify_runs(ctx, &first_touch, |addr, bytes| ToolsEvent::FirstTouch {
                processor: dst,
                addr,
                bytes,
            });
        }
        for (src, pages) in sources {
            self.perf_notify(
                ctx,
                &PerfEvent::Migration {
                    dst,
                    src,
                    pages,
                    cause,
                },
            );
        }
        self.update_masks(ctx);
        Ok(())
    }

    fn unmap_for_move(&mut self, dst: ProcessorId, needed: &PageMask, duplicated: &PageMask) {
        let policy = *self.range.policy();
        for processor in self.processors().iter() {
            // UVM-Lite mappings of the preferred location stay valid
            if policy.is_uvm_lite(processor) && policy.preferred_location == Some(dst) {
                continue;
            }
            let unmap = if processor == dst { *needed } else { *needed | *duplicated };
            if let Some(procs) = self.procs_mut(processor) {
                procs.unmap(&unmap);
            }
        }
    }

    /// Lower `processors` below `bit` on `pages`, with tools and perf events
    pub(crate) fn revoke(&mut self, ctx: &VaContext, processors: ProcessorMask, pages: &PageMask, bit: PteBit) {
        if pages.is_empty() {
            return;
        }
        let new_prot = Prot::below(bit);
        for processor in processors.iter() {
            let Some(lost) = self.procs_mut(processor).map(|p| p.revoke(pages, bit)) else {
                continue;
            };
            if lost.is_empty() {
                continue;
            }
            self.notify_runs(ctx, &lost, |addr, bytes| ToolsEvent::Revocation {
                processor,
                addr,
                bytes,
                new_prot,
            });
            self.perf_notify(
                ctx,
                &PerfEvent::Revocation {
                    processor,
                    pages: lost,
                    new_prot,
                },
            );
        }
    }

    fn plan_copies(&self, ctx: &VaContext, dst: ProcessorId, pages: &PageMask) -> Result<(PageMask, Vec<CopyRun>)> {
        let topology = ctx.topology();
        let max_pages = ctx.config().migration.max_copy_size.pages().max(1);
        let big_of = |p: ProcessorId| {
            p.gpu()
                .and_then(|g| ctx.gpu_any(g))
                .map_or(0, |g| g.caps().big_page_size)
        };
        let mut first_touch = PageMask::new();
        let mut runs: Vec<CopyRun> = Vec::new();
        let mut last: Option<(PageIndex, PageCopy)> = None;

        for page in pages.iter() {
            let Some((src, staged)) = self.copy_source(topology, dst, page) else {
                first_touch.set(page);
                continue;
            };
            let (Some(src_mem), Some(dst_mem)) = (self.mem_addr(src, page), self.mem_addr(dst, page)) else {
                debug_assert!(false, "page {} copy {:?} -> {:?} without backing", page, src, dst);
                return Err(Error::InvalidParameter);
            };
            let stage = if staged {
                let mem = self.mem_addr(ProcessorId::CPU, page);
                debug_assert!(mem.is_some(), "staged copy without a staging page");
                Some(mem.ok_or(Error::InvalidParameter)?)
            } else {
                None
            };
            let copy = PageCopy {
                src,
                src_addr: copy_addr(src_mem, self.is_swizzled(src, page), big_of(src)),
                stage,
                dst_addr: copy_addr(dst_mem, self.is_swizzled(dst, page), big_of(dst)),
            };
            let extend = match (last, runs.last()) {
                (Some((prev, prev_copy)), Some(run)) => {
                    prev + 1 == page && prev_copy.continues(&copy) && run.pages < max_pages
                }
                _ => false,
            };
            match runs.last_mut() {
                Some(run) if extend => run.pages += 1,
                _ => runs.push(CopyRun {
                    first: page,
                    pages: 1,
                    copy,
                }),
            }
            last = Some((page, copy));
        }
        Ok((first_touch, runs))
    }

    /// Copy `pages` to `dst` and zero the ones with no copy anywhere
    ///
    /// Returns the zeroed pages and the pages copied from each source.
    fn copy_pages(
        &mut self,
        ctx: &VaContext,
        dst: ProcessorId,
        pages: &PageMask,
        cause: MakeResidentCause,
    ) -> Result<(PageMask, Vec<(ProcessorId, PageMask)>)> {
        let (first_touch, runs) = self.plan_copies(ctx, dst, pages)?;
        let dst_gpu = match dst.gpu() {
            Some(id) => Some(ctx.gpu(id)?.clone()),
            None => None,
        };

        // Hop one of staged copies
        let mut staged = PushSet::default();
        for run in runs.iter().filter(|r| r.copy.stage.is_some()) {
            let src = ctx.gpu_of(run.copy.src)?.clone();
            let stage = run.copy.stage.ok_or(Error::InvalidParameter)?;
            staged
                .get(ctx, &src, ChannelType::GpuToCpu, &self.tracker)?
                .memcopy(CopyAddr::linear(stage), run.copy.src_addr, run.bytes());
        }
        let mut hop_one = Tracker::new();
        staged.finish(ctx, &mut hop_one)?;
        self.tracker.merge(&hop_one);

        let mut pushes = PushSet::default();
        let mut sources: Vec<(ProcessorId, PageMask)> = Vec::new();
        for run in &runs {
            let (engine, channel, src_addr) = match (&dst_gpu, run.copy.stage) {
                (Some(gpu), Some(stage)) => (gpu.clone(), ChannelType::CpuToGpu, CopyAddr::linear(stage)),
                (Some(gpu), None) if run.copy.src.is_cpu() => (gpu.clone(), ChannelType::CpuToGpu, run.copy.src_addr),
                (Some(gpu), None) => (gpu.clone(), ChannelType::GpuToGpu, run.copy.src_addr),
                (None, _) => (ctx.gpu_of(run.copy.src)?.clone(), ChannelType::GpuToCpu, run.copy.src_addr),
            };
            let push = pushes.get(ctx, &engine, channel, &self.tracker)?;
            push.memcopy(run.copy.dst_addr, src_addr, run.bytes());

            let events = ctx.events().clone();
            let (src, addr, bytes) = (run.copy.src, self.page_addr(run.first), run.bytes());
            push.on_complete(move || {
                events.notify(ToolsEvent::Migration {
                    src,
                    dst,
                    addr,
                    bytes,
                    cause,
                });
            });

            let run_pages = PageMask::from_region(PageRegion::new(run.first, run.first + run.pages));
            match sources.iter_mut().find(|(s, _)| *s == src) {
                Some((_, mask)) => *mask |= run_pages,
                None => sources.push((src, run_pages)),
            }
        }

        for run in first_touch.subregions(self.region()) {
            let Some(mem) = self.mem_addr(dst, run.first) else {
                continue;
            };
            let bytes = run.len() as u64 * PAGE_SIZE;
            match &dst_gpu {
                Some(gpu) => {
                    let contiguous = run
                        .iter()
                        .all(|page| self.mem_addr(dst, page) == Some(mem.offset((page - run.first) as u64 * PAGE_SIZE)));
                    let push = pushes.get(ctx, gpu, ChannelType::GpuInternal, &self.tracker)?;
                    if contiguous {
                        push.memset(CopyAddr::linear(mem), 0, bytes);
                    } else {
                        for page in run.iter() {
                            if let Some(mem) = self.mem_addr(dst, page) {
                                push.memset(CopyAddr::linear(mem), 0, PAGE_SIZE);
                            }
                        }
                    }
                }
                None => {
                    for page in run.iter() {
                        if let Some(mem) = self.mem_addr(dst, page) {
                            ctx.cpu_access().zero(mem, PAGE_SIZE)?;
                        }
                    }
                }
            }
        }

        let mut tracker = Tracker::new();
        pushes.finish(ctx, &mut tracker)?;
        self.tracker.merge(&tracker);
        Ok((first_touch, sources))
    }

    // -------------------------------------------------------------------------
    // CPU access through staging pages
    // -------------------------------------------------------------------------

    /// Copy one page of `src`'s memory into a fresh system page
    fn stage_in(&mut self, ctx: &VaContext, src: &VaGpu, page: PageIndex) -> Result<CpuPage> {
        let processor = src.processor();
        let mem = self.mem_addr(processor, page).ok_or(Error::InvalidParameter)?;
        let from = copy_addr(mem, self.is_swizzled(processor, page), src.caps().big_page_size);
        let temp = ctx.sysmem().alloc_page()?;
        match self.push_page_copy(ctx, src, ChannelType::GpuToCpu, CopyAddr::linear(temp.mem_addr(0)), from) {
            Ok(()) => Ok(temp),
            Err(err) => {
                ctx.sysmem().free_page(temp);
                Err(err)
            }
        }
    }

    /// Copy a staged page back into `dst`'s memory
    fn stage_out(&mut self, ctx: &VaContext, dst: &VaGpu, page: PageIndex, temp: &CpuPage) -> Result<()> {
        let processor = dst.processor();
        let mem = self.mem_addr(processor, page).ok_or(Error::InvalidParameter)?;
        let to = copy_addr(mem, self.is_swizzled(processor, page), dst.caps().big_page_size);
        self.push_page_copy(ctx, dst, ChannelType::CpuToGpu, to, CopyAddr::linear(temp.mem_addr(0)))
    }

    fn push_page_copy(&mut self, ctx: &VaContext, gpu: &VaGpu, channel: ChannelType, dst: CopyAddr, src: CopyAddr) -> Result<()> {
        gpu.check()?;
        let engine = gpu.copy_engine();
        let mut push = engine
            .begin_push(channel, &self.tracker, "cpu access")
            .map_err(|_| ctx.mark_fatal(gpu.id()))?;
        push.memcopy(dst, src, PAGE_SIZE);
        let token = engine.end_push(push).map_err(|_| ctx.mark_fatal(gpu.id()))?;
        token.wait().map_err(|_| ctx.mark_fatal(gpu.id()))
    }

    /// Read `buf.len()` bytes at `offset` into `page` from its closest copy
    pub(crate) fn read_page(&mut self, ctx: &VaContext, page: PageIndex, offset: usize, buf: &mut [u8]) -> Result<()> {
        debug_assert!(offset + buf.len() <= PAGE_SIZE as usize);
        let residents = self.resident_processors(page);
        let Some(src) = ctx.topology().closest_any(ProcessorId::CPU, residents) else {
            // Never touched
            buf.fill(0);
            return Ok(());
        };
        self.wait_tracker(ctx)?;
        if src.is_cpu() {
            let mem = self.mem_addr(src, page).ok_or(Error::InvalidParameter)?;
            return ctx.cpu_access().read(mem.offset(offset as u64), buf);
        }
        let gpu = ctx.gpu_of(src)?.clone();
        let temp = self.stage_in(ctx, &gpu, page)?;
        let result = ctx.cpu_access().read(temp.mem_addr(offset as u64), buf);
        ctx.sysmem().free_page(temp);
        result
    }

    /// Write `data` at `offset` into every copy of `page`
    pub(crate) fn write_page(
        &mut self,
        ctx: &VaContext,
        retry: &mut VaBlockRetry,
        page: PageIndex,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        debug_assert!(offset + data.len() <= PAGE_SIZE as usize);
        if self.resident_processors(page).is_empty() {
            self.make_resident(
                ctx,
                retry,
                ProcessorId::CPU,
                &PageMask::from_page(page),
                MakeResidentCause::CpuAccess,
                ResidencyMode::Move,
            )?;
        }
        self.wait_tracker(ctx)?;
        for processor in self.resident_processors(page).iter() {
            if processor.is_cpu() {
                let mem = self.mem_addr(processor, page).ok_or(Error::InvalidParameter)?;
                ctx.cpu_access().write(mem.offset(offset as u64), data)?;
                continue;
            }
            let gpu = ctx.gpu_of(processor)?.clone();
            let temp = self.stage_in(ctx, &gpu, page)?;
            let result = ctx
                .cpu_access()
                .write(temp.mem_addr(offset as u64), data)
                .and_then(|()| self.stage_out(ctx, &gpu, page, &temp));
            ctx.sysmem().free_page(temp);
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvm_core::{Aperture, PhysAddr};

    fn copy(src: ProcessorId, src_addr: u64, dst_addr: u64) -> PageCopy {
        PageCopy {
            src,
            src_addr: CopyAddr::linear(MemAddr::new(Aperture::Sysmem, PhysAddr::new(src_addr))),
            stage: None,
            dst_addr: CopyAddr::linear(MemAddr::new(Aperture::Vidmem(GpuId::new(0)), PhysAddr::new(dst_addr))),
        }
    }

    #[test]
    fn test_runs_need_contiguity_on_both_sides() {
        let a = copy(ProcessorId::CPU, 0x1000, 0x8000);
        assert!(a.continues(&copy(ProcessorId::CPU, 0x2000, 0x9000)));
        assert!(!a.continues(&copy(ProcessorId::CPU, 0x3000, 0x9000)));
        assert!(!a.continues(&copy(ProcessorId::CPU, 0x2000, 0xa000)));
        assert!(!a.continues(&copy(ProcessorId::from_gpu(GpuId::new(1)), 0x2000, 0x9000)));

        let mut swizzled = copy(ProcessorId::CPU, 0x2000, 0x9000);
        swizzled.dst_addr = CopyAddr::swizzled(swizzled.dst_addr.mem, 0x10000);
        assert!(!a.continues(&swizzled));
    }
}
