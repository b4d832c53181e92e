//! # VA Blocks
//!
//! A VA block tracks residency and mappings of up to 2 MiB of virtual
//! address space that never crosses a 2 MiB boundary.
//!
//! ```text
//!   VaBlock
//!   ├── start, end
//!   └── Mutex<BlockState>
//!        ├── CPU:  pages, resident, READ/WRITE bits, page-table shadow
//!        ├── GPUn: chunks, resident, READ/WRITE/ATOMIC bits,
//!        │         2M/big/4K PTE ranges and shadows, swizzled pages
//!        ├── resident / mapped processor masks
//!        ├── read-duplicated pages
//!        ├── tracker (outstanding copies)
//!        └── perf data (thrashing)
//! ```
//!
//! Every public operation runs under the block lock through
//! [`VaBlock::with_retry`]: allocations made under the lock never evict, and
//! an operation that comes up short unwinds, allocates with eviction after
//! dropping the lock and starts over.

mod migrate;
mod pte;
mod retry;
mod service;
mod split;
mod state;
mod verify;

pub use retry::{RetryNeed, VaBlockRetry};
pub use service::ServiceResult;
pub use verify::{InvariantViolation, Violations};

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use uvm_core::{
    AccessType, Error, GpuId, MakeResidentCause, MemAddr, PageIndex, PageMask, PhysAddr, ProcessorId,
    ProcessorMask, Prot, PteBit, Result, ToolsEvent, VirtAddr, PAGE_SIZE,
};
use uvm_mem::PageSize;

use crate::context::VaContext;
use crate::perf::PerfEvent;
use crate::range::VaRange;
use migrate::ResidencyMode;
use pte::ShapeLimits;
use state::BlockState;

// =============================================================================
// EVENT HELPERS
// =============================================================================

impl BlockState {
    /// Raise one tools event per contiguous run of `pages`
    pub(crate) fn notify_runs(&self, ctx: &VaContext, pages: &PageMask, event: impl Fn(VirtAddr, u64) -> ToolsEvent) {
        for run in pages.subregions(self.region()) {
            ctx.notify(event(self.page_addr(run.first), run.len() as u64 * PAGE_SIZE));
        }
    }

    /// Dispatch a perf event for this block
    pub(crate) fn perf_notify(&mut self, ctx: &VaContext, event: &PerfEvent) {
        let perf_ctx = self.perf_ctx(ctx);
        ctx.perf().notify(&mut self.perf, &perf_ctx, event);
    }

    /// Bring the block in line with a new range policy
    fn apply_policy(&mut self, ctx: &VaContext, retry: &mut VaBlockRetry) -> Result<()> {
        let policy = *self.range.policy();
        let all = PageMask::from_region(self.region());
        if let Some(bit) = PteBit::ALL.iter().copied().find(|bit| !policy.max_prot.has(*bit)) {
            self.revoke(ctx, self.processors(), &all, bit);
        }
        let resident = self.resident_anywhere();
        self.map_accessed_by(ctx, &resident, ProcessorMask::empty())?;
        self.update_masks(ctx);
        self.sync_mappings(ctx, retry, &ShapeLimits::default())?;
        self.update_masks(ctx);
        Ok(())
    }
}

// =============================================================================
// PTE INTROSPECTION
// =============================================================================

/// Page-table shape of one GPU for a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuPteInfo {
    /// The whole block is one valid 2M leaf
    pub is_2m: bool,
    /// Pages under valid big leaves
    pub big_leaves: PageMask,
    /// Pages under valid 4K leaves
    pub small_leaves: PageMask,
    /// Pages of the GPU's memory in the swizzled layout
    pub swizzled: PageMask,
}

// =============================================================================
// VA BLOCK
// =============================================================================

/// Residency and mapping state of a piece of a VA range
pub struct VaBlock {
    start: VirtAddr,
    /// Inclusive; only lowered by a split
    end: AtomicU64,
    state: spin::Mutex<BlockState>,
}

impl VaBlock {
    /// Create an empty block for `[start, end]` inside `range`
    pub(crate) fn new(start: VirtAddr, end: VirtAddr, range: Arc<VaRange>) -> Self {
        Self::from_state(BlockState::new(start, end, range))
    }

    fn from_state(state: BlockState) -> Self {
        Self {
            start: state.start,
            end: AtomicU64::new(state.end.raw()),
            state: spin::Mutex::new(state),
        }
    }

    /// First address
    #[inline]
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// Last address (inclusive)
    #[inline]
    pub fn end(&self) -> VirtAddr {
        VirtAddr::new(self.end.load(Ordering::Acquire))
    }

    /// Number of pages
    #[inline]
    pub fn pages(&self) -> usize {
        ((self.end().raw() - self.start.raw() + 1) / PAGE_SIZE) as usize
    }

    /// Does the block cover `addr`?
    #[inline]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr <= self.end()
    }

    /// Block page holding `addr`
    #[inline]
    pub fn page_index(&self, addr: VirtAddr) -> Option<PageIndex> {
        self.contains(addr)
            .then(|| ((addr.raw() - self.start.raw()) / PAGE_SIZE) as usize)
    }

    /// Range the block belongs to
    pub fn range(&self) -> Arc<VaRange> {
        self.state.lock().range.clone()
    }

    // -------------------------------------------------------------------------
    // Operation driver
    // -------------------------------------------------------------------------

    /// Run `op` under the block lock, retrying with eviction-enabled
    /// allocation whenever it reports `MoreProcessingRequired`
    ///
    /// The operation is re-run from scratch on every attempt and must
    /// re-derive anything it read before. Exceeding the configured attempt
    /// limit turns into `OutOfMemory`.
    pub(crate) fn with_retry<T>(
        &self,
        ctx: &VaContext,
        mut op: impl FnMut(&mut BlockState, &mut VaBlockRetry) -> Result<T>,
    ) -> Result<T> {
        let limit = ctx.config().migration.retry_limit;
        let mut retry = VaBlockRetry::new();
        let result = loop {
            let result = {
                let mut state = self.state.lock();
                let result = op(&mut state, &mut retry);
                // Other threads may take the lock before the re-run
                if matches!(result, Ok(_) | Err(Error::MoreProcessingRequired)) {
                    Self::check(ctx, &state);
                }
                result
            };
            match result {
                Err(Error::MoreProcessingRequired) if retry.attempts() < limit => {
                    log::debug!("{:?}: retrying with eviction (attempt {})", self.start, retry.attempts() + 1);
                    if let Err(err) = retry.prepare(ctx) {
                        break Err(err);
                    }
                }
                Err(Error::MoreProcessingRequired) => {
                    log::warn!("{:?}: gave up after {} attempts", self.start, retry.attempts());
                    break Err(Error::OutOfMemory);
                }
                other => break other,
            }
        };
        retry.release(ctx);
        result
    }

    #[cfg(any(debug_assertions, feature = "verify"))]
    fn check(ctx: &VaContext, state: &BlockState) {
        let violations = state.verify(ctx);
        for violation in &violations {
            log::error!("{:?}: {}", state.start, violation);
        }
        debug_assert!(violations.is_empty(), "block {:?} is inconsistent", state.start);
    }

    #[cfg(not(any(debug_assertions, feature = "verify")))]
    #[inline]
    fn check(_ctx: &VaContext, _state: &BlockState) {}

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Service faults `requester` took on this block
    pub fn service_faults(
        &self,
        ctx: &VaContext,
        requester: ProcessorId,
        faults: &[(PageIndex, AccessType)],
        cause: MakeResidentCause,
    ) -> Result<ServiceResult> {
        if faults.iter().any(|(page, _)| *page >= self.pages()) {
            return Err(Error::InvalidAddress);
        }
        self.with_retry(ctx, |state, retry| {
            state.service_faults(ctx, retry, requester, faults, cause)
        })
    }

    /// Move `pages` to `dst` and map them for the range's `accessed_by`
    /// processors
    pub fn migrate(&self, ctx: &VaContext, dst: ProcessorId, pages: &PageMask, cause: MakeResidentCause) -> Result<()> {
        if let Some(id) = dst.gpu() {
            ctx.gpu(id)?;
        }
        self.with_retry(ctx, |state, retry| {
            let pages = *pages & PageMask::from_region(state.region());
            state.make_resident(ctx, retry, dst, &pages, cause, ResidencyMode::Move)?;
            state.map_accessed_by(ctx, &pages, ProcessorMask::empty())?;
            state.update_masks(ctx);
            state.sync_mappings(ctx, retry, &ShapeLimits::default())?;
            state.update_masks(ctx);
            Ok(())
        })
    }

    /// Switch to a new range and apply its policy
    pub(crate) fn set_range(&self, ctx: &VaContext, range: Arc<VaRange>) -> Result<()> {
        debug_assert!(range.contains(self.start) && range.contains(self.end()));
        self.with_retry(ctx, |state, retry| {
            state.range = range.clone();
            state.apply_policy(ctx, retry)
        })
    }

    fn check_span(&self, addr: VirtAddr, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let last = addr.raw().checked_add(len as u64 - 1).ok_or(Error::InvalidAddress)?;
        if !self.contains(addr) || last > self.end().raw() {
            return Err(Error::InvalidAddress);
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes at `addr` out of the block, waiting for the
    /// copies to finish
    pub fn read_to_cpu(&self, ctx: &VaContext, addr: VirtAddr, buf: &mut [u8]) -> Result<()> {
        self.check_span(addr, buf.len())?;
        let mut state = self.state.lock();
        let mut done = 0;
        while done < buf.len() {
            let va = addr.raw() + done as u64;
            let page = ((va - self.start.raw()) / PAGE_SIZE) as usize;
            let offset = (va % PAGE_SIZE) as usize;
            let len = (PAGE_SIZE as usize - offset).min(buf.len() - done);
            state.read_page(ctx, page, offset, &mut buf[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    /// Copy `data` into the block at `addr`, waiting for the copies to
    /// finish; untouched pages become resident on the CPU first
    pub fn write_from_cpu(&self, ctx: &VaContext, addr: VirtAddr, data: &[u8]) -> Result<()> {
        self.check_span(addr, data.len())?;
        let start = self.start.raw();
        self.with_retry(ctx, |state, retry| {
            let mut done = 0;
            while done < data.len() {
                let va = addr.raw() + done as u64;
                let page = ((va - start) / PAGE_SIZE) as usize;
                let offset = (va % PAGE_SIZE) as usize;
                let len = (PAGE_SIZE as usize - offset).min(data.len() - done);
                state.write_page(ctx, retry, page, offset, &data[done..done + len])?;
                done += len;
            }
            state.update_masks(ctx);
            Ok(())
        })
    }

    /// Give back the chunks of `gpu` inside the root chunk at `root`,
    /// moving their data to the CPU
    ///
    /// Returns whether the block held any such chunk.
    pub(crate) fn evict(&self, ctx: &VaContext, gpu: GpuId, root: PhysAddr) -> Result<bool> {
        let processor = ProcessorId::from_gpu(gpu);
        self.with_retry(ctx, |state, retry| {
            let Some(gpu_state) = state.gpu(gpu) else {
                return Ok(false);
            };
            let mut pages = PageMask::new();
            let mut slots = alloc::vec::Vec::new();
            for (index, entry) in gpu_state.layout.entries().iter().enumerate() {
                if gpu_state.chunks[index].as_ref().is_some_and(|c| c.root_addr() == root) {
                    pages.region_fill(entry.region);
                    slots.push(index);
                }
            }
            if slots.is_empty() {
                return Ok(false);
            }

            let resident = pages & state.resident_mask(processor);
            state.make_resident(ctx, retry, ProcessorId::CPU, &resident, MakeResidentCause::Eviction, ResidencyMode::Move)?;
            for other in state.processors().iter() {
                if let Some(procs) = state.procs_mut(other) {
                    procs.unmap(&pages);
                }
            }
            state.update_masks(ctx);
            state.sync_mappings(ctx, retry, &ShapeLimits::default())?;
            state.wait_tracker(ctx)?;

            let va_gpu = ctx.gpu_any(gpu).cloned();
            if let Some(gpu_state) = state.gpu_mut(gpu) {
                for index in slots {
                    let Some(chunk) = gpu_state.chunks[index].take() else {
                        continue;
                    };
                    match &va_gpu {
                        Some(va_gpu) => va_gpu.chunks().free(chunk),
                        None => log::error!("leaking {:?}: GPU is gone", chunk),
                    }
                }
            }
            state.notify_runs(ctx, &pages, |addr, bytes| ToolsEvent::Eviction { gpu, addr, bytes });
            state.update_masks(ctx);
            log::debug!("{:?}: evicted {} pages from {:?}", state.start, pages.weight(), gpu);
            Ok(true)
        })
    }

    /// Unmap everything and free all backing memory
    pub(crate) fn destroy(&self, ctx: &VaContext) {
        let mut state = self.state.lock();
        for processor in state.processors().iter() {
            if let Some(procs) = state.procs_mut(processor) {
                procs.pte_bits = Default::default();
            }
        }
        let mut retry = VaBlockRetry::new();
        if let Err(err) = state.sync_mappings(ctx, &mut retry, &ShapeLimits::default()) {
            log::warn!("{:?}: unmapping on destroy failed: {}", state.start, err);
        }
        retry.release(ctx);
        if let Err(err) = state.wait_tracker(ctx) {
            log::warn!("{:?}: pending copies failed on destroy: {}", state.start, err);
        }

        for page in state.cpu.pages.iter_mut() {
            if let Some(page) = page.take() {
                ctx.sysmem().free_page(page);
            }
        }
        for (index, slot) in state.gpus.iter_mut().enumerate() {
            let Some(gpu_state) = slot.as_deref_mut() else {
                continue;
            };
            gpu_state.ptes.release_all();
            let gpu = ctx.gpu_any(GpuId::new(index as u8));
            for chunk in gpu_state.chunks.iter_mut().filter_map(Option::take) {
                match gpu {
                    Some(gpu) => gpu.chunks().free(chunk),
                    None => log::error!("leaking {:?}: GPU is gone", chunk),
                }
            }
            gpu_state.procs = Default::default();
            gpu_state.swizzled = PageMask::new();
        }
        state.cpu.procs = Default::default();
        state.read_duplicated = PageMask::new();
        state.perf_notify(ctx, &PerfEvent::BlockDestroy);
        state.update_masks(ctx);
        log::trace!("{:?}: destroyed", state.start);
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Pages resident on `processor`
    pub fn resident_mask(&self, processor: ProcessorId) -> PageMask {
        self.state.lock().resident_mask(processor)
    }

    /// Pages `processor` maps
    pub fn mapped_mask(&self, processor: ProcessorId) -> PageMask {
        self.state
            .lock()
            .procs(processor)
            .map_or(PageMask::new(), |p| *p.mapped())
    }

    /// Processors holding a copy of `page`
    pub fn resident_processors(&self, page: PageIndex) -> ProcessorMask {
        self.state.lock().resident_processors(page)
    }

    /// Processors with any resident page
    pub fn resident_set(&self) -> ProcessorMask {
        self.state.lock().resident
    }

    /// Processors with any mapped page
    pub fn mapped_set(&self) -> ProcessorMask {
        self.state.lock().mapped
    }

    /// Protection `processor` has on `page`
    pub fn prot(&self, processor: ProcessorId, page: PageIndex) -> Prot {
        self.state.lock().prot(processor, page)
    }

    /// Pages with copies on several processors
    pub fn read_duplicated(&self) -> PageMask {
        self.state.lock().read_duplicated
    }

    /// Memory holding `processor`'s copy of `page`, if it is resident there
    pub fn backing(&self, processor: ProcessorId, page: PageIndex) -> Option<MemAddr> {
        let state = self.state.lock();
        if !state.resident_mask(processor).test(page) {
            return None;
        }
        state.mem_addr(processor, page)
    }

    /// Page-table shape of `gpu`
    pub fn pte_info(&self, gpu: GpuId) -> Option<GpuPteInfo> {
        let state = self.state.lock();
        let gpu_state = state.gpu(gpu)?;
        let mut info = GpuPteInfo {
            is_2m: gpu_state.ptes.is_2m(),
            swizzled: gpu_state.swizzled,
            ..GpuPteInfo::default()
        };
        for page in 0..state.pages() {
            match gpu_state.ptes.effective(page, &gpu_state.big) {
                Some((_, _, PageSize::Big)) => info.big_leaves.set(page),
                Some((_, _, PageSize::Size4K)) => info.small_leaves.set(page),
                _ => {}
            }
        }
        Some(info)
    }

    /// Translation `gpu`'s page tables hold for `page`
    pub fn gpu_translation(&self, gpu: GpuId, page: PageIndex) -> Option<(MemAddr, Prot, PageSize)> {
        let state = self.state.lock();
        let gpu_state = state.gpu(gpu)?;
        if page >= state.pages() {
            return None;
        }
        gpu_state.ptes.effective(page, &gpu_state.big)
    }

    /// Translation the CPU page tables hold for `page`
    pub fn cpu_translation(&self, page: PageIndex) -> Option<(MemAddr, Prot)> {
        self.state.lock().cpu.shadow.get(page).copied().flatten()
    }

    /// Pages the thrashing detector currently flags
    pub fn thrashing_pages(&self) -> PageMask {
        let state = self.state.lock();
        let mut pages = PageMask::new();
        if let Some(thrashing) = state.perf.thrashing() {
            for page in 0..state.pages() {
                pages.assign(page, thrashing.is_thrashing(page));
            }
        }
        pages
    }

    /// Check every consistency rule of the block
    pub fn verify(&self, ctx: &VaContext) -> Violations {
        self.state.lock().verify(ctx)
    }
}

impl fmt::Debug for VaBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaBlock")
            .field("start", &self.start)
            .field("end", &self.end())
            .finish_non_exhaustive()
    }
}
