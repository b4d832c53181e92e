//! # VA Space
//!
//! Ranges and blocks of one address space, and the entry points that route
//! faults, migrations and CPU accesses to the blocks.
//!
//! ## Locking
//!
//! ```text
//!   layout: RwLock<Layout>        read:  faults, migration, CPU access, eviction
//!      │                          write: range creation/destruction, policy
//!      │                                 changes, block creation and splits
//!      ▼
//!   VaBlock: Mutex<BlockState>    one block at a time, except a freshly split
//!                                 sibling nobody else can see yet
//! ```
//!
//! Eviction is entered from the chunk allocator while the caller holds the
//! layout lock for reading. It takes the layout lock for reading again and
//! gives up with `Busy` if a writer holds it.
//!
//! A GPU going fatal latches the whole space: every later entry point fails
//! with the same `GpuFatal` status.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::RwLock;
use uvm_core::{
    AccessType, Error, GpuId, MakeResidentCause, PageMask, PageRegion, PhysAddr, ProcessorId, Result, ToolsEvent,
    VirtAddr, BLOCK_SIZE_MAX, PAGE_SIZE,
};
use uvm_mem::EvictionHandler;

use crate::block::{InvariantViolation, VaBlock};
use crate::context::VaContext;
use crate::fault::{coalesce, CpuFaultOutcome, FaultBatchResult, GpuFault};
use crate::perf::{PerfEvent, PerfListener};
use crate::range::{VaPolicy, VaRange};

// =============================================================================
// STATISTICS
// =============================================================================

/// Counters of a VA space
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VaSpaceStats {
    /// CPU faults serviced
    pub cpu_faults: u64,
    /// GPU faults serviced, after coalescing
    pub gpu_faults: u64,
    /// Faults deferred by the thrashing detector
    pub throttled: u64,
    /// GPU faults cancelled
    pub cancelled: u64,
    /// Copy runs between processors
    pub migrations: u64,
    /// Bytes copied between processors
    pub bytes_migrated: u64,
    /// Root chunks evicted
    pub evictions: u64,
    /// Blocks split
    pub block_splits: u64,
}

#[derive(Debug, Default)]
struct Counters {
    cpu_faults: AtomicU64,
    gpu_faults: AtomicU64,
    throttled: AtomicU64,
    cancelled: AtomicU64,
    migrations: AtomicU64,
    bytes_migrated: AtomicU64,
    evictions: AtomicU64,
    block_splits: AtomicU64,
}

impl Counters {
    #[inline]
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> VaSpaceStats {
        VaSpaceStats {
            cpu_faults: self.cpu_faults.load(Ordering::Relaxed),
            gpu_faults: self.gpu_faults.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
            bytes_migrated: self.bytes_migrated.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            block_splits: self.block_splits.load(Ordering::Relaxed),
        }
    }
}

impl PerfListener for Counters {
    fn on_event(&self, _block_start: VirtAddr, event: &PerfEvent) {
        if let PerfEvent::Migration { pages, .. } = event {
            Self::add(&self.migrations, 1);
            Self::add(&self.bytes_migrated, pages.weight() as u64 * PAGE_SIZE);
        }
    }
}

// =============================================================================
// LAYOUT
// =============================================================================

/// Ranges and blocks, keyed by start address
#[derive(Debug, Default)]
struct Layout {
    ranges: BTreeMap<u64, Arc<VaRange>>,
    blocks: BTreeMap<u64, Arc<VaBlock>>,
}

impl Layout {
    fn range_at(&self, addr: VirtAddr) -> Option<&Arc<VaRange>> {
        self.ranges
            .range(..=addr.raw())
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(addr))
    }

    fn block_at(&self, addr: VirtAddr) -> Option<&Arc<VaBlock>> {
        self.blocks
            .range(..=addr.raw())
            .next_back()
            .map(|(_, b)| b)
            .filter(|b| b.contains(addr))
    }

    /// Ranges intersecting `[start, end]`
    fn ranges_in(&self, start: VirtAddr, end: VirtAddr) -> Vec<Arc<VaRange>> {
        let first = self.range_at(start).map_or(start.raw(), |r| r.start().raw());
        self.ranges.range(first..=end.raw()).map(|(_, r)| r.clone()).collect()
    }

    /// Blocks intersecting `[start, end]`, in address order
    fn blocks_in(&self, start: VirtAddr, end: VirtAddr) -> Vec<Arc<VaBlock>> {
        let first = self.block_at(start).map_or(start.raw(), |b| b.start().raw());
        self.blocks.range(first..=end.raw()).map(|(_, b)| b.clone()).collect()
    }

    /// Bounds of a new block holding `addr`: the range clipped to the
    /// enclosing 2M region and to the neighbouring blocks
    fn new_block_bounds(&self, range: &VaRange, addr: VirtAddr) -> (VirtAddr, VirtAddr) {
        let region_start = addr.align_down(BLOCK_SIZE_MAX);
        let region_end = region_start.raw() + BLOCK_SIZE_MAX - 1;
        let mut lo = range.start().raw().max(region_start.raw());
        let mut hi = range.end().raw().min(region_end);
        if let Some((_, prev)) = self.blocks.range(..addr.raw()).next_back() {
            lo = lo.max(prev.end().raw() + 1);
        }
        if let Some((start, _)) = self.blocks.range(addr.raw() + 1..).next() {
            hi = hi.min(start - 1);
        }
        (VirtAddr::new(lo), VirtAddr::new(hi))
    }
}

/// Check that `[start, start + len)` is a non-empty page-aligned span
fn page_span(start: VirtAddr, len: u64) -> Result<VirtAddr> {
    if len == 0 || !start.is_aligned(PAGE_SIZE) || len % PAGE_SIZE != 0 {
        return Err(Error::InvalidParameter);
    }
    let end = start.raw().checked_add(len - 1).ok_or(Error::InvalidParameter)?;
    Ok(VirtAddr::new(end))
}

/// Last byte of a non-empty access of `len` bytes at `addr`
fn byte_span(addr: VirtAddr, len: usize) -> Result<VirtAddr> {
    let last = (len as u64)
        .checked_sub(1)
        .and_then(|tail| addr.raw().checked_add(tail))
        .ok_or(Error::InvalidAddress)?;
    Ok(VirtAddr::new(last))
}

/// Pages of `block` inside `[start, end]`
fn block_pages(block: &VaBlock, start: VirtAddr, end: VirtAddr) -> PageMask {
    let lo = start.max(block.start());
    let hi = end.min(block.end());
    let first = ((lo - block.start()) / PAGE_SIZE) as usize;
    let outer = ((hi - block.start()) / PAGE_SIZE) as usize + 1;
    PageMask::from_region(PageRegion::new(first, outer))
}

// =============================================================================
// VA SPACE
// =============================================================================

/// One unified address space
pub struct VaSpace {
    ctx: VaContext,
    layout: RwLock<Layout>,
    /// Index + 1 of the GPU that made the space fatal, 0 while healthy
    fatal: AtomicU32,
    counters: Arc<Counters>,
}

impl VaSpace {
    /// Take ownership of `ctx` and register as the eviction handler of every
    /// GPU in it
    pub fn new(mut ctx: VaContext) -> Arc<Self> {
        let counters = Arc::new(Counters::default());
        ctx.add_perf_listener(counters.clone());
        Arc::new_cyclic(|this: &Weak<VaSpace>| {
            let handler: Weak<dyn EvictionHandler> = this.clone();
            for gpu in ctx.gpus() {
                gpu.chunks().set_eviction_handler(handler.clone());
            }
            log::info!("VA space with {} GPUs", ctx.gpus().count());
            Self {
                ctx,
                layout: RwLock::new(Layout::default()),
                fatal: AtomicU32::new(0),
                counters,
            }
        })
    }

    /// Shared context
    #[inline]
    pub fn context(&self) -> &VaContext {
        &self.ctx
    }

    // -------------------------------------------------------------------------
    // Fatal state
    // -------------------------------------------------------------------------

    /// `Ok` while no GPU of the space has failed
    pub fn status(&self) -> Result<()> {
        match self.fatal.load(Ordering::Acquire) {
            0 => {}
            n => return Err(Error::GpuFatal(GpuId::new((n - 1) as u8))),
        }
        if let Some(gpu) = self.ctx.gpus().find(|g| g.is_fatal()) {
            self.latch(gpu.id());
            return Err(Error::GpuFatal(gpu.id()));
        }
        Ok(())
    }

    fn latch(&self, gpu: GpuId) {
        let value = gpu.index() as u32 + 1;
        if self
            .fatal
            .compare_exchange(0, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log::error!("VA space is fatal after {:?} failed", gpu);
        }
    }

    /// Latch the space on device-fatal errors
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if let Error::GpuFatal(gpu) = err {
                self.latch(*gpu);
            } else if err.is_fatal() {
                let _ = self.status();
            }
        }
        result
    }

    /// Report `gpu` as failed
    pub fn mark_gpu_fatal(&self, gpu: GpuId) -> Error {
        let err = self.ctx.mark_fatal(gpu);
        self.latch(gpu);
        err
    }

    // -------------------------------------------------------------------------
    // Ranges
    // -------------------------------------------------------------------------

    fn check_policy(&self, policy: &VaPolicy) -> Result<()> {
        let known = |p: ProcessorId| p.is_cpu() || p.gpu().is_some_and(|g| self.ctx.gpu_any(g).is_some());
        let preferred_ok = policy.preferred_location.map_or(true, known);
        let accessed_ok = policy.accessed_by.iter().all(known);
        let lite_ok = policy.uvm_lite.iter().all(|p| !p.is_cpu() && known(p));
        if !preferred_ok || !accessed_ok || !lite_ok {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    /// Register the managed range `[start, start + len)`
    pub fn create_range(&self, start: VirtAddr, len: u64, policy: VaPolicy) -> Result<Arc<VaRange>> {
        self.status()?;
        let end = page_span(start, len)?;
        self.check_policy(&policy)?;
        let mut layout = self.layout.write();
        if !layout.ranges_in(start, end).is_empty() {
            return Err(Error::Busy);
        }
        let range = Arc::new(VaRange::new(start, end, policy));
        layout.ranges.insert(start.raw(), range.clone());
        log::debug!("range {:?}..={:?} created", start, end);
        Ok(range)
    }

    /// Remove the range starting at `start`, freeing everything behind it
    pub fn destroy_range(&self, start: VirtAddr) -> Result<()> {
        let mut layout = self.layout.write();
        let range = layout.ranges.remove(&start.raw()).ok_or(Error::NotFound)?;
        for block in layout.blocks_in(range.start(), range.end()) {
            layout.blocks.remove(&block.start().raw());
            block.destroy(&self.ctx);
        }
        log::debug!("range {:?}..={:?} destroyed", range.start(), range.end());
        Ok(())
    }

    /// Apply `policy` to `[start, start + len)`, splitting ranges and blocks
    /// at the edges
    ///
    /// Addresses outside any range are ignored.
    pub fn set_policy(&self, start: VirtAddr, len: u64, policy: VaPolicy) -> Result<()> {
        self.status()?;
        let end = page_span(start, len)?;
        self.check_policy(&policy)?;
        let mut layout = self.layout.write();
        let ranges = layout.ranges_in(start, end);
        if ranges.is_empty() {
            return Err(Error::InvalidAddress);
        }

        for range in ranges {
            let lo = start.max(range.start());
            let hi = end.min(range.end());
            // Blocks first: on failure the ranges are still untouched
            if lo > range.start() {
                self.split_block_locked(&mut layout, VirtAddr::new(lo.raw() - 1), &range)?;
            }
            if hi < range.end() {
                self.split_block_locked(&mut layout, hi, &range)?;
            }

            let mut pieces = Vec::new();
            if lo > range.start() {
                pieces.push(Arc::new(range.slice(range.start(), VirtAddr::new(lo.raw() - 1))));
            }
            pieces.push(Arc::new(VaRange::new(lo, hi, policy)));
            if hi < range.end() {
                pieces.push(Arc::new(range.slice(hi + 1, range.end())));
            }
            layout.ranges.remove(&range.start().raw());
            for piece in &pieces {
                layout.ranges.insert(piece.start().raw(), piece.clone());
            }

            for block in layout.blocks_in(range.start(), range.end()) {
                let Some(piece) = pieces.iter().find(|p| p.contains(block.start())) else {
                    continue;
                };
                self.track(block.set_range(&self.ctx, piece.clone()))?;
            }
        }
        Ok(())
    }

    /// Ranges, in address order
    pub fn ranges(&self) -> Vec<Arc<VaRange>> {
        self.layout.read().ranges.values().cloned().collect()
    }

    /// Range holding `addr`
    pub fn range_at(&self, addr: VirtAddr) -> Option<Arc<VaRange>> {
        self.layout.read().range_at(addr).cloned()
    }

    // -------------------------------------------------------------------------
    // Blocks
    // -------------------------------------------------------------------------

    /// Split the block holding `new_end` so it ends there, if it extends
    /// past it; the upper part keeps `range`
    fn split_block_locked(&self, layout: &mut Layout, new_end: VirtAddr, range: &Arc<VaRange>) -> Result<()> {
        let Some(block) = layout.block_at(new_end).cloned() else {
            return Ok(());
        };
        if block.end() == new_end {
            return Ok(());
        }
        let upper = self.track(block.split(&self.ctx, new_end, range.clone()))?;
        layout.blocks.insert(upper.start().raw(), Arc::new(upper));
        Counters::add(&self.counters.block_splits, 1);
        Ok(())
    }

    /// Split the block holding `addr` so that a new block starts at `addr`
    pub fn split_block_at(&self, addr: VirtAddr) -> Result<()> {
        self.status()?;
        if !addr.is_aligned(PAGE_SIZE) {
            return Err(Error::InvalidParameter);
        }
        let mut layout = self.layout.write();
        let block = layout.block_at(addr).cloned().ok_or(Error::NotFound)?;
        if block.start() == addr {
            return Ok(());
        }
        let range = block.range();
        self.split_block_locked(&mut layout, VirtAddr::new(addr.raw() - 1), &range)
    }

    /// Create the missing blocks of `[start, end]`; every address must be
    /// inside a range
    fn ensure_blocks(&self, start: VirtAddr, end: VirtAddr) -> Result<()> {
        {
            let layout = self.layout.read();
            if Self::covered(&layout, start, end)? {
                return Ok(());
            }
        }
        let mut layout = self.layout.write();
        let mut addr = start;
        loop {
            let block_end = match layout.block_at(addr) {
                Some(block) => block.end(),
                None => {
                    let range = layout.range_at(addr).cloned().ok_or(Error::InvalidAddress)?;
                    let (lo, hi) = layout.new_block_bounds(&range, addr);
                    let block = Arc::new(VaBlock::new(lo, hi, range));
                    log::trace!("block {:?}..={:?} created", lo, hi);
                    layout.blocks.insert(lo.raw(), block);
                    hi
                }
            };
            if block_end >= end {
                return Ok(());
            }
            addr = block_end + 1;
        }
    }

    /// Are all of `[start, end]` backed by blocks? Fails on addresses
    /// outside every range.
    fn covered(layout: &Layout, start: VirtAddr, end: VirtAddr) -> Result<bool> {
        let mut addr = start;
        loop {
            let Some(block) = layout.block_at(addr) else {
                layout.range_at(addr).ok_or(Error::InvalidAddress)?;
                return Ok(false);
            };
            if block.end() >= end {
                return Ok(true);
            }
            addr = block.end() + 1;
        }
    }

    /// Block holding `addr`
    pub fn block_at(&self, addr: VirtAddr) -> Option<Arc<VaBlock>> {
        self.layout.read().block_at(addr).cloned()
    }

    /// Blocks, in address order
    pub fn blocks(&self) -> Vec<Arc<VaBlock>> {
        self.layout.read().blocks.values().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Faults
    // -------------------------------------------------------------------------

    /// Service a CPU fault at `addr`
    ///
    /// Accesses beyond the range's maximum protection fail with
    /// `AccessDenied`; the caller turns that into a signal.
    pub fn cpu_fault(&self, addr: VirtAddr, access: AccessType) -> Result<CpuFaultOutcome> {
        self.status()?;
        self.ctx.notify(ToolsEvent::CpuFault { addr, access });
        self.ensure_blocks(addr, addr)?;

        let layout = self.layout.read();
        let block = layout.block_at(addr).ok_or(Error::InvalidAddress)?;
        let page = block.page_index(addr).ok_or(Error::InvalidAddress)?;
        let result = self.track(block.service_faults(
            &self.ctx,
            ProcessorId::CPU,
            &[(page, access)],
            MakeResidentCause::CpuFault,
        ))?;

        if result.denied.test(page) {
            log::debug!("CPU {:?} at {:?} denied", access, addr);
            return Err(Error::AccessDenied);
        }
        if let Some((_, until_ns)) = result.throttled.first() {
            Counters::add(&self.counters.throttled, 1);
            return Ok(CpuFaultOutcome::Throttled { until_ns: *until_ns });
        }
        Counters::add(&self.counters.cpu_faults, 1);
        Ok(CpuFaultOutcome::Serviced)
    }

    /// Service a batch of GPU faults
    ///
    /// Faults the range forbids, faults outside every range and faults of
    /// unknown GPUs are returned for cancellation; throttled faults stay
    /// outstanding. Device-fatal and allocation errors abort the batch.
    pub fn gpu_faults(&self, faults: &[GpuFault]) -> Result<FaultBatchResult> {
        self.status()?;
        let faults = coalesce(faults);
        let mut result = FaultBatchResult::default();
        for fault in &faults {
            match self.ensure_blocks(fault.addr, fault.addr) {
                Ok(()) | Err(Error::InvalidAddress) => {}
                Err(err) => return Err(err),
            }
        }

        let layout = self.layout.read();
        let mut i = 0;
        while i < faults.len() {
            let fault = faults[i];
            if let Err(err) = self.ctx.gpu(fault.gpu) {
                if err.is_fatal() {
                    return self.track(Err(err));
                }
                result.cancelled.push((fault, err));
                i += 1;
                continue;
            }
            let Some(block) = layout.block_at(fault.addr) else {
                result.cancelled.push((fault, Error::InvalidAddress));
                i += 1;
                continue;
            };

            let group_end = faults[i..]
                .iter()
                .position(|f| f.gpu != fault.gpu || !block.contains(f.addr))
                .map_or(faults.len(), |n| i + n);
            let group = &faults[i..group_end];
            let batch: Vec<_> = group
                .iter()
                .filter_map(|f| block.page_index(f.addr).map(|page| (page, f.access)))
                .collect();
            let serviced = self.track(block.service_faults(
                &self.ctx,
                ProcessorId::from_gpu(fault.gpu),
                &batch,
                MakeResidentCause::GpuFault,
            ))?;

            for (f, (page, _)) in group.iter().zip(&batch) {
                if serviced.denied.test(*page) {
                    result.cancelled.push((*f, Error::AccessDenied));
                } else if let Some((_, until)) = serviced.throttled.iter().find(|(p, _)| p == page) {
                    result.throttled.push((*f, *until));
                } else if serviced.serviced.test(*page) {
                    result.serviced += 1;
                    self.ctx.notify(ToolsEvent::GpuFault {
                        gpu: f.gpu,
                        addr: f.addr,
                        access: f.access,
                    });
                }
            }
            i = group_end;
        }

        Counters::add(&self.counters.gpu_faults, result.serviced as u64);
        Counters::add(&self.counters.throttled, result.throttled.len() as u64);
        Counters::add(&self.counters.cancelled, result.cancelled.len() as u64);
        if !result.cancelled.is_empty() {
            log::debug!("{} GPU faults cancelled", result.cancelled.len());
        }
        Ok(result)
    }

    // -------------------------------------------------------------------------
    // Migration and CPU access
    // -------------------------------------------------------------------------

    /// Make `[start, start + len)` resident on `dst`
    pub fn migrate(&self, start: VirtAddr, len: u64, dst: ProcessorId) -> Result<()> {
        self.status()?;
        let end = page_span(start, len)?;
        if let Some(gpu) = dst.gpu() {
            self.ctx.gpu(gpu)?;
        }
        self.ensure_blocks(start, end)?;
        let layout = self.layout.read();
        for block in layout.blocks_in(start, end) {
            let pages = block_pages(&block, start, end);
            self.track(block.migrate(&self.ctx, dst, &pages, MakeResidentCause::Migrate))?;
        }
        Ok(())
    }

    /// Copy managed memory at `addr` into `buf`
    ///
    /// Pages never populated read as zeros.
    pub fn read(&self, addr: VirtAddr, buf: &mut [u8]) -> Result<()> {
        self.status()?;
        if buf.is_empty() {
            return Ok(());
        }
        let end = byte_span(addr, buf.len())?;
        self.ensure_blocks(addr, end)?;
        let layout = self.layout.read();
        for block in layout.blocks_in(addr, end) {
            let lo = addr.max(block.start());
            let hi = end.min(block.end());
            let from = (lo - addr) as usize;
            let to = (hi - addr) as usize + 1;
            self.track(block.read_to_cpu(&self.ctx, lo, &mut buf[from..to]))?;
        }
        Ok(())
    }

    /// Copy `data` into managed memory at `addr`
    pub fn write(&self, addr: VirtAddr, data: &[u8]) -> Result<()> {
        self.status()?;
        if data.is_empty() {
            return Ok(());
        }
        let end = byte_span(addr, data.len())?;
        self.ensure_blocks(addr, end)?;
        let layout = self.layout.read();
        for block in layout.blocks_in(addr, end) {
            let lo = addr.max(block.start());
            let hi = end.min(block.end());
            let from = (lo - addr) as usize;
            let to = (hi - addr) as usize + 1;
            self.track(block.write_from_cpu(&self.ctx, lo, &data[from..to]))?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Counters
    pub fn stats(&self) -> VaSpaceStats {
        self.counters.snapshot()
    }

    /// Consistency violations of every block
    pub fn verify(&self) -> Vec<(VirtAddr, InvariantViolation)> {
        let layout = self.layout.read();
        layout
            .blocks
            .values()
            .flat_map(|block| {
                let start = block.start();
                block.verify(&self.ctx).into_iter().map(move |v| (start, v))
            })
            .collect()
    }
}

impl EvictionHandler for VaSpace {
    fn evict_root(&self, gpu: GpuId, root: PhysAddr, size: u64) -> Result<()> {
        let Some(layout) = self.layout.try_read() else {
            log::warn!("{:?}: cannot evict 0x{:x} while the VA space is being changed", gpu, root.raw());
            return Err(Error::Busy);
        };
        let mut evicted = false;
        for block in layout.blocks.values() {
            evicted |= self.track(block.evict(&self.ctx, gpu, root))?;
        }
        if evicted {
            Counters::add(&self.counters.evictions, 1);
            log::debug!("{:?}: evicted root 0x{:x} (0x{:x} bytes)", gpu, root.raw(), size);
        }
        Ok(())
    }
}

impl Drop for VaSpace {
    fn drop(&mut self) {
        let layout = self.layout.get_mut();
        for block in layout.blocks.values() {
            block.destroy(&self.ctx);
        }
        layout.blocks.clear();
    }
}

impl fmt::Debug for VaSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layout = self.layout.read();
        f.debug_struct("VaSpace")
            .field("ranges", &layout.ranges.len())
            .field("blocks", &layout.blocks.len())
            .field("fatal", &self.fatal.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_span() {
        assert_eq!(page_span(VirtAddr::new(0x1000), 0x2000), Ok(VirtAddr::new(0x2fff)));
        assert_eq!(page_span(VirtAddr::new(0x1000), 0), Err(Error::InvalidParameter));
        assert_eq!(page_span(VirtAddr::new(0x1001), 0x1000), Err(Error::InvalidParameter));
        assert_eq!(page_span(VirtAddr::new(u64::MAX & !0xfff), 0x2000), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_byte_span() {
        assert_eq!(byte_span(VirtAddr::new(0x1000), 1), Ok(VirtAddr::new(0x1000)));
        assert_eq!(byte_span(VirtAddr::new(0x1ff0), 0x20), Ok(VirtAddr::new(0x200f)));
        assert_eq!(byte_span(VirtAddr::new(0x1000), 0), Err(Error::InvalidAddress));
        assert_eq!(byte_span(VirtAddr::new(u64::MAX - 0xf), 0x10), Ok(VirtAddr::new(u64::MAX)));
        assert_eq!(byte_span(VirtAddr::new(u64::MAX - 0xf), 0x11), Err(Error::InvalidAddress));
    }

    #[test]
    fn test_new_block_bounds_clip_to_region_and_range() {
        let layout = Layout::default();
        let range = VaRange::new(
            VirtAddr::new(0x1f_0000),
            VirtAddr::new(0x40_ffff),
            VaPolicy::default(),
        );
        assert_eq!(
            layout.new_block_bounds(&range, VirtAddr::new(0x1f_8000)),
            (VirtAddr::new(0x1f_0000), VirtAddr::new(0x1f_ffff))
        );
        assert_eq!(
            layout.new_block_bounds(&range, VirtAddr::new(0x30_0000)),
            (VirtAddr::new(0x20_0000), VirtAddr::new(0x3f_ffff))
        );
        assert_eq!(
            layout.new_block_bounds(&range, VirtAddr::new(0x40_0000)),
            (VirtAddr::new(0x40_0000), VirtAddr::new(0x40_ffff))
        );
    }
}
