//! # Performance Events
//!
//! Block-level events fanned out to performance heuristics.
//!
//! ```text
//!   VaBlock ──PerfEvent──▶ PerfBus ──┬──▶ ThrashingDetector (per-block data)
//!                                    └──▶ PerfListener ... (stats, tools)
//! ```
//!
//! Events are dispatched synchronously under the block lock. Per-block data
//! of the heuristics lives in the block's [`BlockPerf`] and is dropped with
//! it.

pub mod thrashing;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use uvm_core::{
    AccessType, EventSink, MakeResidentCause, PageIndex, PageMask, ProcessorId, ProcessorMask, Prot,
    ThrashingConfig, Topology, VirtAddr,
};

pub use thrashing::{BlockThrashing, PackedStamp, PageFlags, ThrashingDetector, ThrashingHint};

// =============================================================================
// EVENTS
// =============================================================================

/// Event raised by a VA block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerfEvent {
    /// The block is going away
    BlockDestroy,
    /// The block lost its upper part to a split
    BlockShrink,
    /// Pages were copied to `dst`
    Migration {
        /// Destination
        dst: ProcessorId,
        /// Source
        src: ProcessorId,
        /// Pages copied
        pages: PageMask,
        /// Why
        cause: MakeResidentCause,
    },
    /// Permissions were lowered on `processor`
    Revocation {
        /// Processor losing access
        processor: ProcessorId,
        /// Pages affected
        pages: PageMask,
        /// Protection left in place
        new_prot: Prot,
    },
    /// A fault was serviced
    Fault {
        /// Faulting processor
        processor: ProcessorId,
        /// Page
        page: PageIndex,
        /// Access type
        access: AccessType,
    },
}

/// Where an event happened
#[derive(Clone, Copy)]
pub struct PerfCtx<'a> {
    /// First address of the block
    pub block_start: VirtAddr,
    /// Pages in the block
    pub pages: usize,
    /// Current time
    pub now_ns: u64,
    /// System topology
    pub topology: &'a Topology,
    /// Tools sink
    pub events: &'a dyn EventSink,
}

impl PerfCtx<'_> {
    /// Address of a page
    #[inline]
    pub fn page_addr(&self, page: PageIndex) -> VirtAddr {
        self.block_start.offset(page as u64 * uvm_core::PAGE_SIZE)
    }
}

impl fmt::Debug for PerfCtx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerfCtx")
            .field("block_start", &self.block_start)
            .field("pages", &self.pages)
            .field("now_ns", &self.now_ns)
            .finish_non_exhaustive()
    }
}

/// Observer of block events
pub trait PerfListener: Send + Sync {
    /// Called for every event, under the block lock
    fn on_event(&self, block_start: VirtAddr, event: &PerfEvent);
}

/// Per-block data of the performance heuristics
#[derive(Debug, Default)]
pub struct BlockPerf {
    pub(crate) thrashing: Option<Box<BlockThrashing>>,
}

impl BlockPerf {
    /// Thrashing state, if any page ever saw an event
    pub fn thrashing(&self) -> Option<&BlockThrashing> {
        self.thrashing.as_deref()
    }
}

// =============================================================================
// BUS
// =============================================================================

/// Dispatcher owned by the VA space
pub struct PerfBus {
    thrashing: Option<ThrashingDetector>,
    listeners: Vec<Arc<dyn PerfListener>>,
}

impl PerfBus {
    /// Bus with the thrashing detector configured by `config`
    pub fn new(config: &ThrashingConfig) -> Self {
        Self {
            thrashing: config.enable.then(|| ThrashingDetector::new(*config)),
            listeners: Vec::new(),
        }
    }

    /// Register a listener
    pub fn add_listener(&mut self, listener: Arc<dyn PerfListener>) {
        self.listeners.push(listener);
    }

    /// Thrashing detector, when enabled
    #[inline]
    pub fn thrashing(&self) -> Option<&ThrashingDetector> {
        self.thrashing.as_ref()
    }

    /// Dispatch an event
    pub fn notify(&self, data: &mut BlockPerf, ctx: &PerfCtx<'_>, event: &PerfEvent) {
        if let Some(detector) = &self.thrashing {
            match event {
                PerfEvent::BlockDestroy | PerfEvent::BlockShrink => detector.destroy(data),
                PerfEvent::Migration {
                    dst, src, pages, cause, ..
                } if *cause != MakeResidentCause::Eviction => {
                    detector.on_event(data, ctx, pages, ProcessorMask::single(*dst).with(*src), false);
                }
                PerfEvent::Revocation { processor, pages, .. } => {
                    detector.on_event(data, ctx, pages, ProcessorMask::single(*processor), true);
                }
                _ => {}
            }
        }
        for listener in &self.listeners {
            listener.on_event(ctx.block_start, event);
        }
    }

    /// Thrashing hint for `requester` faulting on `page`
    pub fn thrashing_hint(
        &self,
        data: &mut BlockPerf,
        ctx: &PerfCtx<'_>,
        page: PageIndex,
        requester: ProcessorId,
        residents: ProcessorMask,
        preferred: Option<ProcessorId>,
    ) -> ThrashingHint {
        match &self.thrashing {
            Some(detector) => detector.get_hint(data, ctx, page, requester, residents, preferred),
            None => ThrashingHint::None,
        }
    }
}

impl fmt::Debug for PerfBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerfBus")
            .field("thrashing", &self.thrashing)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
