//! # Thrashing Detection
//!
//! Tracks pages that keep bouncing between processors and tells the fault
//! servicer how to break the cycle.
//!
//! ## Per-page state machine
//!
//! ```text
//!             event within lapse            events >= threshold
//!   quiet ───────────────────────▶ counting ─────────────────────▶ thrashing
//!     ▲                               │                              │
//!     └──────── event after lapse ────┴──────────────────────────────┘
//! ```
//!
//! While a page is thrashing, [`ThrashingDetector::get_hint`] answers with
//! `None`, `Throttle` or `Pin`. The detector only affects performance:
//! ignoring every hint must still give correct results.
//!
//! ## Packed timestamp
//!
//! The last event time and the page flags share one word:
//!
//! ```text
//!   63      58 57                                        0
//!   ┌────────┬────────────────────────────────────────────┐
//!   │ flags  │            time (ns, 58 bits)              │
//!   └────────┴────────────────────────────────────────────┘
//! ```

use alloc::boxed::Box;
use alloc::vec::Vec;

use uvm_core::{
    PageIndex, PageMask, ProcessorId, ProcessorMask, ThrashingConfig, ToolsEvent,
};

use super::{BlockPerf, PerfCtx};

// =============================================================================
// PACKED STAMP
// =============================================================================

/// Width of the timestamp field
pub const TIME_BITS: u32 = 58;
/// Width of the flags field
pub const FLAG_BITS: u32 = u64::BITS - TIME_BITS;
const TIME_MASK: u64 = (1 << TIME_BITS) - 1;

bitflags::bitflags! {
    /// Per-page thrashing flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: u8 {
        /// Page is flagged as thrashing
        const THRASHING = 1 << 0;
        /// Page is pinned to one processor
        const PINNED = 1 << 1;
        /// Counted events include migrations
        const MIGRATION = 1 << 2;
        /// Counted events include revocations
        const REVOCATION = 1 << 3;
    }
}

static_assertions::const_assert!((PageFlags::all().bits() as u64) < (1 << FLAG_BITS));
static_assertions::assert_eq_size!(PackedStamp, u64);

/// Last event time and flags of one page, packed in a word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackedStamp(u64);

impl PackedStamp {
    /// Pack a time and flags; the time is truncated to 58 bits
    #[inline]
    pub const fn new(time_ns: u64, flags: PageFlags) -> Self {
        Self((time_ns & TIME_MASK) | ((flags.bits() as u64) << TIME_BITS))
    }

    /// Time of the last event
    #[inline]
    pub const fn time_ns(self) -> u64 {
        self.0 & TIME_MASK
    }

    /// Flags
    #[inline]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate((self.0 >> TIME_BITS) as u8)
    }

    /// Replace the time, keeping the flags
    #[inline]
    pub fn set_time(&mut self, time_ns: u64) {
        *self = Self::new(time_ns, self.flags());
    }

    /// Replace the flags, keeping the time
    #[inline]
    pub fn set_flags(&mut self, flags: PageFlags) {
        *self = Self::new(self.time_ns(), flags);
    }

    /// Raw word
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct PageThrashing {
    stamp: PackedStamp,
    /// Consecutive events, saturating
    events: u8,
    /// Throttles handed out since the page started thrashing, saturating
    throttles: u8,
    /// Processors involved in the counted events
    processors: ProcessorMask,
    /// Processors currently throttled
    throttled: ProcessorMask,
    pinned_residency: Option<ProcessorId>,
    pin_deadline_ns: u64,
    throttling_end_ns: u64,
}

impl PageThrashing {
    fn flags(&self) -> PageFlags {
        self.stamp.flags()
    }

    fn is_thrashing(&self) -> bool {
        self.flags().contains(PageFlags::THRASHING)
    }
}

/// Thrashing state of one block
#[derive(Debug)]
pub struct BlockThrashing {
    pages: Vec<PageThrashing>,
    thrashing_pages: u32,
    pinned_pages: u32,
    last_thrashing_ns: u64,
    resets: u32,
}

impl BlockThrashing {
    fn new(pages: usize) -> Self {
        Self {
            pages: alloc::vec![PageThrashing::default(); pages],
            thrashing_pages: 0,
            pinned_pages: 0,
            last_thrashing_ns: 0,
            resets: 0,
        }
    }

    /// Pages currently flagged
    #[inline]
    pub fn thrashing_pages(&self) -> u32 {
        self.thrashing_pages
    }

    /// Pages currently pinned
    #[inline]
    pub fn pinned_pages(&self) -> u32 {
        self.pinned_pages
    }

    /// Epoch resets performed
    #[inline]
    pub fn resets(&self) -> u32 {
        self.resets
    }

    /// Is `page` flagged?
    pub fn is_thrashing(&self, page: PageIndex) -> bool {
        self.pages.get(page).is_some_and(PageThrashing::is_thrashing)
    }

    /// Consecutive events counted on `page`
    pub fn events(&self, page: PageIndex) -> u8 {
        self.pages.get(page).map_or(0, |p| p.events)
    }

    /// Packed stamp of `page`
    pub fn stamp(&self, page: PageIndex) -> PackedStamp {
        self.pages.get(page).map_or(PackedStamp::default(), |p| p.stamp)
    }

    fn clear_page(&mut self, page: PageIndex) {
        let info = &mut self.pages[page];
        if info.is_thrashing() {
            self.thrashing_pages -= 1;
        }
        if info.flags().contains(PageFlags::PINNED) {
            self.pinned_pages -= 1;
        }
        *info = PageThrashing::default();
    }

    fn unpin(&mut self, page: PageIndex) {
        let info = &mut self.pages[page];
        if info.flags().contains(PageFlags::PINNED) {
            info.stamp.set_flags(info.flags() - PageFlags::PINNED);
            info.pinned_residency = None;
            self.pinned_pages -= 1;
        }
    }
}

/// Advice for the fault servicer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrashingHint {
    /// Service normally
    None,
    /// Defer the fault until `end_ns`
    Throttle {
        /// End of the back-off
        end_ns: u64,
    },
    /// Keep the page on `residency` and map it remotely
    Pin {
        /// Processor holding the page
        residency: ProcessorId,
    },
}

// =============================================================================
// DETECTOR
// =============================================================================

/// Thrashing detector
#[derive(Debug, Clone)]
pub struct ThrashingDetector {
    config: ThrashingConfig,
}

impl ThrashingDetector {
    /// Detector with the given tunables
    pub fn new(config: ThrashingConfig) -> Self {
        Self { config }
    }

    /// Tunables
    #[inline]
    pub fn config(&self) -> &ThrashingConfig {
        &self.config
    }

    /// Drop a block's state
    pub fn destroy(&self, data: &mut BlockPerf) {
        data.thrashing = None;
    }

    /// Reset a block that has been quiet for an epoch
    fn maybe_reset(&self, block: &mut BlockThrashing, now_ns: u64) {
        if block.thrashing_pages == 0 || block.resets >= self.config.max_resets {
            return;
        }
        if now_ns.saturating_sub(block.last_thrashing_ns) <= self.config.epoch_ns {
            return;
        }
        log::debug!(
            "thrashing reset {} after {} ns quiet",
            block.resets + 1,
            now_ns - block.last_thrashing_ns
        );
        for page in 0..block.pages.len() {
            block.clear_page(page);
        }
        block.resets += 1;
    }

    /// Record migrations or revocations on `pages`
    pub fn on_event(
        &self,
        data: &mut BlockPerf,
        ctx: &PerfCtx<'_>,
        pages: &PageMask,
        processors: ProcessorMask,
        revocation: bool,
    ) {
        let block = data
            .thrashing
            .get_or_insert_with(|| Box::new(BlockThrashing::new(ctx.pages)));
        self.maybe_reset(block, ctx.now_ns);

        let kind = if revocation {
            PageFlags::REVOCATION
        } else {
            PageFlags::MIGRATION
        };
        let count = block.pages.len();
        for page in pages.iter().filter(|p| *p < count) {
            let info = &mut block.pages[page];
            let last = info.stamp.time_ns();
            let consecutive = info.events > 0 && ctx.now_ns.saturating_sub(last) <= self.config.lapse_ns;

            if consecutive {
                info.events = info.events.saturating_add(1);
                info.processors = info.processors.or(processors);
                info.stamp = PackedStamp::new(ctx.now_ns, info.flags() | kind);
            } else {
                block.clear_page(page);
                let info = &mut block.pages[page];
                info.events = 1;
                info.processors = processors;
                info.stamp = PackedStamp::new(ctx.now_ns, kind);
            }

            let info = &mut block.pages[page];
            if info.is_thrashing() {
                block.last_thrashing_ns = ctx.now_ns;
            } else if info.events >= self.config.threshold {
                info.stamp.set_flags(info.flags() | PageFlags::THRASHING);
                block.thrashing_pages += 1;
                block.last_thrashing_ns = ctx.now_ns;
                log::debug!(
                    "page {} thrashing among {:?} after {} events",
                    ctx.page_addr(page),
                    info.processors,
                    info.events
                );
                ctx.events.notify(ToolsEvent::ThrashingDetected {
                    addr: ctx.page_addr(page),
                    processors: info.processors,
                });
            }
        }
    }

    fn pin(&self, block: &mut BlockThrashing, page: PageIndex, residency: ProcessorId, now_ns: u64) -> ThrashingHint {
        let info = &mut block.pages[page];
        if !info.flags().contains(PageFlags::PINNED) {
            block.pinned_pages += 1;
        }
        info.stamp.set_flags(info.flags() | PageFlags::PINNED);
        info.pinned_residency = Some(residency);
        info.pin_deadline_ns = now_ns + self.config.pin_ns;
        info.throttled = ProcessorMask::empty();
        ThrashingHint::Pin { residency }
    }

    fn throttle(&self, block: &mut BlockThrashing, ctx: &PerfCtx<'_>, page: PageIndex, requester: ProcessorId) -> ThrashingHint {
        let info = &mut block.pages[page];
        if info.throttled.test(requester) {
            if ctx.now_ns < info.throttling_end_ns {
                return ThrashingHint::Throttle {
                    end_ns: info.throttling_end_ns,
                };
            }
            info.throttled.clear(requester);
            ctx.events.notify(ToolsEvent::ThrottlingEnd {
                processor: requester,
                addr: ctx.page_addr(page),
            });
            return ThrashingHint::None;
        }
        info.throttled.set(requester);
        info.throttles = info.throttles.saturating_add(1);
        info.throttling_end_ns = ctx.now_ns + self.config.nap_ns;
        ctx.events.notify(ToolsEvent::ThrottlingStart {
            processor: requester,
            addr: ctx.page_addr(page),
        });
        ThrashingHint::Throttle {
            end_ns: info.throttling_end_ns,
        }
    }

    /// Hint for `requester` faulting on `page`
    ///
    /// `residents` are the processors currently holding the page.
    pub fn get_hint(
        &self,
        data: &mut BlockPerf,
        ctx: &PerfCtx<'_>,
        page: PageIndex,
        requester: ProcessorId,
        residents: ProcessorMask,
        preferred: Option<ProcessorId>,
    ) -> ThrashingHint {
        let Some(block) = data.thrashing.as_deref_mut() else {
            return ThrashingHint::None;
        };
        self.maybe_reset(block, ctx.now_ns);
        let Some(info) = block.pages.get(page) else {
            return ThrashingHint::None;
        };
        if !info.is_thrashing() {
            return ThrashingHint::None;
        }

        if info.flags().contains(PageFlags::PINNED) {
            let live = info.pinned_residency.filter(|_| ctx.now_ns < info.pin_deadline_ns);
            match live {
                Some(residency) => return ThrashingHint::Pin { residency },
                None => block.unpin(page),
            }
        }

        let info = &block.pages[page];
        let topology = ctx.topology;

        // Nothing better to migrate to when only permissions ping-pong
        if !info.flags().contains(PageFlags::MIGRATION) {
            return self.throttle(block, ctx, page, requester);
        }

        if let Some(preferred) = preferred {
            if topology.can_access(requester, preferred) {
                return self.pin(block, page, preferred, ctx.now_ns);
            }
            return self.throttle(block, ctx, page, requester);
        }

        let Some(closest) = topology.closest_any(requester, residents) else {
            return self.throttle(block, ctx, page, requester);
        };
        let accessors = info.processors.with(requester);
        if accessors
            .iter()
            .all(|p| p == closest || topology.fast_interconnect(p, closest))
        {
            return self.pin(block, page, closest, ctx.now_ns);
        }

        if info.throttles >= self.config.pin_threshold {
            let residency = if topology.can_access(requester, closest) {
                closest
            } else {
                requester
            };
            return self.pin(block, page, residency, ctx.now_ns);
        }

        self.throttle(block, ctx, page, requester)
    }
}
