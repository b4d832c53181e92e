//! # Tools Events
//!
//! Notifications emitted for the tools/telemetry layer.
//!
//! The sink is fire-and-forget: recording an event must never block the
//! caller. [`EventRing`] drops the event and bumps a counter when it is full
//! or contended.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::processor::{GpuId, ProcessorId, ProcessorMask};
use crate::prot::{AccessType, Prot};
use crate::types::VirtAddr;

// =============================================================================
// EVENTS
// =============================================================================

/// Why pages were made resident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MakeResidentCause {
    /// CPU page fault
    CpuFault,
    /// GPU replayable fault
    GpuFault,
    /// Explicit migration request
    Migrate,
    /// Eviction of GPU memory
    Eviction,
    /// Staging for a direct CPU read/write
    CpuAccess,
}

/// Tools event
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ToolsEvent {
    /// A CPU fault was taken
    CpuFault {
        /// Faulting address
        addr: VirtAddr,
        /// Access type
        access: AccessType,
    },
    /// A GPU fault was serviced
    GpuFault {
        /// Faulting GPU
        gpu: GpuId,
        /// Faulting address
        addr: VirtAddr,
        /// Access type
        access: AccessType,
    },
    /// Bytes were copied between processors
    Migration {
        /// Source processor
        src: ProcessorId,
        /// Destination processor
        dst: ProcessorId,
        /// Start of the copied run
        addr: VirtAddr,
        /// Bytes copied
        bytes: u64,
        /// Why the copy happened
        cause: MakeResidentCause,
    },
    /// Pages got an additional read-only copy
    ReadDuplicate {
        /// Processors now holding copies
        processors: ProcessorMask,
        /// Start address
        addr: VirtAddr,
        /// Bytes duplicated
        bytes: u64,
    },
    /// Read duplication was collapsed to a single copy
    ReadDuplicateInvalidate {
        /// Processor keeping the copy
        residency: ProcessorId,
        /// Start address
        addr: VirtAddr,
        /// Bytes affected
        bytes: u64,
    },
    /// Pages were populated without any prior copy
    FirstTouch {
        /// Processor the pages became resident on
        processor: ProcessorId,
        /// Start address
        addr: VirtAddr,
        /// Bytes populated
        bytes: u64,
    },
    /// Permissions were revoked from a processor
    Revocation {
        /// Processor losing access
        processor: ProcessorId,
        /// Start address
        addr: VirtAddr,
        /// Bytes affected
        bytes: u64,
        /// Protection left in place
        new_prot: Prot,
    },
    /// A processor mapped memory resident elsewhere
    MapRemote {
        /// Mapping processor
        processor: ProcessorId,
        /// Processor holding the data
        residency: ProcessorId,
        /// Start address
        addr: VirtAddr,
        /// Bytes mapped
        bytes: u64,
    },
    /// A page was detected as thrashing
    ThrashingDetected {
        /// Page address
        addr: VirtAddr,
        /// Processors involved
        processors: ProcessorMask,
    },
    /// A processor started being throttled on a page
    ThrottlingStart {
        /// Throttled processor
        processor: ProcessorId,
        /// Page address
        addr: VirtAddr,
    },
    /// A processor stopped being throttled on a page
    ThrottlingEnd {
        /// Processor
        processor: ProcessorId,
        /// Page address
        addr: VirtAddr,
    },
    /// GPU memory was evicted to system memory
    Eviction {
        /// GPU losing the memory
        gpu: GpuId,
        /// Start address
        addr: VirtAddr,
        /// Bytes evicted
        bytes: u64,
    },
    /// A GPU entered the fatal state
    FatalError {
        /// Failed GPU
        gpu: GpuId,
    },
}

// =============================================================================
// EVENT SINK
// =============================================================================

/// Receiver of tools events
pub trait EventSink: Send + Sync {
    /// Record an event; must not block
    fn notify(&self, event: ToolsEvent);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn notify(&self, _event: ToolsEvent) {}
}

/// Bounded event queue with a drop counter
#[derive(Debug)]
pub struct EventRing {
    events: Mutex<VecDeque<ToolsEvent>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventRing {
    /// Create a ring holding at most `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Number of events dropped so far
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Is the ring empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every queued event, oldest first
    pub fn drain(&self) -> Vec<ToolsEvent> {
        self.events.lock().drain(..).collect()
    }
}

impl EventSink for EventRing {
    fn notify(&self, event: ToolsEvent) {
        match self.events.try_lock() {
            Some(mut events) if events.len() < self.capacity => events.push_back(event),
            _ => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
