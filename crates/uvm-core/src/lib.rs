//! # UVM Core
//!
//! Foundational types shared by every layer of the unified virtual memory
//! residency engine.
//!
//! ## Contents
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          uvm-core                               │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌──────────┐  │
//! │  │   Types    │  │ Page masks │  │  Topology  │  │  Errors  │  │
//! │  │ (VirtAddr, │  │ (per-page  │  │ (proximity,│  │          │  │
//! │  │ Processor) │  │  bitmaps)  │  │  atomics)  │  │          │  │
//! │  └────────────┘  └────────────┘  └────────────┘  └──────────┘  │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐                │
//! │  │ Protection │  │   Tools    │  │   Config   │                │
//! │  │ and access │  │   events   │  │  + clock   │                │
//! │  └────────────┘  └────────────┘  └────────────┘                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything here is allocation-light and `no_std`; the crate only needs
//! `alloc` for the topology tables and the event ring.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod page_mask;
pub mod processor;
pub mod prot;
pub mod topology;
pub mod types;

// Re-exports for convenience
pub use clock::{Clock, ManualClock};
pub use config::{MappingConfig, MigrationConfig, ThrashingConfig, UvmConfig};
pub use error::{Error, Result};
pub use events::{EventRing, EventSink, MakeResidentCause, NullSink, ToolsEvent};
pub use page_mask::{PageIndex, PageMask, PageRegion};
pub use processor::{GpuId, ProcessorId, ProcessorMask};
pub use prot::{AccessType, Prot, PteBit};
pub use topology::{LinkKind, Topology};
pub use types::*;
