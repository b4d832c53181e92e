//! # UVM VA
//!
//! Residency and mapping engine of a unified virtual address space shared
//! by a CPU and several GPUs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               VaSpace                                │
//! │   ranges + policy          blocks (≤ 2M each)        fatal latch     │
//! │        │                        │                                    │
//! │        ▼                        ▼                                    │
//! │  ┌──────────┐   hint   ┌──────────────────┐   events   ┌──────────┐  │
//! │  │ Thrashing│◀─────────│  Fault servicer  │───────────▶│ Perf bus │  │
//! │  │ detector │          └────────┬─────────┘            └──────────┘  │
//! │  └──────────┘                   │ make resident                      │
//! │                        ┌────────▼─────────┐                          │
//! │                        │ Migration engine │── copies ──▶ CopyEngine  │
//! │                        └────────┬─────────┘                          │
//! │                                 │ sync mappings                      │
//! │                        ┌────────▼─────────┐                          │
//! │                        │  Mapping engine  │── PTEs, TLB ─▶ PageTree  │
//! │                        └──────────────────┘                          │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locking
//!
//! The VA space lock is taken before any block lock. Blocks never evict
//! while locked: an operation that runs short of memory unwinds, drops the
//! block lock, allocates with eviction and starts over.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod block;
pub mod context;
pub mod cpu;
pub mod fault;
pub mod gpu;
pub mod perf;
pub mod range;
pub mod sim;
pub mod va_space;

// Re-exports for convenience
pub use block::{GpuPteInfo, InvariantViolation, ServiceResult, VaBlock, Violations};
pub use context::VaContext;
pub use cpu::{CpuMappings, RecordingCpuMappings};
pub use fault::{coalesce, CpuFaultOutcome, FaultBatchResult, GpuFault};
pub use gpu::{GpuCaps, VaGpu};
pub use perf::{PerfEvent, PerfListener, ThrashingHint};
pub use range::{VaPolicy, VaRange};
pub use sim::{SimBuilder, SimGpu, SimGpuSpec, SimSystem};
pub use va_space::{VaSpace, VaSpaceStats};
