//! # UVM Command Submission
//!
//! Copy-engine pushes and completion tracking for page migration.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                      Migration Copy Pipeline                      │
//! │                                                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐    │
//! │  │  VA block    │    │    Push      │    │  Copy engine     │    │
//! │  │  (copy runs, │───▶│ (copies,     │───▶│  channel (FIFO)  │    │
//! │  │   zeroing)   │    │  memsets)    │    │                  │    │
//! │  └──────▲───────┘    └──────────────┘    └────────┬─────────┘    │
//! │         │                                         │              │
//! │         │            ┌──────────────┐             │              │
//! │         └────────────│   Tracker    │◀── FenceToken              │
//! │                      └──────────────┘                            │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering
//!
//! 1. A push waits on the tracker of the block it serves
//! 2. Within a push, each copy reads its whole source before writing
//! 3. Completion callbacks run after the push's data has landed
//! 4. The block adds the returned token to its tracker

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod memory;
pub mod push;
pub mod soft_engine;
pub mod tracker;

// Re-exports
pub use memory::{swizzled_offset, CpuAccess, PhysMemory, POISON};
pub use push::{ChannelType, CompletionFn, CopyAddr, CopyEngine, Push, PushOp};
pub use soft_engine::{ChannelState, EngineStats, ExecMode, SoftCopyEngine};
pub use tracker::{ChannelId, FenceSource, FenceToken, Tracker};
