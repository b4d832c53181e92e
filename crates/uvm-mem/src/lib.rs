//! # UVM Memory
//!
//! Physical memory and page-table plumbing underneath the VA block engine.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           uvm-mem                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────┐ │
//! │  │ GPU chunks   │  │ Sysmem pages │  │ Page-table adapter │ │
//! │  │ (allocator,  │  │ (4K, CPU     │  │ (PTE ranges, TLB   │ │
//! │  │  eviction)   │  │  residency)  │  │  batches)          │ │
//! │  └──────┬───────┘  └──────────────┘  └─────────┬──────────┘ │
//! │         │              chunk layout            │            │
//! │         ▼                                      ▼            │
//! │  SoftChunkPool (buddy)               SoftPageTree (host)    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The traits are what the VA layer consumes; the `Soft*` types implement
//! them in host memory so the engine runs without hardware.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod chunk;
pub mod layout;
pub mod page_tree;
pub mod pool;
pub mod soft_tree;
pub mod sysmem;

// Re-exports for convenience
pub use chunk::{ChunkAllocator, ChunkSizes, EvictionHandler, GpuChunk, SplitResult};
pub use layout::{chunk_size_for_page, ChunkLayout, LayoutEntry};
pub use page_tree::{
    Membar, PageSize, PageSizes, PageTree, PteRange, PteStorage, PteValue, TlbBatch, TlbRange,
};
pub use pool::{PoolStats, SoftChunkPool};
pub use soft_tree::{SoftPageTree, TlbInvalidate, Translation};
pub use sysmem::{CpuPage, SoftSysmemPool, SysmemAllocator};
