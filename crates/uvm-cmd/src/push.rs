//! # Copy-Engine Pushes
//!
//! A push is a batch of copy and memset operations submitted to one channel
//! of a GPU's copy engine. It may wait on earlier work, and carries callbacks
//! that run once it completes.
//!
//! ```text
//!   begin_push(channel, wait_on)
//!        │
//!        ├── memcopy(dst, src, size)
//!        ├── memset(dst, value, size)
//!        ├── on_complete(callback)
//!        ▼
//!   end_push ──▶ FenceToken
//! ```

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use uvm_core::{GpuId, MemAddr, Result};

use crate::tracker::{FenceToken, Tracker};

// =============================================================================
// CHANNEL TYPES
// =============================================================================

/// Direction class of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum ChannelType {
    /// System memory to video memory
    CpuToGpu = 0,
    /// Video memory to system memory
    GpuToCpu = 1,
    /// Within one GPU's memory
    GpuInternal = 2,
    /// Between GPUs
    GpuToGpu = 3,
    /// Memsets and semaphore work
    Memops = 4,
}

impl ChannelType {
    /// Number of channel types
    pub const COUNT: usize = 5;

    /// All channel types, by index
    pub const ALL: [ChannelType; Self::COUNT] = [
        Self::CpuToGpu,
        Self::GpuToCpu,
        Self::GpuInternal,
        Self::GpuToGpu,
        Self::Memops,
    ];

    /// Channel index
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// One side of a copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyAddr {
    /// Address of the first byte in linear layout
    pub mem: MemAddr,
    /// Big page size if the memory is in swizzled layout
    pub swizzled: Option<u64>,
}

impl CopyAddr {
    /// Linear address
    #[inline]
    pub const fn linear(mem: MemAddr) -> Self {
        Self { mem, swizzled: None }
    }

    /// Address inside swizzled big pages of `big_page_size`
    #[inline]
    pub const fn swizzled(mem: MemAddr, big_page_size: u64) -> Self {
        Self {
            mem,
            swizzled: Some(big_page_size),
        }
    }
}

/// Operation recorded in a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOp {
    /// Copy `size` bytes; the whole source is read before the destination
    /// is written
    Copy {
        /// Destination
        dst: CopyAddr,
        /// Source
        src: CopyAddr,
        /// Bytes
        size: u64,
    },
    /// Fill `size` bytes with `value`
    Memset {
        /// Destination
        dst: CopyAddr,
        /// Fill byte
        value: u8,
        /// Bytes
        size: u64,
    },
}

/// Callback run when a push completes
pub type CompletionFn = Box<dyn FnOnce() + Send>;

// =============================================================================
// PUSH
// =============================================================================

/// Batch of copy-engine work under construction
pub struct Push {
    gpu: GpuId,
    channel: ChannelType,
    description: String,
    wait_on: Tracker,
    ops: Vec<PushOp>,
    on_complete: Vec<CompletionFn>,
}

impl Push {
    /// Start a push; used by copy-engine implementations
    pub fn new(gpu: GpuId, channel: ChannelType, wait_on: &Tracker, description: &str) -> Self {
        Self {
            gpu,
            channel,
            description: String::from(description),
            wait_on: wait_on.clone(),
            ops: Vec::new(),
            on_complete: Vec::new(),
        }
    }

    /// GPU executing the push
    #[inline]
    pub fn gpu(&self) -> GpuId {
        self.gpu
    }

    /// Channel type
    #[inline]
    pub fn channel(&self) -> ChannelType {
        self.channel
    }

    /// Human-readable purpose
    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Work this push waits for
    #[inline]
    pub fn wait_on(&self) -> &Tracker {
        &self.wait_on
    }

    /// Add a dependency
    pub fn acquire(&mut self, tracker: &Tracker) {
        self.wait_on.merge(tracker);
    }

    /// Recorded operations
    #[inline]
    pub fn ops(&self) -> &[PushOp] {
        &self.ops
    }

    /// Copy `size` bytes from `src` to `dst`
    pub fn memcopy(&mut self, dst: CopyAddr, src: CopyAddr, size: u64) {
        if size > 0 {
            self.ops.push(PushOp::Copy { dst, src, size });
        }
    }

    /// Fill `size` bytes at `dst`
    pub fn memset(&mut self, dst: CopyAddr, value: u8, size: u64) {
        if size > 0 {
            self.ops.push(PushOp::Memset { dst, value, size });
        }
    }

    /// Run `f` once the push has completed
    pub fn on_complete(&mut self, f: impl FnOnce() + Send + 'static) {
        self.on_complete.push(Box::new(f));
    }

    /// Split into parts; used by copy-engine implementations
    pub fn into_parts(self) -> (Tracker, Vec<PushOp>, Vec<CompletionFn>) {
        (self.wait_on, self.ops, self.on_complete)
    }
}

impl fmt::Debug for Push {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Push")
            .field("gpu", &self.gpu)
            .field("channel", &self.channel)
            .field("description", &self.description)
            .field("ops", &self.ops.len())
            .field("callbacks", &self.on_complete.len())
            .finish()
    }
}

// =============================================================================
// COPY ENGINE
// =============================================================================

/// Copy engine of one GPU
pub trait CopyEngine: Send + Sync {
    /// GPU owning the engine
    fn gpu(&self) -> GpuId;

    /// Start a push on `channel` that runs after `wait_on`
    fn begin_push(&self, channel: ChannelType, wait_on: &Tracker, description: &str) -> Result<Push>;

    /// Submit a push
    fn end_push(&self, push: Push) -> Result<FenceToken>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvm_core::{Aperture, PhysAddr};

    #[test]
    fn test_push_records_ops() {
        let mut push = Push::new(GpuId::new(0), ChannelType::GpuToCpu, &Tracker::new(), "evict");
        let dst = CopyAddr::linear(MemAddr::new(Aperture::Sysmem, PhysAddr::new(0)));
        let src = CopyAddr::swizzled(MemAddr::new(Aperture::Vidmem(GpuId::new(0)), PhysAddr::new(0)), 64 * 1024);
        push.memcopy(dst, src, 4096);
        push.memset(dst, 0, 0);
        push.on_complete(|| {});

        assert_eq!(push.ops().len(), 1);
        assert_eq!(push.description(), "evict");
        let (_, ops, callbacks) = push.into_parts();
        assert_eq!(ops.len(), 1);
        assert_eq!(callbacks.len(), 1);
    }
}
