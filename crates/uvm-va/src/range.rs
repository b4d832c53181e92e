//! # VA Ranges
//!
//! A managed range of the address space and the policy that applies to it.
//!
//! Ranges are immutable once published: changing the policy of part of a
//! range replaces it with new `Arc<VaRange>`s, and the blocks inside pick up
//! the new range under their own lock.

use uvm_core::{Prot, ProcessorId, ProcessorMask, VirtAddr};

/// Placement and access policy of a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaPolicy {
    /// Where data should live when possible
    pub preferred_location: Option<ProcessorId>,
    /// Processors that get mappings eagerly whenever pages become resident
    pub accessed_by: ProcessorMask,
    /// Allow read-only copies on several processors
    pub read_duplication: bool,
    /// Strongest access the range permits
    pub max_prot: Prot,
    /// GPUs that only ever map the preferred location
    pub uvm_lite: ProcessorMask,
}

impl Default for VaPolicy {
    fn default() -> Self {
        Self {
            preferred_location: None,
            accessed_by: ProcessorMask::empty(),
            read_duplication: false,
            max_prot: Prot::ReadWriteAtomic,
            uvm_lite: ProcessorMask::empty(),
        }
    }
}

impl VaPolicy {
    /// Is `processor` a UVM-Lite participant with a preferred location?
    #[inline]
    pub fn is_uvm_lite(&self, processor: ProcessorId) -> bool {
        self.preferred_location.is_some() && self.uvm_lite.test(processor)
    }
}

/// Managed range `[start, end]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaRange {
    start: VirtAddr,
    end: VirtAddr,
    policy: VaPolicy,
}

impl VaRange {
    /// Create a range; `end` is inclusive
    pub fn new(start: VirtAddr, end: VirtAddr, policy: VaPolicy) -> Self {
        debug_assert!(start <= end);
        Self { start, end, policy }
    }

    /// First address
    #[inline]
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// Last address (inclusive)
    #[inline]
    pub fn end(&self) -> VirtAddr {
        self.end
    }

    /// Policy
    #[inline]
    pub fn policy(&self) -> &VaPolicy {
        &self.policy
    }

    /// Does the range contain `addr`?
    #[inline]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr <= self.end
    }

    /// Same policy over a sub-range
    pub fn slice(&self, start: VirtAddr, end: VirtAddr) -> Self {
        debug_assert!(self.contains(start) && self.contains(end));
        Self::new(start, end, self.policy)
    }

    /// Same bounds, different policy
    pub fn with_policy(&self, policy: VaPolicy) -> Self {
        Self::new(self.start, self.end, policy)
    }
}
