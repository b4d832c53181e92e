//! # System Topology
//!
//! Interconnect table between processors and the proximity order derived
//! from it.
//!
//! ## Proximity
//!
//! For a requester `R`, the memory of processor `P` ranks:
//!
//! ```text
//! rank 0  Local          P == R
//! rank 1  NvLink peer    fast interconnect, native atomics
//! rank 2  PCIe peer      peer-to-peer over PCIe
//! rank 3  System memory  P is the CPU
//! rank 4  Inaccessible   R cannot map P's memory
//! ```
//!
//! Ties are broken by ascending processor id, so the order is total and the
//! mapping and migration paths always agree on "closest".

use alloc::vec;
use alloc::vec::Vec;

use crate::processor::{ProcessorId, ProcessorMask, MAX_PROCESSORS};

// =============================================================================
// LINK KIND
// =============================================================================

/// Interconnect between an accessor and the memory it maps
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkKind {
    /// Same processor
    Local,
    /// NvLink-class fast interconnect
    NvLink,
    /// PCIe
    Pcie,
    /// No access path
    None,
}

impl LinkKind {
    /// Is this a fast (local or NvLink) path?
    #[inline]
    pub const fn is_fast(self) -> bool {
        matches!(self, Self::Local | Self::NvLink)
    }
}

/// Rank of inaccessible memory
pub const RANK_INACCESSIBLE: u8 = 4;

// =============================================================================
// TOPOLOGY
// =============================================================================

/// Interconnect table for one VA space
///
/// Entry `(a, b)` describes how processor `a` reaches the memory of `b`.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Number of processors (CPU + GPUs)
    count: usize,
    /// Row-major `count * count` link table
    links: Vec<LinkKind>,
    /// Pairs with native atomics beyond the default (local and NvLink)
    native_atomics: Vec<bool>,
}

impl Topology {
    /// Topology of the CPU and `gpus` GPUs without peer links
    ///
    /// Every GPU reaches sysmem over PCIe; the CPU cannot map vidmem.
    pub fn new(gpus: usize) -> Self {
        let count = (gpus + 1).min(MAX_PROCESSORS);
        let mut links = vec![LinkKind::None; count * count];
        for i in 0..count {
            links[i * count + i] = LinkKind::Local;
            if i != 0 {
                links[i * count] = LinkKind::Pcie;
            }
        }
        Self {
            count,
            links,
            native_atomics: vec![false; count * count],
        }
    }

    /// Number of processors described
    #[inline]
    pub fn processor_count(&self) -> usize {
        self.count
    }

    /// Every processor described by the table
    pub fn processors(&self) -> ProcessorMask {
        (0..self.count).map(ProcessorId::from_index).collect()
    }

    #[inline]
    fn slot(&self, a: ProcessorId, b: ProcessorId) -> Option<usize> {
        if a.index() < self.count && b.index() < self.count {
            Some(a.index() * self.count + b.index())
        } else {
            None
        }
    }

    /// Connect two GPUs (symmetric)
    pub fn set_peer(&mut self, a: ProcessorId, b: ProcessorId, link: LinkKind) {
        debug_assert!(!a.is_cpu() && !b.is_cpu() && a != b);
        if let (Some(ab), Some(ba)) = (self.slot(a, b), self.slot(b, a)) {
            self.links[ab] = link;
            self.links[ba] = link;
        }
    }

    /// Set how a GPU reaches system memory
    pub fn set_sysmem_link(&mut self, gpu: ProcessorId, link: LinkKind) {
        if let Some(slot) = self.slot(gpu, ProcessorId::CPU) {
            self.links[slot] = link;
        }
    }

    /// Allow the CPU to map a GPU's memory (coherent platforms)
    pub fn set_cpu_access(&mut self, gpu: ProcessorId, link: LinkKind) {
        if let Some(slot) = self.slot(ProcessorId::CPU, gpu) {
            self.links[slot] = link;
        }
    }

    /// Grant native atomics for `accessor` on `owner`'s memory
    pub fn set_native_atomics(&mut self, accessor: ProcessorId, owner: ProcessorId) {
        if let Some(slot) = self.slot(accessor, owner) {
            self.native_atomics[slot] = true;
        }
    }

    /// How `accessor` reaches `owner`'s memory
    #[inline]
    pub fn link(&self, accessor: ProcessorId, owner: ProcessorId) -> LinkKind {
        self.slot(accessor, owner)
            .map_or(LinkKind::None, |slot| self.links[slot])
    }

    /// Can `accessor` map `owner`'s memory?
    #[inline]
    pub fn can_access(&self, accessor: ProcessorId, owner: ProcessorId) -> bool {
        self.link(accessor, owner) != LinkKind::None
    }

    /// Processors that can map `owner`'s memory
    pub fn accessible_from(&self, owner: ProcessorId) -> ProcessorMask {
        self.processors()
            .iter()
            .filter(|p| self.can_access(*p, owner))
            .collect()
    }

    /// Does `accessor` have native atomics on `owner`'s memory?
    pub fn native_atomics(&self, accessor: ProcessorId, owner: ProcessorId) -> bool {
        match self.link(accessor, owner) {
            LinkKind::Local | LinkKind::NvLink => true,
            LinkKind::None => false,
            LinkKind::Pcie => self
                .slot(accessor, owner)
                .is_some_and(|slot| self.native_atomics[slot]),
        }
    }

    /// Processors with native atomics on `owner`'s memory
    pub fn native_atomics_mask(&self, owner: ProcessorId) -> ProcessorMask {
        self.processors()
            .iter()
            .filter(|p| self.native_atomics(*p, owner))
            .collect()
    }

    /// Do both processors reach each other's memory over a fast path?
    #[inline]
    pub fn fast_interconnect(&self, a: ProcessorId, b: ProcessorId) -> bool {
        self.link(a, b).is_fast() && self.link(b, a).is_fast()
    }

    /// Can a copy engine move data between the two memories without staging
    /// through system memory?
    pub fn can_copy_direct(&self, a: ProcessorId, b: ProcessorId) -> bool {
        a == b
            || a.is_cpu()
            || b.is_cpu()
            || self.can_access(a, b)
            || self.can_access(b, a)
    }

    /// Proximity rank of `owner`'s memory as seen from `requester`
    pub fn rank(&self, requester: ProcessorId, owner: ProcessorId) -> u8 {
        if requester == owner {
            return 0;
        }
        match self.link(requester, owner) {
            LinkKind::None => RANK_INACCESSIBLE,
            _ if owner.is_cpu() => 3,
            LinkKind::Local | LinkKind::NvLink => 1,
            LinkKind::Pcie => 2,
        }
    }

    /// Closest accessible processor of `candidates` as seen from `requester`
    pub fn closest_in(&self, requester: ProcessorId, candidates: ProcessorMask) -> Option<ProcessorId> {
        candidates
            .iter()
            .map(|p| (self.rank(requester, p), p))
            .filter(|(rank, _)| *rank < RANK_INACCESSIBLE)
            .min()
            .map(|(_, p)| p)
    }

    /// Closest processor of `candidates`, accessible or not
    ///
    /// Used by copy planning, which can stage through the CPU.
    pub fn closest_any(&self, requester: ProcessorId, candidates: ProcessorMask) -> Option<ProcessorId> {
        candidates
            .iter()
            .map(|p| (self.rank(requester, p), p))
            .min()
            .map(|(_, p)| p)
    }
}
