//! # Fault Batches
//!
//! Fault descriptors as the fault buffer hands them over, and the outcome of
//! servicing them.
//!
//! A GPU batch is sorted by GPU and address, and faults on the same page
//! are folded into one entry with the strongest access. The VA space then
//! walks the sorted batch block by block.

use alloc::vec::Vec;

use uvm_core::{AccessType, Error, GpuId, VirtAddr, PAGE_SIZE};

/// One entry of a GPU fault buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuFault {
    /// Faulting GPU
    pub gpu: GpuId,
    /// Faulting address
    pub addr: VirtAddr,
    /// Access that faulted
    pub access: AccessType,
    /// Instance pointer of the faulting context
    pub instance: u64,
}

impl GpuFault {
    /// Page-aligned faulting address
    #[inline]
    pub fn page_addr(&self) -> VirtAddr {
        self.addr.align_down(PAGE_SIZE)
    }
}

/// What became of a GPU fault batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultBatchResult {
    /// Faults serviced, after coalescing
    pub serviced: usize,
    /// Faults left outstanding for a later pass, with the end of the
    /// throttling period
    pub throttled: Vec<(GpuFault, u64)>,
    /// Faults to cancel, terminating the faulting context
    pub cancelled: Vec<(GpuFault, Error)>,
}

impl FaultBatchResult {
    /// Did every fault get serviced?
    #[inline]
    pub fn all_serviced(&self) -> bool {
        self.throttled.is_empty() && self.cancelled.is_empty()
    }
}

/// Outcome of a CPU fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuFaultOutcome {
    /// The page is mapped; the access can be replayed
    Serviced,
    /// The thread should sleep until `until_ns` and fault again
    Throttled {
        /// End of the throttling period
        until_ns: u64,
    },
}

/// Sort `faults` and fold duplicates per GPU and page
///
/// The surviving entry keeps the strongest access; on a tie the first
/// instance pointer seen wins.
pub fn coalesce(faults: &[GpuFault]) -> Vec<GpuFault> {
    let mut sorted: Vec<GpuFault> = faults
        .iter()
        .map(|f| GpuFault {
            addr: f.page_addr(),
            ..*f
        })
        .collect();
    sorted.sort_by_key(|f| (f.gpu, f.addr));

    let mut out: Vec<GpuFault> = Vec::with_capacity(sorted.len());
    for fault in sorted {
        match out.last_mut() {
            Some(last) if last.gpu == fault.gpu && last.addr == fault.addr => {
                if fault.access > last.access {
                    last.access = fault.access;
                }
            }
            _ => out.push(fault),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault(gpu: u8, addr: u64, access: AccessType, instance: u64) -> GpuFault {
        GpuFault {
            gpu: GpuId::new(gpu),
            addr: VirtAddr::new(addr),
            access,
            instance,
        }
    }

    #[test]
    fn test_coalesce_keeps_strongest_access() {
        let faults = [
            fault(0, 0x2010, AccessType::Read, 1),
            fault(1, 0x1000, AccessType::Read, 2),
            fault(0, 0x2ff8, AccessType::Atomic, 3),
            fault(0, 0x1000, AccessType::Prefetch, 4),
            fault(0, 0x2000, AccessType::Write, 5),
        ];
        let out = coalesce(&faults);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].addr, VirtAddr::new(0x1000));
        assert_eq!(out[0].access, AccessType::Prefetch);
        assert_eq!(out[1].addr, VirtAddr::new(0x2000));
        assert_eq!(out[1].access, AccessType::Atomic);
        assert_eq!(out[1].instance, 1);
        assert_eq!(out[2].gpu, GpuId::new(1));
    }

    #[test]
    fn test_empty_batch() {
        assert!(coalesce(&[]).is_empty());
        assert!(FaultBatchResult::default().all_serviced());
    }
}
