//! Fault servicing within one block.
//!
//! For every faulting page: consult the thrashing detector, pick where the
//! data should live, make it resident there, grant the requester a
//! protection (speculatively more than it asked for when that costs no
//! revocation), resolve atomics conflicts and map the `accessed_by`
//! processors. One mapping sync finishes the batch.

use alloc::vec::Vec;

use uvm_core::{
    AccessType, MakeResidentCause, PageIndex, PageMask, ProcessorId, ProcessorMask, Prot, PteBit, Result, Topology,
};

use super::migrate::ResidencyMode;
use super::pte::ShapeLimits;
use super::retry::VaBlockRetry;
use super::state::BlockState;
use crate::context::VaContext;
use crate::perf::{PerfEvent, ThrashingHint};
use crate::range::VaPolicy;

/// Outcome of servicing a set of faults on one block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceResult {
    /// Pages now mapped for the requested access
    pub serviced: PageMask,
    /// Pages left alone because the requester is throttled, with the time
    /// the throttling ends
    pub throttled: Vec<(PageIndex, u64)>,
    /// Pages whose access the range policy forbids
    pub denied: PageMask,
}

impl BlockState {
    /// Service `faults` taken by `requester`
    pub(crate) fn service_faults(
        &mut self,
        ctx: &VaContext,
        retry: &mut VaBlockRetry,
        requester: ProcessorId,
        faults: &[(PageIndex, AccessType)],
        cause: MakeResidentCause,
    ) -> Result<ServiceResult> {
        let policy = *self.range.policy();
        let topology = ctx.topology();
        if let Some(id) = requester.gpu() {
            let gpu = ctx.gpu(id)?.clone();
            self.gpu_or_init(&gpu);
        }

        let mut result = ServiceResult::default();
        let mut plan: Vec<(PageIndex, AccessType)> = Vec::new();
        let mut groups: Vec<(ProcessorId, ResidencyMode, PageMask)> = Vec::new();
        for &(page, access) in faults {
            if access.required_prot() > policy.max_prot {
                log::debug!("{:?}: {:?} denied on page {} by policy", requester, access, page);
                result.denied.set(page);
                continue;
            }
            let residents = self.resident_processors(page);
            let perf_ctx = self.perf_ctx(ctx);
            let hint = ctx.perf().thrashing_hint(
                &mut self.perf,
                &perf_ctx,
                page,
                requester,
                residents,
                policy.preferred_location,
            );
            let pinned = match hint {
                ThrashingHint::Throttle { end_ns } => {
                    result.throttled.push((page, end_ns));
                    continue;
                }
                ThrashingHint::Pin { residency } => Some(residency),
                ThrashingHint::None => None,
            };

            let dst = fault_destination(topology, &policy, requester, access, residents, pinned);
            let mode = if policy.read_duplication && !access.is_write() && dst == requester && pinned.is_none() {
                ResidencyMode::Duplicate
            } else {
                ResidencyMode::Move
            };
            match groups.iter_mut().find(|(d, m, _)| *d == dst && *m == mode) {
                Some((.., pages)) => pages.set(page),
                None => groups.push((dst, mode, PageMask::from_page(page))),
            }
            plan.push((page, access));
        }

        // Back every destination before anything changes
        for (dst, _, pages) in &groups {
            self.populate(ctx, retry, *dst, pages)?;
        }
        for (dst, mode, pages) in &groups {
            self.make_resident(ctx, retry, *dst, pages, cause, *mode)?;
        }

        for &(page, access) in &plan {
            let Some(owner) = self.mapping_target(topology, requester, page) else {
                log::warn!("{:?}: page {} has no copy {:?} can map", self.start, page, requester);
                continue;
            };
            let prot = self.fault_prot(topology, &policy, requester, page, access, owner);
            self.resolve_conflicts(ctx, requester, page, prot, owner);
            if let Some(procs) = self.procs_mut(requester) {
                if prot > procs.prot(page) {
                    procs.set_prot(page, prot);
                }
            }
            result.serviced.set(page);
            self.perf_notify(
                ctx,
                &PerfEvent::Fault {
                    processor: requester,
                    page,
                    access,
                },
            );
        }

        self.map_accessed_by(ctx, &result.serviced, ProcessorMask::single(requester))?;
        self.update_masks(ctx);
        self.sync_mappings(ctx, retry, &ShapeLimits::default())?;
        self.update_masks(ctx);
        Ok(result)
    }

    /// Protection granted for a serviced fault
    fn fault_prot(
        &self,
        topology: &Topology,
        policy: &VaPolicy,
        requester: ProcessorId,
        page: PageIndex,
        access: AccessType,
        owner: ProcessorId,
    ) -> Prot {
        let speculative = if self.resident_processors(page).weight() > 1 {
            Prot::ReadOnly
        } else if policy.read_duplication && !access.is_write() {
            // Keep the page ready for duplication
            Prot::ReadOnly
        } else {
            self.speculative_prot(topology, requester, page, owner)
        };
        let mut prot = speculative.max(access.required_prot()).min(policy.max_prot);
        if prot == Prot::ReadWriteAtomic && (requester.is_cpu() || !topology.native_atomics(requester, owner)) {
            prot = Prot::ReadWrite;
        }
        prot
    }

    /// Strongest protection `processor` can get on `page` without revoking
    /// anything from anyone else
    ///
    /// The CPU page tables have no atomic level.
    pub(crate) fn speculative_prot(
        &self,
        topology: &Topology,
        processor: ProcessorId,
        page: PageIndex,
        owner: ProcessorId,
    ) -> Prot {
        let native = topology.native_atomics(processor, owner);
        let others = self.processors().without(processor);
        let other_atomic = others.iter().any(|q| self.prot(q, page) == Prot::ReadWriteAtomic);
        let racing_writer = others
            .iter()
            .any(|q| self.prot(q, page).is_writable() && !topology.native_atomics(q, owner));
        if native && !racing_writer && !processor.is_cpu() {
            Prot::ReadWriteAtomic
        } else if native || !other_atomic {
            Prot::ReadWrite
        } else {
            Prot::ReadOnly
        }
    }

    /// Atomics of one processor cannot coexist with writes of a processor
    /// that lacks native atomics on the same memory
    fn resolve_conflicts(&mut self, ctx: &VaContext, requester: ProcessorId, page: PageIndex, prot: Prot, owner: ProcessorId) {
        let topology = ctx.topology();
        let others = self.processors().without(requester);
        let pages = PageMask::from_page(page);
        if prot == Prot::ReadWriteAtomic {
            let racing: ProcessorMask = others
                .iter()
                .filter(|q| self.prot(*q, page).is_writable() && !topology.native_atomics(*q, owner))
                .collect();
            self.revoke(ctx, racing, &pages, PteBit::Write);
        } else if prot.is_writable() && !topology.native_atomics(requester, owner) {
            let atomic: ProcessorMask = others
                .iter()
                .filter(|q| self.prot(*q, page) == Prot::ReadWriteAtomic)
                .collect();
            self.revoke(ctx, atomic, &pages, PteBit::Atomic);
        }
    }

    /// Give the range's `accessed_by` processors mappings to `pages`
    pub(crate) fn map_accessed_by(&mut self, ctx: &VaContext, pages: &PageMask, except: ProcessorMask) -> Result<()> {
        let policy = *self.range.policy();
        let topology = ctx.topology();
        for processor in policy.accessed_by.andnot(except).iter() {
            if let Some(id) = processor.gpu() {
                let Ok(gpu) = ctx.gpu(id) else {
                    continue;
                };
                let gpu = gpu.clone();
                self.gpu_or_init(&gpu);
            }
            for page in pages.iter() {
                if self.prot(processor, page) != Prot::None {
                    continue;
                }
                let Some(owner) = self.mapping_target(topology, processor, page) else {
                    continue;
                };
                let prot = if self.resident_processors(page).weight() > 1 || policy.read_duplication {
                    Prot::ReadOnly
                } else {
                    self.speculative_prot(topology, processor, page, owner)
                }
                .min(policy.max_prot);
                if let Some(procs) = self.procs_mut(processor) {
                    procs.set_prot(page, prot);
                }
            }
        }
        Ok(())
    }
}

/// Where the data of a faulting page should live
fn fault_destination(
    topology: &Topology,
    policy: &VaPolicy,
    requester: ProcessorId,
    access: AccessType,
    residents: ProcessorMask,
    pinned: Option<ProcessorId>,
) -> ProcessorId {
    if requester.is_cpu() {
        return pinned
            .filter(|p| topology.can_access(requester, *p))
            .unwrap_or(requester);
    }
    let usable = |p: ProcessorId| {
        topology.can_access(requester, p) && (access != AccessType::Atomic || topology.native_atomics(requester, p))
    };
    if policy.is_uvm_lite(requester) {
        if let Some(preferred) = policy.preferred_location.filter(|p| topology.can_access(requester, *p)) {
            return preferred;
        }
    }
    if let Some(pin) = pinned {
        return if usable(pin) { pin } else { requester };
    }
    if let Some(preferred) = policy.preferred_location.filter(|p| usable(*p)) {
        return preferred;
    }
    if access == AccessType::Atomic && residents.weight() == 1 {
        if let Some(resident) = residents.first().filter(|r| topology.native_atomics(requester, *r)) {
            return resident;
        }
    }
    requester
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvm_core::{GpuId, LinkKind};

    fn gpu(n: u8) -> ProcessorId {
        ProcessorId::from_gpu(GpuId::new(n))
    }

    fn topology() -> Topology {
        let mut topology = Topology::new(2);
        topology.set_peer(gpu(0), gpu(1), LinkKind::NvLink);
        topology
    }

    #[test]
    fn test_cpu_faults_stay_on_cpu() {
        let topology = topology();
        let policy = VaPolicy {
            preferred_location: Some(gpu(0)),
            ..VaPolicy::default()
        };
        let dst = fault_destination(
            &topology,
            &policy,
            ProcessorId::CPU,
            AccessType::Write,
            ProcessorMask::single(gpu(0)),
            None,
        );
        assert_eq!(dst, ProcessorId::CPU);
    }

    #[test]
    fn test_gpu_fault_destination_order() {
        let topology = topology();
        let residents = ProcessorMask::single(gpu(0));
        let mut policy = VaPolicy::default();
        assert_eq!(
            fault_destination(&topology, &policy, gpu(1), AccessType::Read, residents, None),
            gpu(1)
        );
        // Atomics stay on a natively reachable single copy
        assert_eq!(
            fault_destination(&topology, &policy, gpu(1), AccessType::Atomic, residents, None),
            gpu(0)
        );
        assert_eq!(
            fault_destination(&topology, &policy, gpu(1), AccessType::Read, residents, Some(gpu(0))),
            gpu(0)
        );
        policy.preferred_location = Some(ProcessorId::CPU);
        assert_eq!(
            fault_destination(&topology, &policy, gpu(1), AccessType::Write, residents, None),
            ProcessorId::CPU
        );
        // System memory has no native atomics over PCIe
        assert_eq!(
            fault_destination(&topology, &policy, gpu(1), AccessType::Atomic, residents, None),
            gpu(0)
        );
    }
}
