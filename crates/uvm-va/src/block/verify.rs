//! Consistency checks over a block's state.
//!
//! Run after every successful block operation in debug builds and with the
//! `verify` feature; also reachable through [`super::VaBlock::verify`].

use core::fmt;

use arrayvec::ArrayVec;
use uvm_core::{PageIndex, PageMask, ProcessorId, ProcessorMask, Prot, PteBit};

use super::state::BlockState;
use crate::context::VaContext;

/// One broken invariant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvariantViolation {
    /// Block page, or 0 for block-wide rules
    pub page: PageIndex,
    /// Processor whose state is wrong, if only one is
    pub processor: Option<ProcessorId>,
    /// Rule that does not hold
    pub what: &'static str,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.processor {
            Some(processor) => write!(f, "page {} on {:?}: {}", self.page, processor, self.what),
            None => write!(f, "page {}: {}", self.page, self.what),
        }
    }
}

/// First violations found; collection stops once full
pub type Violations = ArrayVec<InvariantViolation, 16>;

struct Report(Violations);

impl Report {
    fn push(&mut self, page: PageIndex, processor: Option<ProcessorId>, what: &'static str) {
        let _ = self.0.try_push(InvariantViolation { page, processor, what });
    }

    fn full(&self) -> bool {
        self.0.is_full()
    }
}

impl BlockState {
    pub(crate) fn verify(&self, ctx: &VaContext) -> Violations {
        let topology = ctx.topology();
        let mut report = Report(Violations::new());

        let mut resident = ProcessorMask::empty();
        let mut mapped = ProcessorMask::empty();
        for processor in self.processors().iter() {
            if let Some(procs) = self.procs(processor) {
                resident.assign(processor, !procs.resident.is_empty());
                mapped.assign(processor, !procs.mapped().is_empty());
            }
        }
        if resident != self.resident {
            report.push(0, None, "resident processor mask is stale");
        }
        if mapped != self.mapped {
            report.push(0, None, "mapped processor mask is stale");
        }

        let mut duplicated = PageMask::new();
        for page in self.region().iter() {
            if report.full() {
                return report.0;
            }
            let residents = self.resident_processors(page);
            duplicated.assign(page, residents.weight() >= 2);

            let mut writers = 0;
            for processor in self.processors().iter() {
                let Some(procs) = self.procs(processor) else {
                    continue;
                };
                let bits = PteBit::ALL.map(|bit| procs.pte_bits[bit.index()].test(page));
                if (bits[2] && !bits[1]) || (bits[1] && !bits[0]) {
                    report.push(page, Some(processor), "permission bits are not nested");
                }
                let prot = procs.prot(page);
                if prot.is_writable() {
                    writers += 1;
                }
                if prot == Prot::None {
                    continue;
                }
                let Some(owner) = self.mapping_target(topology, processor, page) else {
                    report.push(page, Some(processor), "mapped without a reachable copy");
                    continue;
                };
                if prot == Prot::ReadWriteAtomic && (processor.is_cpu() || !topology.native_atomics(processor, owner)) {
                    report.push(page, Some(processor), "atomic mapping without native atomics");
                }
            }
            if writers > 0 && residents.weight() != 1 {
                report.push(page, None, "writable page without exactly one copy");
            }
            for processor in residents.iter() {
                if self.mem_addr(processor, page).is_none() {
                    report.push(page, Some(processor), "resident without backing memory");
                }
            }
        }
        if duplicated != self.read_duplicated {
            let stale = duplicated.andnot(&self.read_duplicated) | self.read_duplicated.andnot(&duplicated);
            let first = stale.iter().next().unwrap_or(0);
            report.push(first, None, "read-duplicated mask is stale");
        }

        // Page tables against the logical state
        for processor in self.processors().iter() {
            let desired = self.desired_mappings(topology, processor);
            match processor.gpu() {
                None => {
                    for (page, map) in desired.iter().enumerate() {
                        if self.cpu.shadow[page] != map.map(|m| (m.target, m.prot)) {
                            report.push(page, Some(processor), "CPU page table differs");
                        }
                    }
                }
                Some(id) => {
                    if ctx.gpu_any(id).map_or(true, |g| g.is_fatal()) {
                        continue;
                    }
                    let Some(gpu) = self.gpu(id) else {
                        continue;
                    };
                    if !gpu.swizzled.andnot(&gpu.procs.resident).is_empty() {
                        report.push(0, Some(processor), "swizzled pages that are not resident");
                    }
                    for (page, map) in desired.iter().enumerate() {
                        let actual = gpu.ptes.effective(page, &gpu.big).map(|(target, prot, _)| (target, prot));
                        if actual != map.map(|m| (m.target, m.prot)) {
                            report.push(page, Some(processor), "GPU page table differs");
                        }
                    }
                }
            }
        }
        report.0
    }
}

impl fmt::Debug for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Report").field(&self.0.len()).finish()
    }
}
