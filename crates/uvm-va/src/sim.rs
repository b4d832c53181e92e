//! # Host Simulation
//!
//! Wires a [`VaSpace`] to the software collaborators: buddy chunk pools,
//! host page trees, copy engines over one shared physical memory, a sysmem
//! page pool, a recording CPU MMU, an event ring and a manual clock.
//!
//! ```text
//!   SimBuilder ──build()──▶ SimSystem
//!                            ├── space: Arc<VaSpace>
//!                            ├── gpus[n]: SoftChunkPool, SoftPageTree, SoftCopyEngine
//!                            ├── memory: PhysMemory (all apertures)
//!                            ├── sysmem, cpu, events, clock
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;

use uvm_cmd::{ExecMode, PhysMemory, SoftCopyEngine};
use uvm_core::{
    Error, EventRing, GpuId, LinkKind, ManualClock, PhysAddr, ProcessorId, Result, Topology, UvmConfig,
};
use uvm_mem::{ChunkSizes, PageSizes, SoftChunkPool, SoftPageTree, SoftSysmemPool};

use crate::context::VaContext;
use crate::cpu::RecordingCpuMappings;
use crate::gpu::{GpuCaps, VaGpu};
use crate::va_space::VaSpace;

/// Shape of one simulated GPU
#[derive(Debug, Clone, Copy)]
pub struct SimGpuSpec {
    /// Page-table capabilities
    pub caps: GpuCaps,
    /// Root (2M) chunks of memory, page tables included
    pub roots: usize,
    /// Chunk sizes of the pool
    pub chunk_sizes: ChunkSizes,
}

impl SimGpuSpec {
    /// 64K big pages, every leaf size, no swizzling
    pub fn new(roots: usize) -> Self {
        Self {
            caps: GpuCaps {
                big_page_size: 64 * 1024,
                page_sizes: PageSizes::all(),
                swizzling: false,
            },
            roots,
            chunk_sizes: ChunkSizes::DEFAULT,
        }
    }

    /// Same GPU with swizzled big pages
    pub fn swizzling(mut self) -> Self {
        self.caps.swizzling = true;
        self
    }
}

/// Builder of a [`SimSystem`]
#[derive(Debug, Clone)]
pub struct SimBuilder {
    config: UvmConfig,
    gpus: Vec<SimGpuSpec>,
    peers: Vec<(usize, usize, LinkKind)>,
    cpu_access: Vec<(usize, LinkKind)>,
    native_atomics: Vec<(ProcessorId, ProcessorId)>,
    sysmem_pages: usize,
    exec_mode: ExecMode,
    event_capacity: usize,
    start_ns: u64,
}

impl Default for SimBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBuilder {
    /// No GPUs, 4096 sysmem pages, immediate copies
    pub fn new() -> Self {
        Self {
            config: UvmConfig::default(),
            gpus: Vec::new(),
            peers: Vec::new(),
            cpu_access: Vec::new(),
            native_atomics: Vec::new(),
            sysmem_pages: 4096,
            exec_mode: ExecMode::Immediate,
            event_capacity: 4096,
            start_ns: 1_000_000_000,
        }
    }

    /// Use `config`
    pub fn config(mut self, config: UvmConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a GPU; GPU ids follow the order of the calls
    pub fn gpu(mut self, spec: SimGpuSpec) -> Self {
        self.gpus.push(spec);
        self
    }

    /// Link GPUs `a` and `b`
    pub fn peer(mut self, a: usize, b: usize, link: LinkKind) -> Self {
        self.peers.push((a, b, link));
        self
    }

    /// Let the CPU map the memory of GPU `gpu`
    pub fn cpu_access(mut self, gpu: usize, link: LinkKind) -> Self {
        self.cpu_access.push((gpu, link));
        self
    }

    /// Native atomics for `accessor` on `owner`'s memory
    pub fn native_atomics(mut self, accessor: ProcessorId, owner: ProcessorId) -> Self {
        self.native_atomics.push((accessor, owner));
        self
    }

    /// Capacity of the sysmem pool in pages
    pub fn sysmem_pages(mut self, pages: usize) -> Self {
        self.sysmem_pages = pages;
        self
    }

    /// When copies execute
    pub fn exec_mode(mut self, mode: ExecMode) -> Self {
        self.exec_mode = mode;
        self
    }

    /// Build the system
    pub fn build(self) -> Result<SimSystem> {
        let mut topology = Topology::new(self.gpus.len());
        for &(a, b, link) in &self.peers {
            if a >= self.gpus.len() || b >= self.gpus.len() || a == b {
                return Err(Error::InvalidParameter);
            }
            topology.set_peer(gpu_processor(a), gpu_processor(b), link);
        }
        for &(gpu, link) in &self.cpu_access {
            topology.set_cpu_access(gpu_processor(gpu), link);
        }
        for &(accessor, owner) in &self.native_atomics {
            topology.set_native_atomics(accessor, owner);
        }

        let memory = Arc::new(PhysMemory::new());
        let sysmem = Arc::new(SoftSysmemPool::new(PhysAddr::new(0), self.sysmem_pages));
        let cpu = Arc::new(RecordingCpuMappings::new());
        let events = Arc::new(EventRing::new(self.event_capacity));
        let clock = Arc::new(ManualClock::new(self.start_ns));
        let mut ctx = VaContext::new(
            self.config,
            topology,
            sysmem.clone(),
            memory.clone(),
            cpu.clone(),
            events.clone(),
            clock.clone(),
        );

        let mut gpus = Vec::with_capacity(self.gpus.len());
        for (index, spec) in self.gpus.iter().enumerate() {
            let id = GpuId::new(index as u8);
            let pool = Arc::new(SoftChunkPool::new(id, PhysAddr::new(0), spec.roots, spec.chunk_sizes));
            let tree = Arc::new(SoftPageTree::new(pool.clone(), spec.caps.big_page_size, spec.caps.page_sizes));
            let engine = Arc::new(SoftCopyEngine::new(id, memory.clone(), self.exec_mode));
            ctx.add_gpu(Arc::new(VaGpu::new(spec.caps, pool.clone(), tree.clone(), engine.clone())))?;
            gpus.push(SimGpu {
                id,
                pool,
                tree,
                engine,
            });
        }

        Ok(SimSystem {
            space: VaSpace::new(ctx),
            gpus,
            memory,
            sysmem,
            cpu,
            events,
            clock,
        })
    }
}

#[inline]
fn gpu_processor(index: usize) -> ProcessorId {
    ProcessorId::from_gpu(GpuId::new(index as u8))
}

/// Software collaborators of one GPU
#[derive(Debug)]
pub struct SimGpu {
    /// GPU id
    pub id: GpuId,
    /// Chunk allocator
    pub pool: Arc<SoftChunkPool>,
    /// Page tables
    pub tree: Arc<SoftPageTree>,
    /// Copy engine
    pub engine: Arc<SoftCopyEngine>,
}

impl SimGpu {
    /// Processor id of the GPU
    #[inline]
    pub fn processor(&self) -> ProcessorId {
        ProcessorId::from_gpu(self.id)
    }
}

/// A VA space running on software collaborators
#[derive(Debug)]
pub struct SimSystem {
    /// The address space
    pub space: Arc<VaSpace>,
    /// GPUs, by id
    pub gpus: Vec<SimGpu>,
    /// Physical memory of every aperture
    pub memory: Arc<PhysMemory>,
    /// System page pool
    pub sysmem: Arc<SoftSysmemPool>,
    /// CPU page tables
    pub cpu: Arc<RecordingCpuMappings>,
    /// Tools events
    pub events: Arc<EventRing>,
    /// Time source
    pub clock: Arc<ManualClock>,
}

impl SimSystem {
    /// GPU `index`
    ///
    /// Panics if there is no such GPU.
    pub fn gpu(&self, index: usize) -> &SimGpu {
        &self.gpus[index]
    }

    /// Leaf transitions that skipped a TLB invalidate, over all GPUs
    pub fn coherence_violations(&self) -> u64 {
        self.gpus.iter().map(|g| g.tree.coherence_violations()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_registers_gpus() {
        let sim = SimBuilder::new()
            .gpu(SimGpuSpec::new(4))
            .gpu(SimGpuSpec::new(4).swizzling())
            .peer(0, 1, LinkKind::NvLink)
            .build()
            .unwrap();
        let ctx = sim.space.context();
        assert_eq!(ctx.gpu_ids().count(), 2);
        assert!(ctx.gpu(GpuId::new(1)).unwrap().caps().swizzling);
        assert!(ctx
            .topology()
            .native_atomics(sim.gpu(0).processor(), sim.gpu(1).processor()));
        assert!(sim.space.status().is_ok());
    }

    #[test]
    fn test_bad_peer_is_rejected() {
        let err = SimBuilder::new().gpu(SimGpuSpec::new(1)).peer(0, 3, LinkKind::Pcie).build().unwrap_err();
        assert_eq!(err, Error::InvalidParameter);
    }
}
