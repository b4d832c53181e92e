//! # VA Context
//!
//! Everything a VA space shares with its blocks: configuration, topology,
//! the registered GPUs and the host-side collaborators.
//!
//! The context is built once, before the VA space takes ownership of it.
//! GPUs and perf listeners are registered during construction only, so the
//! hot paths read it without locking.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use uvm_cmd::CpuAccess;
use uvm_core::{Clock, Error, EventSink, GpuId, ProcessorId, Result, ToolsEvent, Topology, UvmConfig};
use uvm_mem::SysmemAllocator;

use crate::cpu::CpuMappings;
use crate::gpu::VaGpu;
use crate::perf::{PerfBus, PerfListener};

/// Shared state of a VA space
pub struct VaContext {
    config: UvmConfig,
    topology: Topology,
    gpus: Vec<Option<Arc<VaGpu>>>,
    sysmem: Arc<dyn SysmemAllocator>,
    cpu_access: Arc<dyn CpuAccess>,
    cpu_mappings: Arc<dyn CpuMappings>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    perf: PerfBus,
}

impl VaContext {
    /// Create a context without GPUs
    pub fn new(
        config: UvmConfig,
        topology: Topology,
        sysmem: Arc<dyn SysmemAllocator>,
        cpu_access: Arc<dyn CpuAccess>,
        cpu_mappings: Arc<dyn CpuMappings>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let perf = PerfBus::new(&config.thrashing);
        Self {
            config,
            topology,
            gpus: Vec::new(),
            sysmem,
            cpu_access,
            cpu_mappings,
            events,
            clock,
            perf,
        }
    }

    /// Register a GPU; its id must be part of the topology
    pub fn add_gpu(&mut self, gpu: Arc<VaGpu>) -> Result<()> {
        let index = gpu.id().index();
        if gpu.processor().index() >= self.topology.processor_count() {
            return Err(Error::InvalidParameter);
        }
        if self.gpus.len() <= index {
            self.gpus.resize(index + 1, None);
        }
        if self.gpus[index].is_some() {
            return Err(Error::Busy);
        }
        log::info!("registered {:?} with {:?}", gpu.id(), gpu.caps());
        self.gpus[index] = Some(gpu);
        Ok(())
    }

    /// Register a perf listener
    pub fn add_perf_listener(&mut self, listener: Arc<dyn PerfListener>) {
        self.perf.add_listener(listener);
    }

    /// Configuration
    #[inline]
    pub fn config(&self) -> &UvmConfig {
        &self.config
    }

    /// Topology
    #[inline]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// A registered GPU that is still alive
    pub fn gpu(&self, id: GpuId) -> Result<&Arc<VaGpu>> {
        let gpu = self.gpu_any(id).ok_or(Error::NotFound)?;
        gpu.check()?;
        Ok(gpu)
    }

    /// A registered GPU, fatal or not
    #[inline]
    pub fn gpu_any(&self, id: GpuId) -> Option<&Arc<VaGpu>> {
        self.gpus.get(id.index()).and_then(Option::as_ref)
    }

    /// GPU behind a processor id
    #[inline]
    pub fn gpu_of(&self, processor: ProcessorId) -> Result<&Arc<VaGpu>> {
        processor.gpu().ok_or(Error::InvalidParameter).and_then(|id| self.gpu(id))
    }

    /// Registered GPU ids
    pub fn gpu_ids(&self) -> impl Iterator<Item = GpuId> + '_ {
        self.gpus.iter().flatten().map(|g| g.id())
    }

    /// Registered GPUs
    pub fn gpus(&self) -> impl Iterator<Item = &Arc<VaGpu>> + '_ {
        self.gpus.iter().flatten()
    }

    /// System page allocator
    #[inline]
    pub fn sysmem(&self) -> &dyn SysmemAllocator {
        &*self.sysmem
    }

    /// CPU access to system memory
    #[inline]
    pub fn cpu_access(&self) -> &dyn CpuAccess {
        &*self.cpu_access
    }

    /// CPU page tables
    #[inline]
    pub fn cpu_mappings(&self) -> &dyn CpuMappings {
        &*self.cpu_mappings
    }

    /// Tools sink
    #[inline]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Record a tools event
    #[inline]
    pub fn notify(&self, event: ToolsEvent) {
        self.events.notify(event);
    }

    /// Current time
    #[inline]
    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    /// Perf-event bus
    #[inline]
    pub fn perf(&self) -> &PerfBus {
        &self.perf
    }

    /// Latch `gpu` as fatal and return the status every caller will see
    pub fn mark_fatal(&self, gpu: GpuId) -> Error {
        if let Some(va_gpu) = self.gpu_any(gpu) {
            if va_gpu.set_fatal() {
                log::error!("{:?}: fatal error, device access disabled", gpu);
                self.notify(ToolsEvent::FatalError { gpu });
            }
        }
        Error::GpuFatal(gpu)
    }
}

impl fmt::Debug for VaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaContext")
            .field("config", &self.config)
            .field("topology", &self.topology)
            .field("gpus", &self.gpus)
            .field("perf", &self.perf)
            .finish_non_exhaustive()
    }
}
