//! # CPU Mappings
//!
//! The CPU side of residency changes. A block installs one mapping per 4K
//! page and tears down runs of pages at once.

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;
use uvm_core::{MemAddr, Prot, VirtAddr, PAGE_SIZE};

/// CPU page-table adapter
pub trait CpuMappings: Send + Sync {
    /// Map one page
    fn map_page(&self, addr: VirtAddr, target: MemAddr, prot: Prot);

    /// Unmap every page in `[start, start + len)`
    fn unmap_range(&self, start: VirtAddr, len: u64);
}

/// CPU mappings kept in a table, for hosts that model the CPU MMU
#[derive(Debug, Default)]
pub struct RecordingCpuMappings {
    pages: Mutex<BTreeMap<u64, (MemAddr, Prot)>>,
    ops: AtomicU64,
}

impl RecordingCpuMappings {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Current mapping of the page holding `addr`
    pub fn lookup(&self, addr: VirtAddr) -> Option<(MemAddr, Prot)> {
        self.pages.lock().get(&addr.align_down(PAGE_SIZE).raw()).copied()
    }

    /// Number of mapped pages
    pub fn mapped_pages(&self) -> usize {
        self.pages.lock().len()
    }

    /// Map and unmap calls so far
    pub fn op_count(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }
}

impl CpuMappings for RecordingCpuMappings {
    fn map_page(&self, addr: VirtAddr, target: MemAddr, prot: Prot) {
        debug_assert!(addr.is_aligned(PAGE_SIZE) && prot != Prot::None);
        self.ops.fetch_add(1, Ordering::Relaxed);
        self.pages.lock().insert(addr.raw(), (target, prot));
    }

    fn unmap_range(&self, start: VirtAddr, len: u64) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut pages = self.pages.lock();
        let keys: alloc::vec::Vec<u64> = pages.range(start.raw()..start.raw() + len).map(|(k, _)| *k).collect();
        for key in keys {
            pages.remove(&key);
        }
    }
}
