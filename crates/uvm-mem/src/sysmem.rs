//! # System Memory Pages
//!
//! CPU pages backing the CPU-resident part of a VA block, one 4K page each.

use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;
use uvm_core::{Aperture, Error, MemAddr, PhysAddr, Result, PAGE_SIZE};

/// Exclusive handle to one system page
#[derive(PartialEq, Eq)]
pub struct CpuPage {
    addr: PhysAddr,
}

impl CpuPage {
    /// Physical address
    #[inline]
    pub const fn addr(&self) -> PhysAddr {
        self.addr
    }

    /// Aperture-qualified address of the byte at `offset`
    #[inline]
    pub const fn mem_addr(&self, offset: u64) -> MemAddr {
        MemAddr::new(Aperture::Sysmem, self.addr.offset(offset))
    }
}

impl fmt::Debug for CpuPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuPage(0x{:x})", self.addr.raw())
    }
}

/// Source of system pages
pub trait SysmemAllocator: Send + Sync {
    /// Allocate one page; contents are undefined
    fn alloc_page(&self) -> Result<CpuPage>;

    /// Return a page
    fn free_page(&self, page: CpuPage);
}

#[derive(Debug)]
struct SysmemState {
    next: u64,
    free: Vec<u64>,
    in_use: usize,
}

/// Bounded page pool over a physical window of system memory
#[derive(Debug)]
pub struct SoftSysmemPool {
    base: PhysAddr,
    capacity: usize,
    state: Mutex<SysmemState>,
}

impl SoftSysmemPool {
    /// Pool of `capacity` pages starting at `base`
    pub fn new(base: PhysAddr, capacity: usize) -> Self {
        Self {
            base,
            capacity,
            state: Mutex::new(SysmemState {
                next: 0,
                free: Vec::new(),
                in_use: 0,
            }),
        }
    }

    /// Pages currently handed out
    pub fn pages_in_use(&self) -> usize {
        self.state.lock().in_use
    }
}

impl SysmemAllocator for SoftSysmemPool {
    fn alloc_page(&self) -> Result<CpuPage> {
        let mut state = self.state.lock();
        if state.in_use >= self.capacity {
            return Err(Error::OutOfMemory);
        }
        let index = match state.free.pop() {
            Some(index) => index,
            None => {
                state.next += 1;
                state.next - 1
            }
        };
        state.in_use += 1;
        Ok(CpuPage {
            addr: self.base.offset(index * PAGE_SIZE),
        })
    }

    fn free_page(&self, page: CpuPage) {
        let mut state = self.state.lock();
        state.free.push((page.addr.raw() - self.base.raw()) / PAGE_SIZE);
        state.in_use -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysmem_pool_capacity() {
        let pool = SoftSysmemPool::new(PhysAddr::new(0x1000_0000), 2);
        let a = pool.alloc_page().unwrap();
        let b = pool.alloc_page().unwrap();
        assert_eq!(b.addr(), PhysAddr::new(0x1000_1000));
        assert_eq!(pool.alloc_page(), Err(Error::OutOfMemory));

        pool.free_page(a);
        let c = pool.alloc_page().unwrap();
        assert_eq!(c.addr(), PhysAddr::new(0x1000_0000));
        assert_eq!(pool.pages_in_use(), 2);
        assert_eq!(c.mem_addr(8).aperture, Aperture::Sysmem);
    }
}
