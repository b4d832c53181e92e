//! # Physical Memory
//!
//! Sparse byte store for every aperture, plus the CPU's view of system
//! memory.
//!
//! Pages that were never written read back as [`POISON`], so data that was
//! neither copied nor zeroed shows up in tests.
//!
//! ## Swizzling
//!
//! A GPU may keep big pages of its own memory in a swizzled layout. Within
//! a big page, 4K subpage `i` is stored at subpage `i ^ 1`. The permutation
//! is its own inverse, so converting between layouts is a copy through the
//! same mapping.

use alloc::boxed::Box;

use hashbrown::HashMap;
use spin::Mutex;
use uvm_core::{Aperture, Error, MemAddr, Result, PAGE_SIZE};

/// Fill byte of memory that was never written
pub const POISON: u8 = 0xA5;

/// Offset of the byte holding linear offset `offset` of a swizzled big page
#[inline]
pub const fn swizzled_offset(offset: u64, big_page_size: u64) -> u64 {
    let base = offset & !(big_page_size - 1);
    base | ((offset & (big_page_size - 1)) ^ PAGE_SIZE)
}

// =============================================================================
// CPU ACCESS
// =============================================================================

/// CPU access to system memory
pub trait CpuAccess: Send + Sync {
    /// Read bytes at `addr`
    fn read(&self, addr: MemAddr, buf: &mut [u8]) -> Result<()>;

    /// Write bytes at `addr`
    fn write(&self, addr: MemAddr, data: &[u8]) -> Result<()>;

    /// Zero `len` bytes at `addr`
    fn zero(&self, addr: MemAddr, len: u64) -> Result<()>;
}

// =============================================================================
// PHYSICAL MEMORY
// =============================================================================

type Page = Box<[u8; PAGE_SIZE as usize]>;

/// Backing store shared by the CPU and every copy engine
#[derive(Debug, Default)]
pub struct PhysMemory {
    pages: Mutex<HashMap<(Aperture, u64), Page>>,
}

impl PhysMemory {
    /// Empty memory
    pub fn new() -> Self {
        Self::default()
    }

    fn for_each_span(addr: MemAddr, len: u64, mut f: impl FnMut((Aperture, u64), usize, usize, usize)) {
        let mut done = 0u64;
        while done < len {
            let at = addr.addr.raw() + done;
            let offset = (at % PAGE_SIZE) as usize;
            let chunk = ((PAGE_SIZE - at % PAGE_SIZE).min(len - done)) as usize;
            f((addr.aperture, at / PAGE_SIZE), offset, chunk, done as usize);
            done += chunk as u64;
        }
    }

    /// Read bytes from any aperture
    pub fn read_bytes(&self, addr: MemAddr, buf: &mut [u8]) {
        let pages = self.pages.lock();
        Self::for_each_span(addr, buf.len() as u64, |key, offset, len, at| {
            let dst = &mut buf[at..at + len];
            match pages.get(&key) {
                Some(page) => dst.copy_from_slice(&page[offset..offset + len]),
                None => dst.fill(POISON),
            }
        });
    }

    /// Write bytes to any aperture
    pub fn write_bytes(&self, addr: MemAddr, data: &[u8]) {
        let mut pages = self.pages.lock();
        Self::for_each_span(addr, data.len() as u64, |key, offset, len, at| {
            let page = pages
                .entry(key)
                .or_insert_with(|| Box::new([POISON; PAGE_SIZE as usize]));
            page[offset..offset + len].copy_from_slice(&data[at..at + len]);
        });
    }

    /// Fill bytes in any aperture
    pub fn fill_bytes(&self, addr: MemAddr, value: u8, len: u64) {
        let mut pages = self.pages.lock();
        Self::for_each_span(addr, len, |key, offset, len, _| {
            let page = pages
                .entry(key)
                .or_insert_with(|| Box::new([POISON; PAGE_SIZE as usize]));
            page[offset..offset + len].fill(value);
        });
    }

    /// Pages ever written
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }
}

impl CpuAccess for PhysMemory {
    fn read(&self, addr: MemAddr, buf: &mut [u8]) -> Result<()> {
        if addr.aperture != Aperture::Sysmem {
            return Err(Error::InvalidParameter);
        }
        self.read_bytes(addr, buf);
        Ok(())
    }

    fn write(&self, addr: MemAddr, data: &[u8]) -> Result<()> {
        if addr.aperture != Aperture::Sysmem {
            return Err(Error::InvalidParameter);
        }
        self.write_bytes(addr, data);
        Ok(())
    }

    fn zero(&self, addr: MemAddr, len: u64) -> Result<()> {
        if addr.aperture != Aperture::Sysmem {
            return Err(Error::InvalidParameter);
        }
        self.fill_bytes(addr, 0, len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvm_core::{GpuId, PhysAddr};

    #[test]
    fn test_unwritten_memory_is_poisoned() {
        let mem = PhysMemory::new();
        let mut buf = [0u8; 16];
        mem.read_bytes(MemAddr::new(Aperture::Sysmem, PhysAddr::new(0x1000)), &mut buf);
        assert!(buf.iter().all(|b| *b == POISON));
    }

    #[test]
    fn test_write_across_pages() {
        let mem = PhysMemory::new();
        let addr = MemAddr::new(Aperture::Vidmem(GpuId::new(1)), PhysAddr::new(0x2ff8));
        let data: [u8; 16] = core::array::from_fn(|i| i as u8);
        mem.write_bytes(addr, &data);
        assert_eq!(mem.page_count(), 2);

        let mut buf = [0u8; 16];
        mem.read_bytes(addr, &mut buf);
        assert_eq!(buf, data);
    }

    #[test]
    fn test_cpu_access_is_sysmem_only() {
        let mem = PhysMemory::new();
        let vid = MemAddr::new(Aperture::Vidmem(GpuId::new(0)), PhysAddr::new(0));
        assert_eq!(mem.zero(vid, 8), Err(Error::InvalidParameter));

        let sys = MemAddr::new(Aperture::Sysmem, PhysAddr::new(0x4000));
        mem.zero(sys, PAGE_SIZE).unwrap();
        let mut buf = [1u8; 8];
        mem.read(sys.offset(100), &mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn test_swizzle_is_an_involution() {
        let big = 64 * 1024;
        for offset in [0, PAGE_SIZE, 5 * PAGE_SIZE + 17, big + 3 * PAGE_SIZE] {
            let swizzled = swizzled_offset(offset, big);
            assert_ne!(swizzled, offset);
            assert_eq!(swizzled / big, offset / big);
            assert_eq!(swizzled_offset(swizzled, big), offset);
        }
    }
}
