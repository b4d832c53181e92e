//! # Software Chunk Pool
//!
//! Buddy allocator over a run of 2M root chunks, implementing
//! [`ChunkAllocator`] for hosts without a hardware memory manager.
//!
//! ```text
//!   root 0            root 1            root 2
//! ┌────────────────┬────────────────┬────────────────┐
//! │ 64K│64K│ ...   │      2M        │ 4K│4K│..│ free │
//! └────────────────┴────────────────┴────────────────┘
//!   orders: 0 = 4K ... 9 = 2M
//! ```
//!
//! Eviction candidates are roots holding only user chunks. Roots marked
//! unused go first, then the least recently used.

use alloc::collections::BTreeSet;
use alloc::sync::Weak;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use hashbrown::HashMap;
use spin::{Mutex, RwLock};
use uvm_core::{Error, GpuId, PhysAddr, Result, PAGE_SIZE, PAGE_SIZE_2M};

use crate::chunk::{ChunkAllocator, ChunkSizes, EvictionHandler, GpuChunk, SplitResult};

const ORDERS: usize = 10;

static_assertions::const_assert_eq!(PAGE_SIZE << (ORDERS - 1), PAGE_SIZE_2M);

fn order_of(size: u64) -> Option<usize> {
    if !size.is_power_of_two() || size < PAGE_SIZE || size > PAGE_SIZE_2M {
        return None;
    }
    Some((size.trailing_zeros() - PAGE_SIZE.trailing_zeros()) as usize)
}

// =============================================================================
// POOL STATE
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct RootInfo {
    /// Bytes handed out as user chunks
    user_bytes: u64,
    /// Live kernel chunks; pins the root
    kernel_chunks: u32,
    /// LRU stamp
    last_used: u64,
    /// Marked unused by its owner
    unused: bool,
}

#[derive(Debug, Clone, Copy)]
struct Allocation {
    size: u64,
    kernel: bool,
}

#[derive(Debug)]
struct PoolState {
    free: [BTreeSet<u64>; ORDERS],
    allocated: HashMap<u64, Allocation>,
    roots: Vec<RootInfo>,
    lru_clock: u64,
    stats: PoolStats,
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Successful allocations
    pub allocs: u64,
    /// Frees
    pub frees: u64,
    /// Failed allocations
    pub failures: u64,
    /// Roots evicted
    pub evictions: u64,
    /// Bytes currently allocated
    pub bytes_in_use: u64,
}

// =============================================================================
// SOFT CHUNK POOL
// =============================================================================

/// Buddy allocator over `root_count` contiguous root chunks
#[derive(Debug)]
pub struct SoftChunkPool {
    gpu: GpuId,
    sizes: ChunkSizes,
    base: PhysAddr,
    root_count: usize,
    state: Mutex<PoolState>,
    evictor: RwLock<Option<Weak<dyn EvictionHandler>>>,
    fail_nonevicting: AtomicU32,
    fail_splits: AtomicU32,
}

impl SoftChunkPool {
    /// Create a pool of `root_count` roots starting at `base` (2M aligned)
    pub fn new(gpu: GpuId, base: PhysAddr, root_count: usize, sizes: ChunkSizes) -> Self {
        debug_assert!(base.is_aligned(PAGE_SIZE_2M));
        let mut free: [BTreeSet<u64>; ORDERS] = Default::default();
        for i in 0..root_count {
            free[ORDERS - 1].insert(base.raw() + i as u64 * PAGE_SIZE_2M);
        }
        Self {
            gpu,
            sizes,
            base,
            root_count,
            state: Mutex::new(PoolState {
                free,
                allocated: HashMap::new(),
                roots: alloc::vec![RootInfo::default(); root_count],
                lru_clock: 0,
                stats: PoolStats::default(),
            }),
            evictor: RwLock::new(None),
            fail_nonevicting: AtomicU32::new(0),
            fail_splits: AtomicU32::new(0),
        }
    }

    /// Make the next `count` non-evicting allocations fail
    pub fn inject_nonevicting_failures(&self, count: u32) {
        self.fail_nonevicting.store(count, Ordering::Release);
    }

    /// Make the next `count` splits fail
    pub fn inject_split_failures(&self, count: u32) {
        self.fail_splits.store(count, Ordering::Release);
    }

    /// Statistics snapshot
    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }

    /// Bytes not allocated
    pub fn free_bytes(&self) -> u64 {
        self.root_count as u64 * PAGE_SIZE_2M - self.state.lock().stats.bytes_in_use
    }

    fn root_index(&self, addr: u64) -> usize {
        ((addr - self.base.raw()) / PAGE_SIZE_2M) as usize
    }

    fn try_alloc(&self, state: &mut PoolState, size: u64, kernel: bool) -> Option<u64> {
        let order = order_of(size)?;
        let found = (order..ORDERS).find(|o| !state.free[*o].is_empty())?;
        let addr = state.free[found].pop_first()?;
        for o in (order..found).rev() {
            state.free[o].insert(addr + (PAGE_SIZE << o));
        }

        state.allocated.insert(addr, Allocation { size, kernel });
        state.lru_clock += 1;
        let stamp = state.lru_clock;
        let root = &mut state.roots[self.root_index(addr)];
        if kernel {
            root.kernel_chunks += 1;
        } else {
            root.user_bytes += size;
            root.last_used = stamp;
            root.unused = false;
        }
        state.stats.allocs += 1;
        state.stats.bytes_in_use += size;
        Some(addr)
    }

    fn eviction_candidates(&self, state: &PoolState) -> Vec<u64> {
        let mut roots: Vec<(bool, u64, u64)> = state
            .roots
            .iter()
            .enumerate()
            .filter(|(_, r)| r.user_bytes > 0 && r.kernel_chunks == 0)
            .map(|(i, r)| (!r.unused, r.last_used, self.base.raw() + i as u64 * PAGE_SIZE_2M))
            .collect();
        roots.sort_unstable();
        roots.into_iter().map(|(_, _, addr)| addr).collect()
    }

    fn alloc_inner(&self, size: u64, evict: bool, kernel: bool) -> Result<GpuChunk> {
        if order_of(size).is_none() {
            return Err(Error::InvalidParameter);
        }
        if !evict
            && self
                .fail_nonevicting
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok()
        {
            self.state.lock().stats.failures += 1;
            log::trace!("{:?}: injected allocation failure", self.gpu);
            return Err(Error::OutOfMemory);
        }

        let mut tried: Vec<u64> = Vec::new();
        loop {
            let candidate = {
                let mut state = self.state.lock();
                if let Some(addr) = self.try_alloc(&mut state, size, kernel) {
                    return Ok(GpuChunk::new(self.gpu, PhysAddr::new(addr), size));
                }
                if !evict {
                    state.stats.failures += 1;
                    return Err(Error::OutOfMemory);
                }
                self.eviction_candidates(&state)
                    .into_iter()
                    .find(|root| !tried.contains(root))
            };

            let Some(root) = candidate else {
                self.state.lock().stats.failures += 1;
                return Err(Error::OutOfMemory);
            };
            tried.push(root);

            let handler = self.evictor.read().as_ref().and_then(Weak::upgrade);
            let Some(handler) = handler else {
                self.state.lock().stats.failures += 1;
                return Err(Error::OutOfMemory);
            };

            log::debug!("{:?}: evicting root 0x{:x}", self.gpu, root);
            match handler.evict_root(self.gpu, PhysAddr::new(root), PAGE_SIZE_2M) {
                Ok(()) => self.state.lock().stats.evictions += 1,
                Err(err) => log::warn!("{:?}: eviction of root 0x{:x} failed: {}", self.gpu, root, err),
            }
        }
    }

    fn free_inner(&self, state: &mut PoolState, addr: u64) {
        let Some(allocation) = state.allocated.remove(&addr) else {
            debug_assert!(false, "freeing unknown chunk 0x{:x}", addr);
            return;
        };
        let root = &mut state.roots[self.root_index(addr)];
        if allocation.kernel {
            root.kernel_chunks -= 1;
        } else {
            root.user_bytes -= allocation.size;
            if root.user_bytes == 0 {
                root.unused = false;
            }
        }
        state.stats.frees += 1;
        state.stats.bytes_in_use -= allocation.size;

        let Some(mut order) = order_of(allocation.size) else {
            return;
        };
        let mut addr = addr;
        while order < ORDERS - 1 {
            let offset = addr - self.base.raw();
            let buddy = self.base.raw() + (offset ^ (PAGE_SIZE << order));
            if !state.free[order].remove(&buddy) {
                break;
            }
            addr = addr.min(buddy);
            order += 1;
        }
        state.free[order].insert(addr);
    }
}

impl ChunkAllocator for SoftChunkPool {
    fn gpu(&self) -> GpuId {
        self.gpu
    }

    fn supported_sizes(&self) -> ChunkSizes {
        self.sizes
    }

    fn alloc(&self, size: u64, evict: bool) -> Result<GpuChunk> {
        self.alloc_inner(size, evict, false)
    }

    fn alloc_kernel(&self, size: u64, evict: bool) -> Result<GpuChunk> {
        self.alloc_inner(size, evict, true)
    }

    fn free(&self, chunk: GpuChunk) {
        debug_assert_eq!(chunk.gpu(), self.gpu);
        let mut state = self.state.lock();
        self.free_inner(&mut state, chunk.addr().raw());
    }

    fn split(&self, chunk: GpuChunk, size: u64) -> SplitResult {
        if order_of(size).is_none() || size >= chunk.size() {
            return Err((Error::InvalidParameter, chunk));
        }
        if self
            .fail_splits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            log::trace!("{:?}: injected split failure", self.gpu);
            return Err((Error::OutOfMemory, chunk));
        }
        let mut state = self.state.lock();
        let parent = match state.allocated.get(&chunk.addr().raw()) {
            Some(parent) if parent.size == chunk.size() => *parent,
            Some(_) => return Err((Error::InvalidParameter, chunk)),
            None => return Err((Error::NotFound, chunk)),
        };

        state.allocated.remove(&chunk.addr().raw());
        let count = (chunk.size() / size) as usize;
        let children: Vec<GpuChunk> = (0..count)
            .map(|i| {
                let addr = chunk.addr().offset(i as u64 * size);
                GpuChunk::new(self.gpu, addr, size)
            })
            .collect();
        for child in &children {
            state.allocated.insert(
                child.addr().raw(),
                Allocation {
                    size,
                    kernel: parent.kernel,
                },
            );
        }
        if parent.kernel {
            let root = self.root_index(chunk.addr().raw());
            state.roots[root].kernel_chunks += count as u32 - 1;
        }
        log::trace!("{:?}: split {:?} into {} x 0x{:x}", self.gpu, chunk, count, size);
        Ok(children)
    }

    fn merge(&self, chunks: Vec<GpuChunk>) -> Result<GpuChunk> {
        let first = chunks.first().ok_or(Error::InvalidParameter)?;
        let size = first.size();
        let total = size * chunks.len() as u64;
        let start = first.addr();
        let contiguous = chunks
            .iter()
            .enumerate()
            .all(|(i, c)| c.size() == size && c.addr() == start.offset(i as u64 * size));
        if !contiguous || !total.is_power_of_two() || !start.is_aligned(total) {
            return Err(Error::InvalidParameter);
        }

        let mut state = self.state.lock();
        let mut kernel = false;
        for chunk in &chunks {
            let allocation = state
                .allocated
                .get(&chunk.addr().raw())
                .ok_or(Error::NotFound)?;
            kernel = allocation.kernel;
        }
        for chunk in &chunks {
            state.allocated.remove(&chunk.addr().raw());
        }
        state.allocated.insert(start.raw(), Allocation { size: total, kernel });
        if kernel {
            let root = self.root_index(start.raw());
            state.roots[root].kernel_chunks -= chunks.len() as u32 - 1;
        }
        Ok(GpuChunk::new(self.gpu, start, total))
    }

    fn mark_used(&self, chunk: &GpuChunk) {
        let mut state = self.state.lock();
        state.lru_clock += 1;
        let stamp = state.lru_clock;
        let root = self.root_index(chunk.root_addr().raw());
        state.roots[root].last_used = stamp;
        state.roots[root].unused = false;
    }

    fn mark_unused(&self, chunk: &GpuChunk) {
        let root = self.root_index(chunk.root_addr().raw());
        self.state.lock().roots[root].unused = true;
    }

    fn set_eviction_handler(&self, handler: Weak<dyn EvictionHandler>) {
        *self.evictor.write() = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    fn pool(roots: usize) -> SoftChunkPool {
        SoftChunkPool::new(GpuId::new(0), PhysAddr::new(0), roots, ChunkSizes::DEFAULT)
    }

    #[test]
    fn test_buddy_alloc_and_coalesce() {
        let pool = pool(1);
        let a = pool.alloc(PAGE_SIZE, false).unwrap();
        let b = pool.alloc(PAGE_SIZE, false).unwrap();
        assert_eq!(a.addr(), PhysAddr::new(0));
        assert_eq!(b.addr(), PhysAddr::new(PAGE_SIZE));
        assert_eq!(pool.alloc(PAGE_SIZE_2M, false), Err(Error::OutOfMemory));

        pool.free(a);
        pool.free(b);
        let root = pool.alloc(PAGE_SIZE_2M, false).unwrap();
        assert_eq!(root.addr(), PhysAddr::new(0));
        assert_eq!(pool.free_bytes(), 0);
    }

    #[test]
    fn test_split_and_merge() {
        let pool = pool(1);
        let root = pool.alloc(PAGE_SIZE_2M, false).unwrap();
        let children = pool.split(root, 64 * 1024).unwrap();
        assert_eq!(children.len(), 32);
        assert_eq!(children[5].addr(), PhysAddr::new(5 * 64 * 1024));

        let merged = pool.merge(children).unwrap();
        assert_eq!(merged.size(), PAGE_SIZE_2M);
        pool.free(merged);
        assert_eq!(pool.free_bytes(), PAGE_SIZE_2M);
    }

    #[test]
    fn test_merge_rejects_non_siblings() {
        let pool = pool(1);
        let root = pool.alloc(PAGE_SIZE_2M, false).unwrap();
        let mut children = pool.split(root, PAGE_SIZE_2M / 2).unwrap();
        children.reverse();
        assert!(pool.merge(children).is_err());
    }

    #[test]
    fn test_failed_split_returns_chunk() {
        let pool = pool(1);
        let root = pool.alloc(PAGE_SIZE_2M, false).unwrap();
        pool.inject_split_failures(1);
        let (err, root) = pool.split(root, 64 * 1024).unwrap_err();
        assert_eq!(err, Error::OutOfMemory);
        assert_eq!(root.size(), PAGE_SIZE_2M);
        assert_eq!(pool.split(root, 64 * 1024).map(|c| c.len()).ok(), Some(32));
    }

    #[test]
    fn test_injected_failures_only_hit_nonevicting() {
        let pool = pool(1);
        pool.inject_nonevicting_failures(1);
        assert_eq!(pool.alloc(PAGE_SIZE, false), Err(Error::OutOfMemory));
        let chunk = pool.alloc(PAGE_SIZE, false).unwrap();
        pool.free(chunk);
        assert_eq!(pool.stats().failures, 1);
    }

    struct FreeingEvictor {
        pool: Arc<SoftChunkPool>,
        held: Mutex<Vec<GpuChunk>>,
    }

    impl EvictionHandler for FreeingEvictor {
        fn evict_root(&self, _gpu: GpuId, root: PhysAddr, size: u64) -> Result<()> {
            let mut held = self.held.lock();
            let (evicted, kept): (Vec<_>, Vec<_>) = held
                .drain(..)
                .partition(|c| c.addr().raw() >= root.raw() && c.addr().raw() < root.raw() + size);
            *held = kept;
            for chunk in evicted {
                self.pool.free(chunk);
            }
            Ok(())
        }
    }

    #[test]
    fn test_eviction_prefers_unused_roots() {
        let pool = Arc::new(pool(2));
        let first = pool.alloc(PAGE_SIZE_2M, false).unwrap();
        let second = pool.alloc(PAGE_SIZE_2M, false).unwrap();
        pool.mark_used(&first);
        pool.mark_unused(&second);
        let second_addr = second.addr();

        let evictor = Arc::new(FreeingEvictor {
            pool: pool.clone(),
            held: Mutex::new(alloc::vec![first, second]),
        });
        let weak: Weak<dyn EvictionHandler> = Arc::downgrade(&evictor) as Weak<dyn EvictionHandler>;
        pool.set_eviction_handler(weak);

        assert_eq!(pool.alloc(PAGE_SIZE, false), Err(Error::OutOfMemory));
        let chunk = pool.alloc(PAGE_SIZE, true).unwrap();
        assert_eq!(chunk.root_addr(), second_addr);
        assert_eq!(pool.stats().evictions, 1);
        assert_eq!(evictor.held.lock().len(), 1);
    }

    #[test]
    fn test_kernel_roots_are_not_evicted() {
        let pool = pool(1);
        let _table = pool.alloc_kernel(PAGE_SIZE, false).unwrap();
        let state = pool.state.lock();
        assert!(pool.eviction_candidates(&state).is_empty());
    }
}
