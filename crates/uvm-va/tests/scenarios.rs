//! End-to-end scenarios on the host simulation.
//!
//! Every scenario drives a [`VaSpace`] through its public entry points only
//! and checks the result through block introspection, the software page
//! trees and the shared physical memory.

use uvm_cmd::ChannelType;
use uvm_core::clock::NSEC_PER_MSEC;
use uvm_core::{
    AccessType, Error, GpuId, LinkKind, MemAddr, PageMask, ProcessorId, ProcessorMask, Prot, ToolsEvent, VirtAddr,
    PAGE_SIZE, PAGE_SIZE_2M,
};
use uvm_mem::{PageSize, PageSizes, TlbRange};
use uvm_va::{CpuFaultOutcome, GpuFault, SimBuilder, SimGpuSpec, SimSystem, VaPolicy, VaSpace};

const BASE: u64 = 0x4000_0000;
const MIB: u64 = 1024 * 1024;

fn gpu(n: u8) -> ProcessorId {
    ProcessorId::from_gpu(GpuId::new(n))
}

fn one_gpu(roots: usize) -> SimSystem {
    SimBuilder::new().gpu(SimGpuSpec::new(roots)).build().unwrap()
}

fn two_gpus() -> SimSystem {
    SimBuilder::new()
        .gpu(SimGpuSpec::new(4))
        .gpu(SimGpuSpec::new(4))
        .peer(0, 1, LinkKind::NvLink)
        .build()
        .unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn fault(gpu: u8, addr: u64, access: AccessType) -> GpuFault {
    GpuFault {
        gpu: GpuId::new(gpu),
        addr: VirtAddr::new(addr),
        access,
        instance: 0x1000 + gpu as u64,
    }
}

fn page_addr(page: usize) -> u64 {
    BASE + page as u64 * PAGE_SIZE
}

fn read_back(space: &VaSpace, addr: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    space.read(VirtAddr::new(addr), &mut buf).unwrap();
    buf
}

fn assert_consistent(sim: &SimSystem) {
    let violations = sim.space.verify();
    assert!(violations.is_empty(), "{:?}", violations);
    assert_eq!(sim.coherence_violations(), 0);
}

fn pages(first: usize, count: usize) -> PageMask {
    let mut mask = PageMask::new();
    for page in first..first + count {
        mask.set(page);
    }
    mask
}

// =============================================================================
// MIGRATION
// =============================================================================

#[test]
fn test_migrate_gpu_to_cpu() {
    let sim = one_gpu(4);
    let space = &sim.space;
    space.create_range(VirtAddr::new(BASE), PAGE_SIZE_2M, VaPolicy::default()).unwrap();
    let region = 16 * PAGE_SIZE;
    let data = pattern(region as usize, 7);

    space.migrate(VirtAddr::new(BASE), region, gpu(0)).unwrap();
    space.write(VirtAddr::new(BASE), &data).unwrap();
    let faults: Vec<_> = (0..16).map(|p| fault(0, page_addr(p), AccessType::Read)).collect();
    assert!(space.gpu_faults(&faults).unwrap().all_serviced());

    let block = space.block_at(VirtAddr::new(BASE)).unwrap();
    assert_eq!(block.resident_mask(gpu(0)), pages(0, 16));
    assert_eq!(block.mapped_mask(gpu(0)), pages(0, 16));

    space.migrate(VirtAddr::new(BASE), region, ProcessorId::CPU).unwrap();

    assert_eq!(block.resident_mask(ProcessorId::CPU), pages(0, 16));
    assert!(block.resident_mask(gpu(0)).is_empty());
    assert!(block.mapped_mask(gpu(0)).is_empty());
    for page in 0..16 {
        assert_eq!(block.prot(gpu(0), page), Prot::None);
        assert!(block.gpu_translation(GpuId::new(0), page).is_none());
        assert!(sim.gpu(0).tree.translate(VirtAddr::new(page_addr(page))).is_none());
    }
    assert_eq!(read_back(space, BASE, region as usize), data);
    assert!(space.stats().bytes_migrated >= region);
    assert_consistent(&sim);
}

#[test]
fn test_write_fault_collapses_shared_read_mappings() {
    let sim = two_gpus();
    let space = &sim.space;
    let policy = VaPolicy {
        read_duplication: true,
        accessed_by: ProcessorMask::single(gpu(1)),
        ..VaPolicy::default()
    };
    space.create_range(VirtAddr::new(BASE), PAGE_SIZE_2M, policy).unwrap();

    // GPU0 reads the page in; GPU1 maps GPU0's copy over the peer link
    assert!(space.gpu_faults(&[fault(0, BASE, AccessType::Read)]).unwrap().all_serviced());
    let block = space.block_at(VirtAddr::new(BASE)).unwrap();
    assert_eq!(block.resident_processors(0), ProcessorMask::single(gpu(0)));
    assert_eq!(block.prot(gpu(0), 0), Prot::ReadOnly);
    assert_eq!(block.prot(gpu(1), 0), Prot::ReadOnly);
    let peer_target = block.gpu_translation(GpuId::new(1), 0).unwrap().0;
    assert_eq!(Some(peer_target), block.backing(gpu(0), 0));

    let result = space.gpu_faults(&[fault(1, BASE + 0x10, AccessType::Write)]).unwrap();
    assert_eq!(result.serviced, 1);

    assert_eq!(block.resident_processors(0), ProcessorMask::single(gpu(1)));
    assert_eq!(block.prot(gpu(0), 0), Prot::None);
    assert!(block.prot(gpu(1), 0).is_writable());
    assert!(!block.read_duplicated().test(0));
    let (target, prot, _) = block.gpu_translation(GpuId::new(1), 0).unwrap();
    assert_eq!(Some(target), block.backing(gpu(1), 0));
    assert!(prot.is_writable());
    assert!(block.gpu_translation(GpuId::new(0), 0).is_none());
    assert_consistent(&sim);
}

#[test]
fn test_read_duplication_and_cpu_writes() {
    let sim = two_gpus();
    let space = &sim.space;
    let policy = VaPolicy {
        read_duplication: true,
        ..VaPolicy::default()
    };
    space.create_range(VirtAddr::new(BASE), PAGE_SIZE_2M, policy).unwrap();
    let data = pattern(PAGE_SIZE as usize, 3);
    space.write(VirtAddr::new(BASE), &data).unwrap();

    space
        .gpu_faults(&[fault(0, BASE, AccessType::Read), fault(1, BASE, AccessType::Read)])
        .unwrap();
    assert_eq!(space.cpu_fault(VirtAddr::new(BASE), AccessType::Read), Ok(CpuFaultOutcome::Serviced));

    let block = space.block_at(VirtAddr::new(BASE)).unwrap();
    let everyone: ProcessorMask = [ProcessorId::CPU, gpu(0), gpu(1)].into_iter().collect();
    assert_eq!(block.resident_processors(0), everyone);
    assert!(block.read_duplicated().test(0));
    for processor in everyone.iter() {
        assert_eq!(block.prot(processor, 0), Prot::ReadOnly);
    }

    // Writes through the CPU access path reach every copy
    let update = pattern(64, 99);
    space.write(VirtAddr::new(BASE + 128), &update).unwrap();
    for processor in everyone.iter() {
        let mem = block.backing(processor, 0).unwrap();
        let mut copy = vec![0u8; 64];
        sim.memory.read_bytes(mem.offset(128), &mut copy);
        assert_eq!(copy, update, "{:?}", processor);
    }

    // A CPU write fault leaves one copy
    assert_eq!(space.cpu_fault(VirtAddr::new(BASE), AccessType::Write), Ok(CpuFaultOutcome::Serviced));
    assert_eq!(block.resident_processors(0), ProcessorMask::single(ProcessorId::CPU));
    assert!(!block.read_duplicated().test(0));
    assert_eq!(block.prot(gpu(0), 0), Prot::None);
    assert_eq!(block.prot(gpu(1), 0), Prot::None);
    assert_eq!(block.prot(ProcessorId::CPU, 0), Prot::ReadWrite);

    let mut expected = data.clone();
    expected[128..192].copy_from_slice(&update);
    assert_eq!(read_back(space, BASE, PAGE_SIZE as usize), expected);

    let events = sim.events.drain();
    assert!(events.iter().any(|e| matches!(e, ToolsEvent::ReadDuplicate { .. })));
    assert!(events.iter().any(|e| matches!(e, ToolsEvent::ReadDuplicateInvalidate { .. })));
    assert_consistent(&sim);
}

// =============================================================================
// PAGE-TABLE SHAPES
// =============================================================================

fn two_meg_read_only(sim: &SimSystem) {
    let policy = VaPolicy {
        read_duplication: true,
        accessed_by: ProcessorMask::single(gpu(0)),
        ..VaPolicy::default()
    };
    sim.space.create_range(VirtAddr::new(BASE), PAGE_SIZE_2M, policy).unwrap();
    sim.space.migrate(VirtAddr::new(BASE), PAGE_SIZE_2M, gpu(0)).unwrap();
}

#[test]
fn test_write_inside_2m_leaf_splits_it() {
    let sim = one_gpu(4);
    two_meg_read_only(&sim);
    let block = sim.space.block_at(VirtAddr::new(BASE)).unwrap();
    let info = block.pte_info(GpuId::new(0)).unwrap();
    assert!(info.is_2m);

    // Every page reads the same permission and the same chunk through the
    // 2M leaf
    let first = block.gpu_translation(GpuId::new(0), 0).unwrap();
    for page in [1, 17, 300, 511] {
        let (target, prot, size) = block.gpu_translation(GpuId::new(0), page).unwrap();
        assert_eq!(size, PageSize::Size2M);
        assert_eq!(prot, Prot::ReadOnly);
        assert_eq!(target, first.0.offset(page as u64 * PAGE_SIZE));
    }

    let tree = &sim.gpu(0).tree;
    tree.take_invalidates();
    let result = sim.space.gpu_faults(&[fault(0, page_addr(5), AccessType::Write)]).unwrap();
    assert_eq!(result.serviced, 1);

    let info = block.pte_info(GpuId::new(0)).unwrap();
    assert!(!info.is_2m);
    assert!(info.small_leaves.test(5));
    assert!(info.small_leaves.test(6));
    assert!(info.big_leaves.test(100));
    assert!(!info.big_leaves.test(5));

    let written = tree.translate(VirtAddr::new(page_addr(5))).unwrap();
    assert_eq!(written.size, PageSize::Size4K);
    assert!(written.prot.is_writable());
    let sibling = tree.translate(VirtAddr::new(page_addr(6))).unwrap();
    assert_eq!(sibling.size, PageSize::Size4K);
    assert_eq!(sibling.prot, Prot::ReadOnly);
    let far = tree.translate(VirtAddr::new(page_addr(100))).unwrap();
    assert_eq!(far.size, PageSize::Big);
    assert_eq!(far.prot, Prot::ReadOnly);

    let whole = TlbRange {
        start: VirtAddr::new(BASE),
        len: PAGE_SIZE_2M,
        levels: PageSizes::SIZE_2M,
    };
    let covering = tree
        .take_invalidates()
        .iter()
        .filter(|inv| inv.all || inv.ranges.iter().any(|r| r.covers(&whole)))
        .count();
    assert_eq!(covering, 1);
    assert_consistent(&sim);
}

#[test]
fn test_retry_with_eviction_is_transparent() {
    let run = |inject: bool| {
        let sim = one_gpu(4);
        if inject {
            sim.gpu(0).pool.inject_nonevicting_failures(1);
        }
        let space = &sim.space;
        space.create_range(VirtAddr::new(BASE), PAGE_SIZE_2M, VaPolicy::default()).unwrap();
        space.write(VirtAddr::new(BASE), &pattern(32 * PAGE_SIZE as usize, 5)).unwrap();
        space.migrate(VirtAddr::new(BASE), 16 * PAGE_SIZE, gpu(0)).unwrap();
        space.gpu_faults(&[fault(0, page_addr(2), AccessType::Write)]).unwrap();

        let block = space.block_at(VirtAddr::new(BASE)).unwrap();
        let prots: Vec<_> = (0..32)
            .map(|page| (block.prot(ProcessorId::CPU, page), block.prot(gpu(0), page)))
            .collect();
        let state = (
            block.resident_mask(ProcessorId::CPU),
            block.resident_mask(gpu(0)),
            prots,
            block.pte_info(GpuId::new(0)),
            read_back(space, BASE, 32 * PAGE_SIZE as usize),
        );
        assert_consistent(&sim);
        (state, sim.gpu(0).pool.stats().failures)
    };

    let (plain, plain_failures) = run(false);
    let (retried, retried_failures) = run(true);
    assert_eq!(plain_failures, 0);
    assert!(retried_failures >= 1);
    assert_eq!(plain, retried);
}

#[test]
fn test_page_table_shortage_evicts_and_remaps() {
    // Both roots hold a whole block migrated to the GPU, so the 4K table for
    // a remote mapping of the third block can only come from eviction
    let run = |roots: usize| {
        let sim = one_gpu(roots);
        let space = &sim.space;
        let third = BASE + 2 * PAGE_SIZE_2M;
        space.create_range(VirtAddr::new(BASE), 2 * PAGE_SIZE_2M, VaPolicy::default()).unwrap();
        let remote = VaPolicy {
            preferred_location: Some(ProcessorId::CPU),
            ..VaPolicy::default()
        };
        space.create_range(VirtAddr::new(third), PAGE_SIZE_2M, remote).unwrap();

        let first = pattern(PAGE_SIZE as usize, 3);
        space.write(VirtAddr::new(BASE), &first).unwrap();
        space.migrate(VirtAddr::new(BASE), 2 * PAGE_SIZE_2M, gpu(0)).unwrap();
        let data = pattern(PAGE_SIZE as usize, 9);
        space.write(VirtAddr::new(third), &data).unwrap();
        assert_eq!(space.cpu_fault(VirtAddr::new(third), AccessType::Write), Ok(CpuFaultOutcome::Serviced));

        let tree = &sim.gpu(0).tree;
        let tables = tree.table_count();
        assert!(space.gpu_faults(&[fault(0, third, AccessType::Read)]).unwrap().all_serviced());
        assert_eq!(tree.table_count(), tables + 1);

        let block = space.block_at(VirtAddr::new(third)).unwrap();
        let (target, prot, size) = block.gpu_translation(GpuId::new(0), 0).unwrap();
        assert_eq!(Some(target), block.backing(ProcessorId::CPU, 0));
        assert_eq!(size, PageSize::Size4K);
        assert_eq!(tree.translate(VirtAddr::new(third)).map(|t| t.target), Some(target));
        let state = (
            (target, prot),
            block.cpu_translation(0),
            block.prot(ProcessorId::CPU, 0),
            block.resident_mask(ProcessorId::CPU),
            block.mapped_mask(gpu(0)),
            read_back(space, third, data.len()),
            read_back(space, BASE, first.len()),
        );
        assert_eq!(state.5, data);
        assert_eq!(state.6, first);
        assert_consistent(&sim);
        (state, sim.gpu(0).pool.stats(), space.block_at(VirtAddr::new(BASE)).unwrap())
    };

    let (plain, plain_stats, _) = run(3);
    assert_eq!(plain_stats.evictions, 0);
    assert_eq!(plain_stats.failures, 0);

    let (evicted, stats, victim) = run(2);
    assert_eq!(stats.evictions, 1);
    assert!(stats.failures >= 1);
    assert!(victim.resident_mask(gpu(0)).is_empty());
    assert!(victim.resident_mask(ProcessorId::CPU).test(0));
    assert_eq!(plain, evicted);
}

#[test]
fn test_peer_mapping_unswizzles_big_page() {
    let sim = SimBuilder::new()
        .gpu(SimGpuSpec::new(4).swizzling())
        .gpu(SimGpuSpec::new(4))
        .peer(0, 1, LinkKind::NvLink)
        .build()
        .unwrap();
    let space = &sim.space;
    let policy = VaPolicy {
        preferred_location: Some(gpu(0)),
        ..VaPolicy::default()
    };
    space.create_range(VirtAddr::new(BASE), PAGE_SIZE_2M, policy).unwrap();
    let big = 16;
    let data = pattern(big * PAGE_SIZE as usize, 11);
    space.write(VirtAddr::new(BASE), &data).unwrap();

    // A big leaf over the GPU's own memory keeps it swizzled
    let faults: Vec<_> = (0..big).map(|p| fault(0, page_addr(p), AccessType::Write)).collect();
    assert!(space.gpu_faults(&faults).unwrap().all_serviced());
    let block = space.block_at(VirtAddr::new(BASE)).unwrap();
    let info = block.pte_info(GpuId::new(0)).unwrap();
    assert_eq!(info.big_leaves, pages(0, big));
    assert_eq!(info.swizzled, pages(0, big));
    let before: Vec<_> = (0..big)
        .map(|page| {
            let (target, prot, _) = block.gpu_translation(GpuId::new(0), page).unwrap();
            (target, prot)
        })
        .collect();
    let page_bytes = |page: usize| data[page * PAGE_SIZE as usize..(page + 1) * PAGE_SIZE as usize].to_vec();
    let stored = |page: usize| {
        let mut buf = vec![0u8; PAGE_SIZE as usize];
        sim.memory.read_bytes(block.backing(gpu(0), page).unwrap(), &mut buf);
        buf
    };
    assert_eq!(stored(1), page_bytes(0));
    assert_eq!(stored(0), page_bytes(1));
    assert_eq!(read_back(space, BASE, data.len()), data);

    // A peer mapping needs the linear layout
    let tree = &sim.gpu(0).tree;
    tree.take_invalidates();
    assert!(space.gpu_faults(&[fault(1, page_addr(3), AccessType::Read)]).unwrap().all_serviced());

    assert_eq!(block.resident_processors(3), ProcessorMask::single(gpu(0)));
    let peer = block.gpu_translation(GpuId::new(1), 3).unwrap();
    assert_eq!(Some(peer.0), block.backing(gpu(0), 3));
    let info = block.pte_info(GpuId::new(0)).unwrap();
    assert!(info.swizzled.is_empty());
    assert!(info.big_leaves.is_empty());
    assert_eq!(info.small_leaves, pages(0, big));
    for (page, old) in before.iter().enumerate() {
        let (target, prot, size) = block.gpu_translation(GpuId::new(0), page).unwrap();
        assert_eq!((target, prot), *old, "page {}", page);
        assert_eq!(size, PageSize::Size4K);
    }
    for page in 0..big {
        assert_eq!(stored(page), page_bytes(page), "page {}", page);
    }

    let big_page = TlbRange {
        start: VirtAddr::new(BASE),
        len: big as u64 * PAGE_SIZE,
        levels: PageSizes::BIG,
    };
    assert!(tree
        .take_invalidates()
        .iter()
        .any(|inv| inv.all || inv.ranges.iter().any(|r| r.covers(&big_page))));
    assert_eq!(read_back(space, BASE, data.len()), data);
    assert_consistent(&sim);
}

// =============================================================================
// THRASHING
// =============================================================================

#[test]
fn test_ping_pong_is_detected_then_throttled() {
    let sim = one_gpu(4);
    let space = &sim.space;
    space.create_range(VirtAddr::new(BASE), PAGE_SIZE_2M, VaPolicy::default()).unwrap();
    let addr = VirtAddr::new(page_addr(3));

    assert_eq!(space.cpu_fault(addr, AccessType::Write), Ok(CpuFaultOutcome::Serviced));
    let block = space.block_at(addr).unwrap();

    // Migrations 1 and 2 stay below the threshold
    assert!(space.gpu_faults(&[fault(0, addr.raw(), AccessType::Write)]).unwrap().all_serviced());
    assert_eq!(space.cpu_fault(addr, AccessType::Write), Ok(CpuFaultOutcome::Serviced));
    assert!(block.thrashing_pages().is_empty());

    // Migration 3 flags the page
    assert!(space.gpu_faults(&[fault(0, addr.raw(), AccessType::Write)]).unwrap().all_serviced());
    assert!(block.thrashing_pages().test(3));
    assert_eq!(block.thrashing_pages().weight(), 1);

    let now = 1_000_000_000;
    assert_eq!(
        space.cpu_fault(addr, AccessType::Write),
        Ok(CpuFaultOutcome::Throttled {
            until_ns: now + NSEC_PER_MSEC
        })
    );
    assert_eq!(block.resident_processors(3), ProcessorMask::single(gpu(0)));

    sim.clock.advance(2 * NSEC_PER_MSEC);
    assert_eq!(space.cpu_fault(addr, AccessType::Write), Ok(CpuFaultOutcome::Serviced));
    assert_eq!(block.resident_processors(3), ProcessorMask::single(ProcessorId::CPU));

    let stats = space.stats();
    assert_eq!(stats.throttled, 1);
    let events = sim.events.drain();
    assert!(events.iter().any(|e| matches!(e, ToolsEvent::ThrashingDetected { .. })));
    assert!(events.iter().any(|e| matches!(e, ToolsEvent::ThrottlingStart { .. })));
    assert_consistent(&sim);
}

#[test]
fn test_spaced_out_migrations_do_not_thrash() {
    let sim = one_gpu(4);
    let space = &sim.space;
    space.create_range(VirtAddr::new(BASE), PAGE_SIZE_2M, VaPolicy::default()).unwrap();
    let addr = VirtAddr::new(BASE);
    space.cpu_fault(addr, AccessType::Write).unwrap();
    for _ in 0..6 {
        sim.clock.advance(NSEC_PER_MSEC);
        assert!(space.gpu_faults(&[fault(0, BASE, AccessType::Write)]).unwrap().all_serviced());
        sim.clock.advance(NSEC_PER_MSEC);
        assert_eq!(space.cpu_fault(addr, AccessType::Write), Ok(CpuFaultOutcome::Serviced));
    }
    assert!(space.block_at(addr).unwrap().thrashing_pages().is_empty());
}

// =============================================================================
// SPLITS
// =============================================================================

type PageSnapshot = (ProcessorMask, Prot, Prot, Option<MemAddr>, Option<MemAddr>);

fn snapshot(space: &VaSpace, page: usize) -> PageSnapshot {
    let addr = VirtAddr::new(page_addr(page));
    let block = space.block_at(addr).unwrap();
    let index = block.page_index(addr).unwrap();
    (
        block.resident_processors(index),
        block.prot(ProcessorId::CPU, index),
        block.prot(gpu(0), index),
        block.backing(ProcessorId::CPU, index),
        block.backing(gpu(0), index),
    )
}

#[test]
fn test_split_is_a_refinement() {
    let sim = one_gpu(4);
    let space = &sim.space;
    let policy = VaPolicy {
        accessed_by: ProcessorMask::single(gpu(0)),
        ..VaPolicy::default()
    };
    space.create_range(VirtAddr::new(BASE), PAGE_SIZE_2M, policy).unwrap();
    let data = pattern(PAGE_SIZE_2M as usize, 11);
    space.write(VirtAddr::new(BASE), &data).unwrap();
    space.migrate(VirtAddr::new(BASE), MIB + 64 * 1024, gpu(0)).unwrap();

    let before: Vec<_> = (0..512).map(|page| snapshot(space, page)).collect();
    space.split_block_at(VirtAddr::new(BASE + MIB)).unwrap();

    let blocks = space.blocks();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].end(), VirtAddr::new(BASE + MIB - 1));
    assert_eq!(blocks[1].start(), VirtAddr::new(BASE + MIB));
    let after: Vec<_> = (0..512).map(|page| snapshot(space, page)).collect();
    assert_eq!(before, after);
    assert_eq!(read_back(space, BASE, PAGE_SIZE_2M as usize), data);
    assert_eq!(space.stats().block_splits, 1);
    assert_consistent(&sim);

    // Both halves keep working on their own
    space.migrate(VirtAddr::new(BASE + MIB), 64 * 1024, ProcessorId::CPU).unwrap();
    assert!(blocks[1].resident_mask(gpu(0)).is_empty());
    assert_eq!(blocks[0].resident_mask(gpu(0)).weight(), 256);
    assert_consistent(&sim);
}

#[test]
fn test_failed_split_leaves_block_whole() {
    let sim = one_gpu(4);
    let space = &sim.space;
    space.create_range(VirtAddr::new(BASE), PAGE_SIZE_2M, VaPolicy::default()).unwrap();
    let data = pattern(PAGE_SIZE_2M as usize, 13);
    space.write(VirtAddr::new(BASE), &data).unwrap();
    space.migrate(VirtAddr::new(BASE), PAGE_SIZE_2M, gpu(0)).unwrap();

    sim.gpu(0).pool.inject_split_failures(1);
    assert_eq!(space.split_block_at(VirtAddr::new(BASE + MIB)), Err(Error::OutOfMemory));
    assert_eq!(space.blocks().len(), 1);
    assert!(space.status().is_ok());
    assert_eq!(read_back(space, BASE, PAGE_SIZE_2M as usize), data);
    assert_consistent(&sim);

    space.split_block_at(VirtAddr::new(BASE + MIB)).unwrap();
    assert_eq!(space.blocks().len(), 2);
    assert_eq!(read_back(space, BASE, PAGE_SIZE_2M as usize), data);
    assert_consistent(&sim);
}

#[test]
fn test_policy_change_splits_ranges_and_blocks() {
    let sim = one_gpu(4);
    let space = &sim.space;
    space.create_range(VirtAddr::new(BASE), 2 * PAGE_SIZE_2M, VaPolicy::default()).unwrap();
    space.write(VirtAddr::new(BASE), &pattern(2 * PAGE_SIZE_2M as usize, 1)).unwrap();
    assert_eq!(space.blocks().len(), 2);

    let policy = VaPolicy {
        accessed_by: ProcessorMask::single(gpu(0)),
        ..VaPolicy::default()
    };
    space.set_policy(VirtAddr::new(BASE + MIB), PAGE_SIZE_2M, policy).unwrap();

    let ranges = space.ranges();
    assert_eq!(ranges.len(), 3);
    assert_eq!(ranges[1].start(), VirtAddr::new(BASE + MIB));
    assert_eq!(ranges[1].end(), VirtAddr::new(BASE + 3 * MIB - 1));
    assert_eq!(space.blocks().len(), 4);
    assert_eq!(space.stats().block_splits, 2);

    // Resident pages of the middle got mapped for GPU0; the edges did not
    let inside = space.block_at(VirtAddr::new(BASE + MIB)).unwrap();
    assert_eq!(inside.prot(gpu(0), 0), Prot::ReadWrite);
    assert!(inside.gpu_translation(GpuId::new(0), 0).is_some());
    let outside = space.block_at(VirtAddr::new(BASE)).unwrap();
    assert_eq!(outside.prot(gpu(0), 0), Prot::None);
    assert_consistent(&sim);
}

// =============================================================================
// EVICTION
// =============================================================================

#[test]
fn test_allocation_evicts_idle_block() {
    let sim = one_gpu(1);
    let space = &sim.space;
    space.create_range(VirtAddr::new(BASE), 2 * PAGE_SIZE_2M, VaPolicy::default()).unwrap();
    let data = pattern(PAGE_SIZE_2M as usize, 21);
    space.write(VirtAddr::new(BASE), &data).unwrap();
    space.migrate(VirtAddr::new(BASE), PAGE_SIZE_2M, gpu(0)).unwrap();
    let first = space.block_at(VirtAddr::new(BASE)).unwrap();
    assert_eq!(first.resident_mask(gpu(0)).weight(), 512);

    // The only root is taken: the second block's allocation evicts the first
    space
        .migrate(VirtAddr::new(BASE + PAGE_SIZE_2M), PAGE_SIZE_2M, gpu(0))
        .unwrap();
    let second = space.block_at(VirtAddr::new(BASE + PAGE_SIZE_2M)).unwrap();
    assert_eq!(second.resident_mask(gpu(0)).weight(), 512);
    assert!(first.resident_mask(gpu(0)).is_empty());
    assert_eq!(first.resident_mask(ProcessorId::CPU).weight(), 512);
    assert_eq!(read_back(space, BASE, PAGE_SIZE_2M as usize), data);

    assert_eq!(space.stats().evictions, 1);
    assert_eq!(sim.gpu(0).pool.stats().evictions, 1);
    let events = sim.events.drain();
    assert!(events.iter().any(|e| matches!(e, ToolsEvent::Eviction { .. })));
    assert_consistent(&sim);
}

// =============================================================================
// POLICY LIMITS AND ERRORS
// =============================================================================

#[test]
fn test_read_only_range_denies_writes() {
    let sim = one_gpu(4);
    let space = &sim.space;
    let policy = VaPolicy {
        max_prot: Prot::ReadOnly,
        ..VaPolicy::default()
    };
    space.create_range(VirtAddr::new(BASE), PAGE_SIZE_2M, policy).unwrap();

    assert_eq!(space.cpu_fault(VirtAddr::new(BASE), AccessType::Write), Err(Error::AccessDenied));
    let result = space
        .gpu_faults(&[fault(0, BASE, AccessType::Write), fault(0, BASE + PAGE_SIZE, AccessType::Read)])
        .unwrap();
    assert_eq!(result.serviced, 1);
    assert_eq!(result.cancelled.len(), 1);
    assert_eq!(result.cancelled[0].1, Error::AccessDenied);
    let block = space.block_at(VirtAddr::new(BASE)).unwrap();
    assert_eq!(block.prot(gpu(0), 1), Prot::ReadOnly);
    assert_consistent(&sim);
}

#[test]
fn test_uvm_lite_maps_only_the_preferred_location() {
    let sim = two_gpus();
    let space = &sim.space;
    let policy = VaPolicy {
        preferred_location: Some(gpu(0)),
        uvm_lite: ProcessorMask::single(gpu(1)),
        ..VaPolicy::default()
    };
    space.create_range(VirtAddr::new(BASE), PAGE_SIZE_2M, policy).unwrap();
    let data = pattern(PAGE_SIZE as usize, 4);
    space.write(VirtAddr::new(BASE), &data).unwrap();

    // The fault pulls the data to the preferred location, not to GPU1
    assert!(space.gpu_faults(&[fault(1, BASE, AccessType::Read)]).unwrap().all_serviced());
    let block = space.block_at(VirtAddr::new(BASE)).unwrap();
    assert_eq!(block.resident_processors(0), ProcessorMask::single(gpu(0)));
    let (target, ..) = block.gpu_translation(GpuId::new(1), 0).unwrap();
    assert_eq!(Some(target), block.backing(gpu(0), 0));
    assert_consistent(&sim);

    // A copy anywhere else is never mapped, even GPU1's own
    space.migrate(VirtAddr::new(BASE), PAGE_SIZE, gpu(1)).unwrap();
    assert_eq!(block.resident_processors(0), ProcessorMask::single(gpu(1)));
    assert_eq!(block.prot(gpu(1), 0), Prot::None);
    assert!(block.gpu_translation(GpuId::new(1), 0).is_none());
    assert!(sim.gpu(1).tree.translate(VirtAddr::new(BASE)).is_none());
    assert_consistent(&sim);

    assert!(space.gpu_faults(&[fault(1, BASE, AccessType::Write)]).unwrap().all_serviced());
    assert_eq!(block.resident_processors(0), ProcessorMask::single(gpu(0)));
    let (target, prot, _) = block.gpu_translation(GpuId::new(1), 0).unwrap();
    assert_eq!(Some(target), block.backing(gpu(0), 0));
    assert!(prot.is_writable());
    assert_eq!(read_back(space, BASE, data.len()), data);
    assert_consistent(&sim);
}

#[test]
fn test_unmanaged_addresses() {
    let sim = one_gpu(4);
    let space = &sim.space;
    space.create_range(VirtAddr::new(BASE), PAGE_SIZE_2M, VaPolicy::default()).unwrap();

    assert_eq!(
        space.create_range(VirtAddr::new(BASE + MIB), PAGE_SIZE_2M, VaPolicy::default()).unwrap_err(),
        Error::Busy
    );
    assert_eq!(space.cpu_fault(VirtAddr::new(0x1000), AccessType::Read), Err(Error::InvalidAddress));
    let result = space
        .gpu_faults(&[fault(0, 0x1000, AccessType::Read), fault(5, BASE, AccessType::Read)])
        .unwrap();
    assert_eq!(result.serviced, 0);
    assert_eq!(result.cancelled.len(), 2);
    assert_eq!(space.destroy_range(VirtAddr::new(0x1000)), Err(Error::NotFound));

    // Unpopulated memory reads as zeros
    assert_eq!(read_back(space, BASE, 64), vec![0u8; 64]);

    // Accesses wrapping past the top of the address space
    let top = VirtAddr::new(u64::MAX - 0xf);
    let mut buf = [0u8; 32];
    assert_eq!(space.read(top, &mut buf), Err(Error::InvalidAddress));
    assert_eq!(space.write(top, &buf), Err(Error::InvalidAddress));
    assert_eq!(space.write(top, &[]), Ok(()));
}

#[test]
fn test_destroy_range_frees_memory() {
    let sim = one_gpu(4);
    let space = &sim.space;
    let free = sim.gpu(0).pool.free_bytes();
    space.create_range(VirtAddr::new(BASE), PAGE_SIZE_2M, VaPolicy::default()).unwrap();
    space.write(VirtAddr::new(BASE), &pattern(64 * 1024, 2)).unwrap();
    space.migrate(VirtAddr::new(BASE), 64 * 1024, gpu(0)).unwrap();
    assert!(sim.sysmem.pages_in_use() > 0);

    space.destroy_range(VirtAddr::new(BASE)).unwrap();
    assert!(space.blocks().is_empty());
    assert_eq!(sim.sysmem.pages_in_use(), 0);
    assert_eq!(sim.gpu(0).pool.free_bytes(), free);
}

#[test]
fn test_channel_error_latches_the_space() {
    let sim = one_gpu(4);
    let space = &sim.space;
    space.create_range(VirtAddr::new(BASE), PAGE_SIZE_2M, VaPolicy::default()).unwrap();
    space.migrate(VirtAddr::new(BASE), 16 * PAGE_SIZE, gpu(0)).unwrap();

    sim.gpu(0).engine.inject_channel_error(ChannelType::GpuToCpu);
    let fatal = Error::GpuFatal(GpuId::new(0));
    assert_eq!(space.migrate(VirtAddr::new(BASE), 16 * PAGE_SIZE, ProcessorId::CPU), Err(fatal));

    assert_eq!(space.status(), Err(fatal));
    assert_eq!(space.cpu_fault(VirtAddr::new(BASE), AccessType::Read), Err(fatal));
    assert_eq!(
        space.create_range(VirtAddr::new(BASE + PAGE_SIZE_2M), PAGE_SIZE_2M, VaPolicy::default()).unwrap_err(),
        fatal
    );
    let events = sim.events.drain();
    assert!(events.iter().any(|e| matches!(e, ToolsEvent::FatalError { .. })));
}

#[test]
fn test_reported_fatal_error_latches_the_space() {
    let sim = two_gpus();
    let space = &sim.space;
    space.create_range(VirtAddr::new(BASE), PAGE_SIZE_2M, VaPolicy::default()).unwrap();
    let fatal = space.mark_gpu_fatal(GpuId::new(1));
    assert_eq!(fatal, Error::GpuFatal(GpuId::new(1)));
    assert_eq!(space.gpu_faults(&[fault(0, BASE, AccessType::Read)]).unwrap_err(), fatal);
    assert_eq!(space.migrate(VirtAddr::new(BASE), PAGE_SIZE, gpu(0)), Err(fatal));
}

// =============================================================================
// MIXED WORKLOAD
// =============================================================================

/// Small deterministic generator for the mixed workload
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

#[test]
fn test_mixed_faults_keep_invariants() {
    let sim = SimBuilder::new()
        .gpu(SimGpuSpec::new(4))
        .gpu(SimGpuSpec::new(4))
        .peer(0, 1, LinkKind::NvLink)
        .native_atomics(gpu(0), ProcessorId::CPU)
        .build()
        .unwrap();
    let space = &sim.space;
    let policy = VaPolicy {
        read_duplication: true,
        ..VaPolicy::default()
    };
    space.create_range(VirtAddr::new(BASE), PAGE_SIZE_2M, policy).unwrap();

    let mut rng = Lcg(42);
    for step in 0..80 {
        // Spaced past the thrashing lapse
        sim.clock.advance(NSEC_PER_MSEC);
        let page = rng.next(8) as usize;
        let addr = page_addr(page);
        match rng.next(3) {
            0 => {
                let access = if rng.next(2) == 0 { AccessType::Read } else { AccessType::Write };
                assert_eq!(
                    space.cpu_fault(VirtAddr::new(addr), access),
                    Ok(CpuFaultOutcome::Serviced),
                    "step {}",
                    step
                );
            }
            n => {
                let access = match rng.next(3) {
                    0 => AccessType::Read,
                    1 => AccessType::Write,
                    _ => AccessType::Atomic,
                };
                let result = space.gpu_faults(&[fault(n as u8 - 1, addr, access)]).unwrap();
                assert_eq!(result.serviced, 1, "step {}", step);
            }
        }

        let block = space.block_at(VirtAddr::new(BASE)).unwrap();
        for page in 0..8 {
            let residents = block.resident_processors(page);
            let writable = [ProcessorId::CPU, gpu(0), gpu(1)]
                .iter()
                .any(|p| block.prot(*p, page).is_writable());
            if writable {
                assert_eq!(residents.weight(), 1, "step {} page {}", step, page);
            }
            assert_eq!(block.read_duplicated().test(page), residents.weight() >= 2);
            assert_ne!(block.prot(ProcessorId::CPU, page), Prot::ReadWriteAtomic);
        }
        assert_consistent(&sim);
    }
    assert!(space.stats().gpu_faults > 0);
}
