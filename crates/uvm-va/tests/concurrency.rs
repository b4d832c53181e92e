//! Several threads driving one [`VaSpace`] at once.
//!
//! Blocks serialize on their own lock, range and block creation on the
//! space's layout lock, and eviction reaches into whichever block holds the
//! victim root. With two roots per GPU and four blocks, every thread keeps
//! forcing the others' data off the GPUs. Each thread owns a disjoint set of
//! pages and checks that its data survives everything the others do.

use std::thread;

use uvm_core::clock::NSEC_PER_MSEC;
use uvm_core::{AccessType, Error, GpuId, LinkKind, ProcessorId, VirtAddr, PAGE_SIZE, PAGE_SIZE_2M};
use uvm_va::{CpuFaultOutcome, GpuFault, SimBuilder, SimGpuSpec, SimSystem, VaPolicy, VaSpace};

const BASE: u64 = 0x8000_0000;
const BLOCKS: u64 = 4;
/// Pages used at the start of every block
const SPAN: u64 = 32;
const STEPS: usize = 150;

fn gpu(n: u8) -> ProcessorId {
    ProcessorId::from_gpu(GpuId::new(n))
}

/// Small deterministic generator, one per thread
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

fn system() -> SimSystem {
    let sim = SimBuilder::new()
        .gpu(SimGpuSpec::new(2))
        .gpu(SimGpuSpec::new(2))
        .peer(0, 1, LinkKind::NvLink)
        .build()
        .unwrap();
    let policy = VaPolicy {
        read_duplication: true,
        ..VaPolicy::default()
    };
    sim.space
        .create_range(VirtAddr::new(BASE), BLOCKS * PAGE_SIZE_2M, policy)
        .unwrap();
    sim
}

/// Address of the `slot`th page in the working set
fn slot_addr(slot: u64) -> u64 {
    BASE + (slot / SPAN) * PAGE_SIZE_2M + (slot % SPAN) * PAGE_SIZE
}

fn page_data(slot: u64, generation: u8) -> Vec<u8> {
    (0..PAGE_SIZE as usize)
        .map(|i| (i as u8).wrapping_mul(13) ^ (slot as u8).wrapping_add(generation))
        .collect()
}

fn read_page(space: &VaSpace, addr: u64) -> Vec<u8> {
    let mut buf = vec![0u8; PAGE_SIZE as usize];
    space.read(VirtAddr::new(addr), &mut buf).unwrap();
    buf
}

/// Allocation can still run dry when every retry loses its memory to another
/// thread; nothing else may fail
fn tolerate<T>(result: Result<T, Error>, what: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(Error::OutOfMemory) => None,
        Err(err) => panic!("{} failed: {:?}", what, err),
    }
}

/// Random faults and migrations across every block; writes only to the
/// slots of `worker`. Returns the last generation written per owned slot.
fn run_worker(sim: &SimSystem, worker: u64, workers: u64, seed: u64) -> Vec<(u64, u8)> {
    let space = &sim.space;
    let total = BLOCKS * SPAN;
    let owned: Vec<u64> = (0..total).filter(|slot| slot % workers == worker).collect();
    let mut written: Vec<(u64, u8)> = Vec::with_capacity(owned.len());
    for &slot in &owned {
        let data = page_data(slot, 0);
        space.write(VirtAddr::new(slot_addr(slot)), &data).unwrap();
        written.push((slot, 0));
    }

    let mut rng = Lcg(seed);
    for step in 0..STEPS {
        if rng.next(4) == 0 {
            sim.clock.advance(NSEC_PER_MSEC);
        }
        let slot = rng.next(total);
        let addr = slot_addr(slot);
        match rng.next(6) {
            0 => {
                let index = rng.next(owned.len() as u64) as usize;
                let (mine, generation) = &mut written[index];
                *generation = generation.wrapping_add(1);
                space
                    .write(VirtAddr::new(slot_addr(*mine)), &page_data(*mine, *generation))
                    .unwrap();
            }
            1 => {
                let access = if rng.next(2) == 0 { AccessType::Read } else { AccessType::Write };
                if let Some(CpuFaultOutcome::Throttled { until_ns }) =
                    tolerate(space.cpu_fault(VirtAddr::new(addr), access), "CPU fault")
                {
                    assert!(until_ns > 0);
                }
            }
            2 | 3 => {
                let access = match rng.next(3) {
                    0 => AccessType::Read,
                    1 => AccessType::Write,
                    _ => AccessType::Atomic,
                };
                let fault = GpuFault {
                    gpu: GpuId::new(rng.next(2) as u8),
                    addr: VirtAddr::new(addr),
                    access,
                    instance: 0x2000 + worker,
                };
                if let Some(result) = tolerate(space.gpu_faults(&[fault]), "GPU fault") {
                    assert!(result.cancelled.is_empty(), "step {}: {:?}", step, result.cancelled);
                }
            }
            4 => {
                let dst = match rng.next(3) {
                    0 => ProcessorId::CPU,
                    n => gpu(n as u8 - 1),
                };
                // Whole blocks take a root each
                let (start, len) = if rng.next(3) == 0 {
                    (BASE + (slot / SPAN) * PAGE_SIZE_2M, PAGE_SIZE_2M)
                } else {
                    (addr, (1 + rng.next(8)).min(SPAN - slot % SPAN) * PAGE_SIZE)
                };
                tolerate(space.migrate(VirtAddr::new(start), len, dst), "migration");
            }
            _ => {
                let index = rng.next(owned.len() as u64) as usize;
                let (mine, generation) = written[index];
                assert_eq!(
                    read_page(space, slot_addr(mine)),
                    page_data(mine, generation),
                    "worker {} step {} slot {}",
                    worker,
                    step,
                    mine
                );
            }
        }
    }
    written
}

fn assert_settled(sim: &SimSystem, written: &[(u64, u8)]) {
    let violations = sim.space.verify();
    assert!(violations.is_empty(), "{:?}", violations);
    assert_eq!(sim.coherence_violations(), 0);
    for &(slot, generation) in written {
        assert_eq!(read_page(&sim.space, slot_addr(slot)), page_data(slot, generation), "slot {}", slot);
    }
}

#[test]
fn test_single_worker_under_eviction_pressure() {
    let sim = system();
    for block in 0..BLOCKS {
        let start = VirtAddr::new(BASE + block * PAGE_SIZE_2M);
        sim.space.migrate(start, PAGE_SIZE_2M, gpu(0)).unwrap();
    }
    assert_eq!(sim.gpu(0).pool.stats().evictions, 2);
    let written = run_worker(&sim, 0, 1, 7);
    assert_settled(&sim, &written);
}

#[test]
fn test_parallel_workers_keep_blocks_consistent() {
    const WORKERS: u64 = 4;
    let sim = system();
    let written: Vec<(u64, u8)> = thread::scope(|scope| {
        let handles: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let sim = &sim;
                scope.spawn(move || run_worker(sim, worker, WORKERS, 0x5eed + worker * 977))
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });
    assert_eq!(written.len() as u64, BLOCKS * SPAN);
    assert_settled(&sim, &written);
    assert!(sim.space.stats().migrations > 0);
}

#[test]
fn test_parallel_range_creation_and_faults() {
    // Block creation takes the layout lock for writing while other threads
    // service faults under it
    let sim = SimBuilder::new().gpu(SimGpuSpec::new(2)).build().unwrap();
    thread::scope(|scope| {
        for worker in 0..4u64 {
            let sim = &sim;
            scope.spawn(move || {
                let start = BASE + worker * 2 * PAGE_SIZE_2M;
                sim.space
                    .create_range(VirtAddr::new(start), PAGE_SIZE_2M, VaPolicy::default())
                    .unwrap();
                let data = page_data(worker, 1);
                sim.space.write(VirtAddr::new(start), &data).unwrap();
                for page in 0..8 {
                    let fault = GpuFault {
                        gpu: GpuId::new(0),
                        addr: VirtAddr::new(start + page * PAGE_SIZE),
                        access: AccessType::Write,
                        instance: 0x3000 + worker,
                    };
                    tolerate(sim.space.gpu_faults(&[fault]), "GPU fault");
                }
                assert_eq!(read_page(&sim.space, start), data);
            });
        }
    });
    assert_eq!(sim.space.ranges().len(), 4);
    assert!(sim.space.verify().is_empty());
    assert_eq!(sim.coherence_violations(), 0);
}
