//! # Software Copy Engine
//!
//! A [`CopyEngine`] that executes pushes against [`PhysMemory`] on the host.
//!
//! Each channel is a FIFO with a monotonically increasing completion value.
//! In [`ExecMode::Immediate`] a push runs as soon as it is submitted; in
//! [`ExecMode::Deferred`] it stays queued until someone waits for it or
//! [`SoftCopyEngine::process_all`] is called, which lets tests observe
//! in-flight state.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;
use uvm_core::{Error, GpuId, MemAddr, PhysAddr, Result, PAGE_SIZE};

use crate::memory::{swizzled_offset, PhysMemory};
use crate::push::{ChannelType, CompletionFn, CopyAddr, CopyEngine, Push, PushOp};
use crate::tracker::{ChannelId, FenceSource, FenceToken, Tracker};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// When submitted pushes execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// At submission
    Immediate,
    /// On demand
    Deferred,
}

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Accepting work
    Ready,
    /// Faulted; all later work is dropped
    Error,
}

/// Engine statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Pushes submitted
    pub pushes: u64,
    /// Bytes copied
    pub bytes_copied: u64,
    /// Bytes filled
    pub bytes_set: u64,
}

// =============================================================================
// CHANNELS
// =============================================================================

struct Pending {
    value: u64,
    wait_on: Tracker,
    ops: Vec<PushOp>,
    callbacks: Vec<CompletionFn>,
}

struct Channel {
    state: ChannelState,
    submitted: u64,
    completed: u64,
    inject_error: bool,
    queue: VecDeque<Pending>,
}

impl Channel {
    const fn new() -> Self {
        Self {
            state: ChannelState::Ready,
            submitted: 0,
            completed: 0,
            inject_error: false,
            queue: VecDeque::new(),
        }
    }

    fn fail(&mut self) -> Vec<Pending> {
        self.state = ChannelState::Error;
        self.queue.drain(..).collect()
    }
}

struct EngineInner {
    gpu: GpuId,
    mode: ExecMode,
    memory: Arc<PhysMemory>,
    channels: [Mutex<Channel>; ChannelType::COUNT],
    stats: Mutex<EngineStats>,
}

impl EngineInner {
    fn channel(&self, id: ChannelId) -> Option<&Mutex<Channel>> {
        (id.gpu == self.gpu).then(|| self.channels.get(id.index as usize)).flatten()
    }

    /// Execute queued pushes on `index` up to `target`
    fn process(&self, index: usize, target: u64) -> Result<()> {
        let channel = &self.channels[index];
        loop {
            let (value, wait_on) = {
                let ch = channel.lock();
                if ch.completed >= target {
                    return Ok(());
                }
                if ch.state == ChannelState::Error {
                    return Err(Error::ChannelError);
                }
                match ch.queue.front() {
                    Some(p) => (p.value, p.wait_on.clone()),
                    None => return Ok(()),
                }
            };

            // Dependencies may live on other channels of this engine
            let mut wait_on = wait_on;
            let deps = wait_on.wait();

            let (callbacks, result) = {
                let mut ch = channel.lock();
                if ch.queue.front().map(|p| p.value) != Some(value) {
                    continue;
                }
                if deps.is_err() || ch.inject_error {
                    ch.inject_error = false;
                    let dropped = ch.fail();
                    log::error!(
                        "{:?}: channel {:?} faulted at push {}, dropping {} pushes",
                        self.gpu,
                        ChannelType::ALL[index],
                        value,
                        dropped.len()
                    );
                    (Vec::new(), Err(Error::ChannelError))
                } else {
                    let Some(pending) = ch.queue.pop_front() else {
                        continue;
                    };
                    for op in &pending.ops {
                        self.execute(op);
                    }
                    ch.completed = pending.value;
                    (pending.callbacks, Ok(()))
                }
            };
            for callback in callbacks {
                callback();
            }
            result?;
        }
    }

    fn execute(&self, op: &PushOp) {
        let mut stats = self.stats.lock();
        match *op {
            PushOp::Copy { dst, src, size } => {
                let mut buf = alloc::vec![0u8; size as usize];
                for_each_piece(src, size, |mem, at, len| {
                    self.memory.read_bytes(mem, &mut buf[at..at + len]);
                });
                for_each_piece(dst, size, |mem, at, len| {
                    self.memory.write_bytes(mem, &buf[at..at + len]);
                });
                stats.bytes_copied += size;
            }
            PushOp::Memset { dst, value, size } => {
                for_each_piece(dst, size, |mem, _, len| {
                    self.memory.fill_bytes(mem, value, len as u64);
                });
                stats.bytes_set += size;
            }
        }
    }
}

/// Visit the physical pieces of `[addr, addr + size)`, none crossing a page
fn for_each_piece(addr: CopyAddr, size: u64, mut f: impl FnMut(MemAddr, usize, usize)) {
    let Some(big) = addr.swizzled else {
        f(addr.mem, 0, size as usize);
        return;
    };
    let mut done = 0u64;
    while done < size {
        let phys = addr.mem.addr.raw() + done;
        let len = (PAGE_SIZE - phys % PAGE_SIZE).min(size - done);
        let mem = MemAddr::new(addr.mem.aperture, PhysAddr::new(swizzled_offset(phys, big)));
        f(mem, done as usize, len as usize);
        done += len;
    }
}

impl FenceSource for EngineInner {
    fn is_complete(&self, channel: ChannelId, value: u64) -> bool {
        self.channel(channel).map_or(true, |ch| {
            let ch = ch.lock();
            ch.completed >= value || ch.state == ChannelState::Error
        })
    }

    fn wait(&self, channel: ChannelId, value: u64) -> Result<()> {
        let Some(ch) = self.channel(channel) else {
            return Err(Error::InvalidParameter);
        };
        {
            let ch = ch.lock();
            if ch.completed >= value {
                return Ok(());
            }
            if ch.state == ChannelState::Error {
                return Err(Error::ChannelError);
            }
        }
        self.process(channel.index as usize, value)?;
        if ch.lock().completed >= value {
            Ok(())
        } else {
            Err(Error::ChannelError)
        }
    }
}

// =============================================================================
// SOFT COPY ENGINE
// =============================================================================

/// Host-executed copy engine for one GPU
#[derive(Clone)]
pub struct SoftCopyEngine {
    inner: Arc<EngineInner>,
}

impl SoftCopyEngine {
    /// Create an engine writing to `memory`
    pub fn new(gpu: GpuId, memory: Arc<PhysMemory>, mode: ExecMode) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                gpu,
                mode,
                memory,
                channels: core::array::from_fn(|_| Mutex::new(Channel::new())),
                stats: Mutex::new(EngineStats::default()),
            }),
        }
    }

    /// Make the next push executed on `channel` fault
    pub fn inject_channel_error(&self, channel: ChannelType) {
        self.inner.channels[channel.index()].lock().inject_error = true;
    }

    /// State of a channel
    pub fn channel_state(&self, channel: ChannelType) -> ChannelState {
        self.inner.channels[channel.index()].lock().state
    }

    /// Pushes submitted but not yet executed
    pub fn pending(&self) -> usize {
        self.inner.channels.iter().map(|ch| ch.lock().queue.len()).sum()
    }

    /// Execute everything queued
    ///
    /// Returns the first channel error hit.
    pub fn process_all(&self) -> Result<()> {
        let mut result = Ok(());
        for index in 0..ChannelType::COUNT {
            let target = self.inner.channels[index].lock().submitted;
            if let Err(err) = self.inner.process(index, target) {
                result = result.and(Err(err));
            }
        }
        result
    }

    /// Statistics snapshot
    pub fn stats(&self) -> EngineStats {
        *self.inner.stats.lock()
    }
}

impl CopyEngine for SoftCopyEngine {
    fn gpu(&self) -> GpuId {
        self.inner.gpu
    }

    fn begin_push(&self, channel: ChannelType, wait_on: &Tracker, description: &str) -> Result<Push> {
        if self.inner.channels[channel.index()].lock().state == ChannelState::Error {
            return Err(Error::ChannelError);
        }
        Ok(Push::new(self.inner.gpu, channel, wait_on, description))
    }

    fn end_push(&self, push: Push) -> Result<FenceToken> {
        let index = push.channel().index();
        log::trace!(
            "{:?}: push '{}' on {:?} with {} ops",
            self.inner.gpu,
            push.description(),
            push.channel(),
            push.ops().len()
        );
        let (wait_on, ops, callbacks) = push.into_parts();
        let value = {
            let mut ch = self.inner.channels[index].lock();
            if ch.state == ChannelState::Error {
                return Err(Error::ChannelError);
            }
            ch.submitted += 1;
            let value = ch.submitted;
            ch.queue.push_back(Pending {
                value,
                wait_on,
                ops,
                callbacks,
            });
            value
        };
        self.inner.stats.lock().pushes += 1;

        let source: Arc<dyn FenceSource> = self.inner.clone();
        let token = FenceToken::new(ChannelId::new(self.inner.gpu, index as u16), value, source);
        if self.inner.mode == ExecMode::Immediate {
            // Faults surface through the token
            if let Err(err) = self.inner.process(index, value) {
                log::debug!("{:?}: push {} failed: {}", self.inner.gpu, value, err);
            }
        }
        Ok(token)
    }
}

impl fmt::Debug for SoftCopyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftCopyEngine")
            .field("gpu", &self.inner.gpu)
            .field("mode", &self.inner.mode)
            .field("pending", &self.pending())
            .finish()
    }
}
