//! # Completion Tracking
//!
//! Fence tokens and the trackers that aggregate them.
//!
//! Every push completes by advancing a monotonically increasing value on its
//! channel. A [`Tracker`] keeps the largest outstanding value per channel, so
//! waiting on it waits for everything it was ever handed.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;
use uvm_core::{GpuId, Result};

// =============================================================================
// CHANNEL ID
// =============================================================================

/// Identifies one copy-engine channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId {
    /// Owning GPU
    pub gpu: GpuId,
    /// Channel index on that GPU
    pub index: u16,
}

impl ChannelId {
    /// Create a channel id
    #[inline]
    pub const fn new(gpu: GpuId, index: u16) -> Self {
        Self { gpu, index }
    }
}

// =============================================================================
// FENCES
// =============================================================================

/// Completion state of a set of channels
pub trait FenceSource: Send + Sync {
    /// Has `channel` reached `value`? Errored channels report complete.
    fn is_complete(&self, channel: ChannelId, value: u64) -> bool;

    /// Block until `channel` reaches `value`
    ///
    /// Fails with `ChannelError` if the channel faulted.
    fn wait(&self, channel: ChannelId, value: u64) -> Result<()>;
}

/// Completion value of one push
#[derive(Clone)]
pub struct FenceToken {
    channel: ChannelId,
    value: u64,
    source: Arc<dyn FenceSource>,
}

impl FenceToken {
    /// Create a token; used by copy-engine implementations
    pub fn new(channel: ChannelId, value: u64, source: Arc<dyn FenceSource>) -> Self {
        Self {
            channel,
            value,
            source,
        }
    }

    /// Channel
    #[inline]
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Completion value
    #[inline]
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Has the push completed?
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.source.is_complete(self.channel, self.value)
    }

    /// Wait for the push
    #[inline]
    pub fn wait(&self) -> Result<()> {
        self.source.wait(self.channel, self.value)
    }
}

impl fmt::Debug for FenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FenceToken({:?}#{} @ {})", self.channel.gpu, self.channel.index, self.value)
    }
}

// =============================================================================
// TRACKER
// =============================================================================

/// Outstanding work, one entry per channel
#[derive(Debug, Clone, Default)]
pub struct Tracker {
    entries: HashMap<ChannelId, FenceToken>,
}

impl Tracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a token; older values on the same channel are subsumed
    pub fn add(&mut self, token: FenceToken) {
        match self.entries.get(&token.channel) {
            Some(existing) if existing.value >= token.value => {}
            _ => {
                self.entries.insert(token.channel, token);
            }
        }
    }

    /// Track everything `other` tracks
    pub fn merge(&mut self, other: &Tracker) {
        for token in other.entries.values() {
            self.add(token.clone());
        }
    }

    /// Number of channels with outstanding work
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Nothing tracked?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tokens currently tracked
    pub fn tokens(&self) -> impl Iterator<Item = &FenceToken> {
        self.entries.values()
    }

    /// Is all tracked work complete?
    pub fn is_complete(&self) -> bool {
        self.entries.values().all(FenceToken::is_complete)
    }

    /// Drop entries that have completed
    pub fn remove_completed(&mut self) {
        self.entries.retain(|_, token| !token.is_complete());
    }

    /// Wait for all tracked work, then forget it
    ///
    /// Waits on every channel even after a failure; the first error is
    /// returned.
    pub fn wait(&mut self) -> Result<()> {
        let mut tokens: Vec<FenceToken> = self.entries.drain().map(|(_, t)| t).collect();
        tokens.sort_unstable_by_key(|t| t.channel);
        let mut result = Ok(());
        for token in tokens {
            if let Err(err) = token.wait() {
                log::warn!("wait on {:?} failed: {}", token, err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Forget all tracked work without waiting
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
