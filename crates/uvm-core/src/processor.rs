//! # Processors
//!
//! Processor identifiers and processor masks.
//!
//! Processor 0 is always the CPU; GPU `n` is processor `n + 1`. Masks are a
//! single machine word so they can be copied freely and stored per page in
//! the thrashing records.

use core::fmt;

// =============================================================================
// LIMITS
// =============================================================================

/// Maximum number of GPUs a VA space can register
pub const MAX_GPUS: usize = 32;
/// Maximum number of processors (CPU + GPUs)
pub const MAX_PROCESSORS: usize = MAX_GPUS + 1;

static_assertions::const_assert!(MAX_PROCESSORS <= 64);

// =============================================================================
// GPU ID
// =============================================================================

/// GPU identifier (dense index, `0..MAX_GPUS`)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuId(u8);

impl GpuId {
    /// Create a new GPU id
    ///
    /// # Panics
    ///
    /// Panics if the index is not below `MAX_GPUS`.
    #[inline]
    pub const fn new(index: u8) -> Self {
        assert!((index as usize) < MAX_GPUS);
        Self(index)
    }

    /// Dense index of the GPU
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for GpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPU{}", self.0)
    }
}

impl fmt::Display for GpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPU{}", self.0)
    }
}

// =============================================================================
// PROCESSOR ID
// =============================================================================

/// CPU or GPU processor identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ProcessorId(u8);

impl ProcessorId {
    /// The CPU
    pub const CPU: ProcessorId = ProcessorId(0);

    /// Processor id of a GPU
    #[inline]
    pub const fn from_gpu(gpu: GpuId) -> Self {
        Self(gpu.0 + 1)
    }

    /// Create from a raw dense index (`0` is the CPU)
    #[inline]
    pub const fn from_index(index: usize) -> Self {
        assert!(index < MAX_PROCESSORS);
        Self(index as u8)
    }

    /// Dense index (`0` is the CPU)
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Is this the CPU?
    #[inline]
    pub const fn is_cpu(self) -> bool {
        self.0 == 0
    }

    /// GPU id, if this is a GPU
    #[inline]
    pub const fn gpu(self) -> Option<GpuId> {
        if self.0 == 0 {
            None
        } else {
            Some(GpuId(self.0 - 1))
        }
    }
}

impl From<GpuId> for ProcessorId {
    fn from(gpu: GpuId) -> Self {
        Self::from_gpu(gpu)
    }
}

impl fmt::Debug for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.gpu() {
            Some(gpu) => write!(f, "{:?}", gpu),
            None => write!(f, "CPU"),
        }
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// PROCESSOR MASK
// =============================================================================

/// Set of processors
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ProcessorMask(u64);

impl ProcessorMask {
    /// Empty mask
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Mask holding one processor
    #[inline]
    pub const fn single(id: ProcessorId) -> Self {
        Self(1 << id.0)
    }

    /// Raw bits
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Build from raw bits
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Add a processor
    #[inline]
    pub fn set(&mut self, id: ProcessorId) {
        self.0 |= 1 << id.0;
    }

    /// Remove a processor
    #[inline]
    pub fn clear(&mut self, id: ProcessorId) {
        self.0 &= !(1 << id.0);
    }

    /// Is the processor in the mask?
    #[inline]
    pub const fn test(self, id: ProcessorId) -> bool {
        self.0 & (1 << id.0) != 0
    }

    /// Set or clear depending on `value`
    #[inline]
    pub fn assign(&mut self, id: ProcessorId, value: bool) {
        if value {
            self.set(id);
        } else {
            self.clear(id);
        }
    }

    /// Is the mask empty?
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of processors in the mask
    #[inline]
    pub const fn weight(self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest processor in the mask
    #[inline]
    pub fn first(self) -> Option<ProcessorId> {
        if self.0 == 0 {
            None
        } else {
            Some(ProcessorId(self.0.trailing_zeros() as u8))
        }
    }

    /// Intersection
    #[inline]
    pub const fn and(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Union
    #[inline]
    pub const fn or(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Members of `self` not in `other`
    #[inline]
    pub const fn andnot(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Mask without the given processor
    #[inline]
    pub const fn without(self, id: ProcessorId) -> Self {
        Self(self.0 & !(1 << id.0))
    }

    /// Mask with the given processor added
    #[inline]
    pub const fn with(self, id: ProcessorId) -> Self {
        Self(self.0 | (1 << id.0))
    }

    /// Is every member of `other` also in `self`?
    #[inline]
    pub const fn contains_all(self, other: Self) -> bool {
        other.0 & !self.0 == 0
    }

    /// Iterate members in ascending processor order
    #[inline]
    pub fn iter(self) -> ProcessorMaskIter {
        ProcessorMaskIter(self.0)
    }

    /// Iterate GPU members in ascending order
    pub fn gpus(self) -> impl Iterator<Item = GpuId> {
        self.iter().filter_map(ProcessorId::gpu)
    }
}

impl fmt::Debug for ProcessorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<ProcessorId> for ProcessorMask {
    fn from_iter<I: IntoIterator<Item = ProcessorId>>(iter: I) -> Self {
        let mut mask = Self::empty();
        for id in iter {
            mask.set(id);
        }
        mask
    }
}

/// Iterator over a processor mask
#[derive(Debug, Clone)]
pub struct ProcessorMaskIter(u64);

impl Iterator for ProcessorMaskIter {
    type Item = ProcessorId;

    fn next(&mut self) -> Option<ProcessorId> {
        if self.0 == 0 {
            return None;
        }
        let bit = self.0.trailing_zeros();
        self.0 &= self.0 - 1;
        Some(ProcessorId(bit as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processor_ids() {
        let gpu = GpuId::new(3);
        let id = ProcessorId::from_gpu(gpu);
        assert_eq!(id.index(), 4);
        assert_eq!(id.gpu(), Some(gpu));
        assert!(ProcessorId::CPU.is_cpu());
        assert_eq!(ProcessorId::CPU.gpu(), None);
    }

    #[test]
    fn test_processor_mask() {
        let g0 = ProcessorId::from_gpu(GpuId::new(0));
        let g2 = ProcessorId::from_gpu(GpuId::new(2));

        let mut mask = ProcessorMask::empty();
        mask.set(g2);
        mask.set(ProcessorId::CPU);
        mask.set(g0);

        assert_eq!(mask.weight(), 3);
        assert_eq!(mask.first(), Some(ProcessorId::CPU));
        let order: alloc::vec::Vec<_> = mask.iter().collect();
        assert_eq!(order, alloc::vec![ProcessorId::CPU, g0, g2]);

        mask.clear(ProcessorId::CPU);
        assert_eq!(mask.gpus().count(), 2);
        assert!(mask.contains_all(ProcessorMask::single(g0)));
        assert!(mask.andnot(ProcessorMask::single(g0)).test(g2));
    }
}
