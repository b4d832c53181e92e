//! # Page Masks
//!
//! Fixed-capacity bitmaps with one bit per system page of a VA block.
//!
//! Every residency and mapping bitmap of a block is a [`PageMask`]. All
//! operations are pure and allocation-free; indices are block-relative and
//! validated by callers, so out-of-range indices are a programming error
//! caught by `debug_assert!`.

use core::fmt;
use core::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

use crate::types::PAGES_PER_BLOCK_MAX;

/// Block-relative page index
pub type PageIndex = usize;

const WORD_BITS: usize = 64;
const WORDS: usize = PAGES_PER_BLOCK_MAX / WORD_BITS;

static_assertions::const_assert_eq!(WORDS * WORD_BITS, PAGES_PER_BLOCK_MAX);

// =============================================================================
// PAGE REGION
// =============================================================================

/// Half-open range of page indices `[first, outer)`
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PageRegion {
    /// First page in the region
    pub first: PageIndex,
    /// One past the last page
    pub outer: PageIndex,
}

impl PageRegion {
    /// Create a region
    #[inline]
    pub const fn new(first: PageIndex, outer: PageIndex) -> Self {
        Self { first, outer }
    }

    /// Region covering `pages` pages from index 0
    #[inline]
    pub const fn with_pages(pages: usize) -> Self {
        Self { first: 0, outer: pages }
    }

    /// Region holding a single page
    #[inline]
    pub const fn single(page: PageIndex) -> Self {
        Self { first: page, outer: page + 1 }
    }

    /// Number of pages
    #[inline]
    pub const fn len(&self) -> usize {
        self.outer.saturating_sub(self.first)
    }

    /// Is the region empty?
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.outer <= self.first
    }

    /// Does the region contain the page?
    #[inline]
    pub const fn contains(&self, page: PageIndex) -> bool {
        page >= self.first && page < self.outer
    }

    /// Does the region fully contain `other`?
    #[inline]
    pub const fn contains_region(&self, other: &PageRegion) -> bool {
        other.is_empty() || (other.first >= self.first && other.outer <= self.outer)
    }

    /// Intersection of two regions (possibly empty)
    #[inline]
    pub fn intersect(&self, other: &PageRegion) -> PageRegion {
        let first = self.first.max(other.first);
        let outer = self.outer.min(other.outer).max(first);
        PageRegion { first, outer }
    }

    /// Iterate the page indices
    #[inline]
    pub fn iter(&self) -> core::ops::Range<PageIndex> {
        self.first..self.outer
    }
}

impl fmt::Debug for PageRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.first, self.outer)
    }
}

// =============================================================================
// PAGE MASK
// =============================================================================

/// One bit per page of a VA block
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PageMask {
    words: [u64; WORDS],
}

/// Mask of the bits of word `word` that fall inside `region`
#[inline]
fn word_mask(word: usize, region: &PageRegion) -> u64 {
    let lo = word * WORD_BITS;
    let hi = lo + WORD_BITS;
    let first = region.first.max(lo);
    let outer = region.outer.min(hi);
    if first >= outer {
        return 0;
    }
    let len = outer - first;
    let bits = if len == WORD_BITS { u64::MAX } else { (1u64 << len) - 1 };
    bits << (first - lo)
}

impl PageMask {
    /// Empty mask
    #[inline]
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    /// Mask with every page of the region set
    pub fn from_region(region: PageRegion) -> Self {
        let mut mask = Self::new();
        mask.region_fill(region);
        mask
    }

    /// Mask with a single page set
    pub fn from_page(page: PageIndex) -> Self {
        let mut mask = Self::new();
        mask.set(page);
        mask
    }

    /// Clear every bit
    #[inline]
    pub fn zero(&mut self) {
        self.words = [0; WORDS];
    }

    /// Set every bit (all `PAGES_PER_BLOCK_MAX` pages)
    #[inline]
    pub fn fill(&mut self) {
        self.words = [u64::MAX; WORDS];
    }

    /// Set a page
    #[inline]
    pub fn set(&mut self, page: PageIndex) {
        debug_assert!(page < PAGES_PER_BLOCK_MAX);
        self.words[page / WORD_BITS] |= 1 << (page % WORD_BITS);
    }

    /// Clear a page
    #[inline]
    pub fn clear(&mut self, page: PageIndex) {
        debug_assert!(page < PAGES_PER_BLOCK_MAX);
        self.words[page / WORD_BITS] &= !(1 << (page % WORD_BITS));
    }

    /// Set or clear a page
    #[inline]
    pub fn assign(&mut self, page: PageIndex, value: bool) {
        if value {
            self.set(page);
        } else {
            self.clear(page);
        }
    }

    /// Is the page set?
    #[inline]
    pub fn test(&self, page: PageIndex) -> bool {
        debug_assert!(page < PAGES_PER_BLOCK_MAX);
        self.words[page / WORD_BITS] & (1 << (page % WORD_BITS)) != 0
    }

    /// Set every page in the region
    pub fn region_fill(&mut self, region: PageRegion) {
        for (i, word) in self.words.iter_mut().enumerate() {
            *word |= word_mask(i, &region);
        }
    }

    /// Clear every page in the region
    pub fn region_clear(&mut self, region: PageRegion) {
        for (i, word) in self.words.iter_mut().enumerate() {
            *word &= !word_mask(i, &region);
        }
    }

    /// Is every page of the region set?
    pub fn region_full(&self, region: PageRegion) -> bool {
        self.words
            .iter()
            .enumerate()
            .all(|(i, word)| {
                let m = word_mask(i, &region);
                word & m == m
            })
    }

    /// Is every page of the region clear?
    pub fn region_empty(&self, region: PageRegion) -> bool {
        self.words
            .iter()
            .enumerate()
            .all(|(i, word)| word & word_mask(i, &region) == 0)
    }

    /// Number of set pages in the region
    pub fn region_weight(&self, region: PageRegion) -> usize {
        self.words
            .iter()
            .enumerate()
            .map(|(i, word)| (word & word_mask(i, &region)).count_ones() as usize)
            .sum()
    }

    /// Is the mask empty?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Number of set pages
    #[inline]
    pub fn weight(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Do the masks share a set page?
    #[inline]
    pub fn intersects(&self, other: &PageMask) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Is every set page of `other` also set in `self`?
    #[inline]
    pub fn contains(&self, other: &PageMask) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(a, b)| b & !a == 0)
    }

    /// Pages set in `self` but not in `other`
    #[inline]
    pub fn andnot(&self, other: &PageMask) -> PageMask {
        let mut out = *self;
        for (w, o) in out.words.iter_mut().zip(other.words.iter()) {
            *w &= !o;
        }
        out
    }

    /// Remove the pages of `other`; returns whether anything is left
    #[inline]
    pub fn andnot_assign(&mut self, other: &PageMask) -> bool {
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w &= !o;
        }
        !self.is_empty()
    }

    /// Intersection restricted to a region
    pub fn and_region(&self, region: PageRegion) -> PageMask {
        let mut out = *self;
        for (i, word) in out.words.iter_mut().enumerate() {
            *word &= word_mask(i, &region);
        }
        out
    }

    /// First set page at or after `region.first` and before `region.outer`
    pub fn next_set(&self, region: PageRegion) -> Option<PageIndex> {
        let mut page = region.first;
        while page < region.outer {
            let word = page / WORD_BITS;
            let bits = self.words[word] & word_mask(word, &PageRegion::new(page, region.outer));
            if bits != 0 {
                return Some(word * WORD_BITS + bits.trailing_zeros() as usize);
            }
            page = (word + 1) * WORD_BITS;
        }
        None
    }

    /// First clear page at or after `region.first` and before `region.outer`
    pub fn next_unset(&self, region: PageRegion) -> Option<PageIndex> {
        let mut page = region.first;
        while page < region.outer {
            let word = page / WORD_BITS;
            let bits = !self.words[word] & word_mask(word, &PageRegion::new(page, region.outer));
            if bits != 0 {
                return Some(word * WORD_BITS + bits.trailing_zeros() as usize);
            }
            page = (word + 1) * WORD_BITS;
        }
        None
    }

    /// First set page in the region
    #[inline]
    pub fn first_in_region(&self, region: PageRegion) -> Option<PageIndex> {
        self.next_set(region)
    }

    /// Iterate set pages within a region
    pub fn iter_region(&self, region: PageRegion) -> PageMaskIter<'_> {
        PageMaskIter {
            mask: self,
            region,
        }
    }

    /// Iterate all set pages
    pub fn iter(&self) -> PageMaskIter<'_> {
        self.iter_region(PageRegion::with_pages(PAGES_PER_BLOCK_MAX))
    }

    /// Iterate maximal runs of contiguous set pages within a region
    pub fn subregions(&self, region: PageRegion) -> SubregionIter<'_> {
        SubregionIter {
            mask: self,
            region,
        }
    }

    /// Mask whose page `i` is this mask's page `i + shift`
    ///
    /// Used when bisecting a block: the upper half's bitmaps start at the
    /// split page.
    pub fn shifted_down(&self, shift: usize) -> PageMask {
        let mut out = PageMask::new();
        if shift >= PAGES_PER_BLOCK_MAX {
            return out;
        }
        let word_shift = shift / WORD_BITS;
        let bit_shift = shift % WORD_BITS;
        for i in 0..WORDS {
            let src = i + word_shift;
            if src >= WORDS {
                break;
            }
            let mut value = self.words[src] >> bit_shift;
            if bit_shift != 0 && src + 1 < WORDS {
                value |= self.words[src + 1] << (WORD_BITS - bit_shift);
            }
            out.words[i] = value;
        }
        out
    }

    /// Mask whose page `i + shift` is this mask's page `i`
    pub fn shifted_up(&self, shift: usize) -> PageMask {
        let mut out = PageMask::new();
        if shift >= PAGES_PER_BLOCK_MAX {
            return out;
        }
        let word_shift = shift / WORD_BITS;
        let bit_shift = shift % WORD_BITS;
        for i in (0..WORDS).rev() {
            if i < word_shift {
                break;
            }
            let src = i - word_shift;
            let mut value = self.words[src] << bit_shift;
            if bit_shift != 0 && src >= 1 {
                value |= self.words[src - 1] >> (WORD_BITS - bit_shift);
            }
            out.words[i] = value;
        }
        out
    }
}

impl BitAnd for PageMask {
    type Output = PageMask;

    fn bitand(mut self, rhs: PageMask) -> PageMask {
        self &= rhs;
        self
    }
}

impl BitAndAssign for PageMask {
    fn bitand_assign(&mut self, rhs: PageMask) {
        for (w, o) in self.words.iter_mut().zip(rhs.words.iter()) {
            *w &= o;
        }
    }
}

impl BitOr for PageMask {
    type Output = PageMask;

    fn bitor(mut self, rhs: PageMask) -> PageMask {
        self |= rhs;
        self
    }
}

impl BitOrAssign for PageMask {
    fn bitor_assign(&mut self, rhs: PageMask) {
        for (w, o) in self.words.iter_mut().zip(rhs.words.iter()) {
            *w |= o;
        }
    }
}

impl Not for PageMask {
    type Output = PageMask;

    fn not(mut self) -> PageMask {
        for w in self.words.iter_mut() {
            *w = !*w;
        }
        self
    }
}

impl fmt::Debug for PageMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = PageRegion::with_pages(PAGES_PER_BLOCK_MAX);
        f.debug_list().entries(self.subregions(full)).finish()
    }
}

// =============================================================================
// ITERATORS
// =============================================================================

/// Iterator over set pages
#[derive(Debug, Clone)]
pub struct PageMaskIter<'a> {
    mask: &'a PageMask,
    region: PageRegion,
}

impl Iterator for PageMaskIter<'_> {
    type Item = PageIndex;

    fn next(&mut self) -> Option<PageIndex> {
        let page = self.mask.next_set(self.region)?;
        self.region.first = page + 1;
        Some(page)
    }
}

/// Iterator over contiguous runs of set pages
#[derive(Debug, Clone)]
pub struct SubregionIter<'a> {
    mask: &'a PageMask,
    region: PageRegion,
}

impl Iterator for SubregionIter<'_> {
    type Item = PageRegion;

    fn next(&mut self) -> Option<PageRegion> {
        let first = self.mask.next_set(self.region)?;
        let outer = self
            .mask
            .next_unset(PageRegion::new(first, self.region.outer))
            .unwrap_or(self.region.outer);
        self.region.first = outer;
        Some(PageRegion::new(first, outer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_region_fill_and_weight() {
        let mut mask = PageMask::new();
        mask.region_fill(PageRegion::new(60, 70));
        assert_eq!(mask.weight(), 10);
        assert!(mask.region_full(PageRegion::new(60, 70)));
        assert!(!mask.region_full(PageRegion::new(59, 70)));
        assert!(mask.region_empty(PageRegion::new(0, 60)));
        assert_eq!(mask.region_weight(PageRegion::new(64, 128)), 6);

        mask.region_clear(PageRegion::new(62, 66));
        assert_eq!(mask.weight(), 6);
    }

    #[test]
    fn test_next_set_crosses_words() {
        let mut mask = PageMask::new();
        mask.set(130);
        mask.set(511);
        assert_eq!(mask.next_set(PageRegion::new(0, 512)), Some(130));
        assert_eq!(mask.next_set(PageRegion::new(131, 512)), Some(511));
        assert_eq!(mask.next_set(PageRegion::new(131, 511)), None);
        assert_eq!(mask.next_unset(PageRegion::new(130, 512)), Some(131));
    }

    #[test]
    fn test_subregions() {
        let mut mask = PageMask::new();
        mask.region_fill(PageRegion::new(3, 5));
        mask.region_fill(PageRegion::new(63, 65));
        mask.set(100);

        let runs: Vec<_> = mask.subregions(PageRegion::new(0, 512)).collect();
        assert_eq!(
            runs,
            alloc::vec![
                PageRegion::new(3, 5),
                PageRegion::new(63, 65),
                PageRegion::new(100, 101)
            ]
        );

        let clipped: Vec<_> = mask.subregions(PageRegion::new(4, 64)).collect();
        assert_eq!(clipped, alloc::vec![PageRegion::new(4, 5), PageRegion::new(63, 64)]);
    }

    #[test]
    fn test_set_operations() {
        let a = PageMask::from_region(PageRegion::new(0, 8));
        let b = PageMask::from_region(PageRegion::new(4, 12));

        assert_eq!((a & b).weight(), 4);
        assert_eq!((a | b).weight(), 12);
        assert_eq!(a.andnot(&b).weight(), 4);
        assert!(a.intersects(&b));
        assert!((a | b).contains(&a));
        assert_eq!((!a).weight(), PAGES_PER_BLOCK_MAX - 8);
        assert_eq!(b.and_region(PageRegion::new(0, 6)).weight(), 2);
    }

    #[test]
    fn test_shifts_are_inverse() {
        let mut mask = PageMask::new();
        mask.set(70);
        mask.set(200);
        mask.region_fill(PageRegion::new(300, 340));

        let down = mask.shifted_down(67);
        assert!(down.test(3));
        assert!(down.test(133));
        assert_eq!(down.weight(), mask.weight());

        let up = down.shifted_up(67);
        assert_eq!(up, mask);
        assert!(mask.shifted_down(512).is_empty());
    }
}
