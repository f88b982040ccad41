//! Concurrent bitmap.
//!
//! A heap-allocated array of word-sized atomic blocks addressed by bit
//! index. Single-bit operations are atomic and linearizable; the bulk
//! operations ([`union`](Bitmap::union), [`intersection`](Bitmap::intersection),
//! [`intersection_negate`](Bitmap::intersection_negate)) are atomic per
//! word but **not** linearizable across the whole map: a concurrent
//! reader may observe some words updated and others not.
//!
//! Bits at positions past the declared count are kept zero at all
//! times; bulk operations mask the trailing partial word to preserve
//! that.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::cc;

const WORD_BITS: usize = usize::BITS as usize;

#[inline]
const fn block_of(n: usize) -> usize {
    n / WORD_BITS
}

#[inline]
const fn mask_of(n: usize) -> usize {
    1 << (n % WORD_BITS)
}

/// Mask covering the valid bits of the trailing word.
#[inline]
const fn tail_mask(n_bits: usize) -> usize {
    if n_bits % WORD_BITS == 0 {
        usize::MAX
    } else {
        (1 << (n_bits % WORD_BITS)) - 1
    }
}

/// A concurrent bitmap over a fixed number of bits.
pub struct Bitmap {
    n_bits: usize,
    map: Box<[AtomicUsize]>,
}

impl Bitmap {
    /// Create a bitmap of `n_bits` bits, all clear.
    pub fn new(n_bits: usize) -> Self {
        let n_words = (n_bits + WORD_BITS - 1) / WORD_BITS;
        let mut words = Vec::with_capacity(n_words);
        words.resize_with(n_words, || AtomicUsize::new(0));
        Self {
            n_bits,
            map: words.into_boxed_slice(),
        }
    }

    /// Declared number of bits.
    #[inline]
    pub fn bits(&self) -> usize {
        self.n_bits
    }

    /// Atomically set bit `n`.
    ///
    /// # Panics
    ///
    /// Panics if `n` is out of range.
    #[inline]
    pub fn set(&self, n: usize) {
        assert!(n < self.n_bits);
        self.map[block_of(n)].fetch_or(mask_of(n), Ordering::SeqCst);
    }

    /// Atomically clear bit `n`.
    ///
    /// # Panics
    ///
    /// Panics if `n` is out of range.
    #[inline]
    pub fn reset(&self, n: usize) {
        assert!(n < self.n_bits);
        self.map[block_of(n)].fetch_and(!mask_of(n), Ordering::SeqCst);
    }

    /// Read bit `n`. Out-of-range positions read as clear.
    #[inline]
    pub fn test(&self, n: usize) -> bool {
        if n >= self.n_bits {
            return false;
        }
        (self.map[block_of(n)].load(Ordering::Acquire) & mask_of(n)) != 0
    }

    /// Atomic bit test-and-set. Returns the previous value of the bit.
    ///
    /// # Panics
    ///
    /// Panics if `n` is out of range.
    #[inline]
    pub fn bts(&self, n: usize) -> bool {
        assert!(n < self.n_bits);
        let mask = mask_of(n);
        (self.map[block_of(n)].fetch_or(mask, Ordering::SeqCst) & mask) != 0
    }

    /// Count set bits at positions `0..limit`, masking the partial
    /// trailing word.
    pub fn count(&self, limit: usize) -> usize {
        let limit = limit.min(self.n_bits);
        let full_words = limit / WORD_BITS;
        let mut total = 0;

        for word in &self.map[..full_words] {
            total += cc::popcount_usize(word.load(Ordering::Acquire)) as usize;
        }
        if limit % WORD_BITS != 0 {
            let partial = self.map[full_words].load(Ordering::Acquire);
            total += cc::popcount_usize(partial & ((1 << (limit % WORD_BITS)) - 1)) as usize;
        }
        total
    }

    /// Count of all set bits.
    #[inline]
    pub fn popcount(&self) -> usize {
        self.count(self.n_bits)
    }

    /// Per-word atomic OR of `src` into `self`. Not linearizable across
    /// words.
    ///
    /// # Panics
    ///
    /// Panics if the bit counts differ.
    pub fn union(&self, src: &Bitmap) {
        assert_eq!(self.n_bits, src.n_bits);
        let last = self.map.len().wrapping_sub(1);
        for (i, (dst, src)) in self.map.iter().zip(src.map.iter()).enumerate() {
            let mut w = src.load(Ordering::Acquire);
            if i == last {
                w &= tail_mask(self.n_bits);
            }
            dst.fetch_or(w, Ordering::SeqCst);
        }
    }

    /// Per-word atomic AND of `src` into `self`. Not linearizable across
    /// words.
    ///
    /// # Panics
    ///
    /// Panics if the bit counts differ.
    pub fn intersection(&self, src: &Bitmap) {
        assert_eq!(self.n_bits, src.n_bits);
        for (dst, src) in self.map.iter().zip(src.map.iter()) {
            dst.fetch_and(src.load(Ordering::Acquire), Ordering::SeqCst);
        }
    }

    /// Per-word atomic AND-NOT: clears in `self` every bit set in
    /// `src`. Not linearizable across words.
    ///
    /// # Panics
    ///
    /// Panics if the bit counts differ.
    pub fn intersection_negate(&self, src: &Bitmap) {
        assert_eq!(self.n_bits, src.n_bits);
        for (dst, src) in self.map.iter().zip(src.map.iter()) {
            dst.fetch_and(!src.load(Ordering::Acquire), Ordering::SeqCst);
        }
    }

    /// Store zero into every word.
    pub fn clear(&self) {
        for word in self.map.iter() {
            word.store(0, Ordering::Release);
        }
    }

    /// Iterate over set bit positions. Each word is loaded once and
    /// drained from its cached value, so bits flipped mid-iteration in
    /// an already-visited word are not observed.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            bitmap: self,
            cache: 0,
            n_block: 0,
            primed: false,
        }
    }
}

/// Word-caching iterator over set bits.
pub struct Iter<'a> {
    bitmap: &'a Bitmap,
    cache: usize,
    n_block: usize,
    primed: bool,
}

impl<'a> Iterator for Iter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if !self.primed {
                if self.n_block >= self.bitmap.map.len() {
                    return None;
                }
                self.cache = self.bitmap.map[self.n_block].load(Ordering::Acquire);
                self.primed = true;
            }

            if self.cache == 0 {
                self.n_block += 1;
                self.primed = false;
                continue;
            }

            let n = self.n_block * WORD_BITS + cc::ctz_usize(self.cache) as usize;
            self.cache &= self.cache - 1;
            return Some(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_reset_test() {
        let bm = Bitmap::new(130);
        assert!(!bm.test(0));
        bm.set(0);
        bm.set(64);
        bm.set(129);
        assert!(bm.test(0));
        assert!(bm.test(64));
        assert!(bm.test(129));

        bm.reset(64);
        assert!(!bm.test(64));
        assert!(!bm.test(500)); // out of range reads clear
    }

    #[test]
    fn test_bts() {
        let bm = Bitmap::new(64);
        assert!(!bm.bts(5));
        assert!(bm.bts(5));
        assert!(bm.test(5));
    }

    #[test]
    fn test_count_with_limit() {
        let bm = Bitmap::new(200);
        for n in [0, 63, 64, 100, 199] {
            bm.set(n);
        }
        assert_eq!(bm.popcount(), 5);
        assert_eq!(bm.count(64), 2); // 0, 63
        assert_eq!(bm.count(101), 4); // + 64, 100
        assert_eq!(bm.count(usize::MAX), 5); // clamped
    }

    #[test]
    fn test_bulk_ops_mask_tail() {
        let a = Bitmap::new(70);
        let b = Bitmap::new(70);
        for n in 0..70 {
            b.set(n);
        }

        a.union(&b);
        assert_eq!(a.popcount(), 70);

        // Bits past the declared count stayed zero in storage.
        assert_eq!(a.map[1].load(Ordering::Relaxed), tail_mask(70));

        let c = Bitmap::new(70);
        c.set(3);
        c.set(69);
        a.intersection(&c);
        assert_eq!(a.popcount(), 2);

        a.intersection_negate(&c);
        assert_eq!(a.popcount(), 0);
    }

    #[test]
    fn test_clear() {
        let bm = Bitmap::new(100);
        for n in 0..100 {
            bm.set(n);
        }
        bm.clear();
        assert_eq!(bm.popcount(), 0);
    }

    #[test]
    fn test_iter_positions() {
        let bm = Bitmap::new(200);
        let expected = [0usize, 1, 63, 64, 127, 128, 199];
        for &n in &expected {
            bm.set(n);
        }

        let seen: alloc::vec::Vec<usize> = bm.iter().collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_iter_empty() {
        let bm = Bitmap::new(256);
        assert_eq!(bm.iter().next(), None);
    }

    #[test]
    fn test_random_ops_against_model() {
        use rand::{Rng, SeedableRng};
        use std::collections::HashSet;

        let mut rng = rand::rngs::StdRng::seed_from_u64(0x1757);
        let bm = Bitmap::new(300);
        let mut model: HashSet<usize> = HashSet::new();

        for _ in 0..20_000 {
            let n = rng.gen_range(0..300);
            match rng.gen_range(0..4) {
                0 => {
                    bm.set(n);
                    model.insert(n);
                }
                1 => {
                    bm.reset(n);
                    model.remove(&n);
                }
                2 => {
                    assert_eq!(bm.bts(n), !model.insert(n));
                }
                _ => {
                    assert_eq!(bm.test(n), model.contains(&n));
                }
            }
        }

        assert_eq!(bm.popcount(), model.len());
        let seen: HashSet<usize> = bm.iter().collect();
        assert_eq!(seen, model);
    }
}
