//! Transaction ID permutation.
//!
//! IDs come from a keyed pseudorandom permutation of the configured range: a
//! small balanced Feistel network whose round function is TEA under a random
//! 128-bit key. The Feistel domain is the smallest even power of two covering
//! the range; outputs beyond the range are skipped (cycle walking), so a full
//! pass over the cursor yields every ID in the range exactly once.

use std::ops::RangeInclusive;

const TEA_CYCLES: u32 = 32;
const TEA_DELTA: u32 = 0x9E37_79B9;
const FEISTEL_ROUNDS: u32 = 8;

struct Tea {
    key: [u32; 4],
    cycles: u32,
}

impl Tea {
    fn encrypt(&self, block: [u32; 2]) -> [u32; 2] {
        let [k0, k1, k2, k3] = self.key;
        let [mut y, mut z] = block;
        let mut sum = 0u32;

        for _ in 0..self.cycles {
            sum = sum.wrapping_add(TEA_DELTA);
            y = y.wrapping_add(
                (z << 4).wrapping_add(k0) ^ z.wrapping_add(sum) ^ (z >> 5).wrapping_add(k1),
            );
            z = z.wrapping_add(
                (y << 4).wrapping_add(k2) ^ y.wrapping_add(sum) ^ (y >> 5).wrapping_add(k3),
            );
        }
        [y, z]
    }
}

/// Generator of non-repeating, key-dependent transaction IDs.
pub struct Permutor {
    tea: Tea,
    low: u32,
    length: u32,
    shift: u32,
    mask: u32,
    rounds: u32,
    base: u32,
    step: u32,
}

impl Permutor {
    /// Permutor over `range` with a freshly drawn random key.
    pub fn new(range: RangeInclusive<u16>) -> Self {
        let mut permutor = Self::with_key(rand::random(), range);
        permutor.base = rand::random::<u32>() & permutor.domain_mask();
        permutor
    }

    /// Permutor over `range` with an explicit key and a zero cursor base.
    pub fn with_key(key: [u32; 4], range: RangeInclusive<u16>) -> Self {
        let low = u32::from(*range.start());
        let high = u32::from(*range.end()).max(low);
        let length = high - low + 1;

        let mut width = length.next_power_of_two().trailing_zeros();
        width += width % 2;
        let shift = width / 2;

        Self {
            tea: Tea {
                key,
                cycles: TEA_CYCLES,
            },
            low,
            length,
            shift,
            mask: (1 << shift) - 1,
            rounds: FEISTEL_ROUNDS,
            base: 0,
            step: 0,
        }
    }

    /// Number of distinct IDs produced per cycle.
    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Next ID of the current cycle.
    ///
    /// Once the cursor has walked the whole Feistel domain a new cycle starts
    /// from a fresh random base; the key is kept.
    pub fn next_id(&mut self) -> u16 {
        loop {
            if self.step > self.domain_mask() {
                self.step = 0;
                self.base = rand::random::<u32>() & self.domain_mask();
            }

            let n = self.encrypt(self.base.wrapping_add(self.step) & self.domain_mask());
            self.step += 1;

            if n < self.length {
                return (n + self.low) as u16;
            }
        }
    }

    fn domain_mask(&self) -> u32 {
        (1 << (2 * self.shift)) - 1
    }

    fn round(&self, i: u32, x: u32) -> u32 {
        self.mask & self.tea.encrypt([i, x])[0]
    }

    fn encrypt(&self, n: u32) -> u32 {
        let mut l = self.mask & (n >> self.shift);
        let mut r = self.mask & n;

        for i in 0..self.rounds - 1 {
            let next = l ^ self.round(i, r);
            l = r;
            r = next;
        }

        ((l & self.mask) << self.shift) | (r & self.mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u32; 4] = [0x0123_4567, 0x89AB_CDEF, 0xFEDC_BA98, 0x7654_3210];

    #[test]
    fn full_space_covered_before_repeat() {
        let mut permutor = Permutor::new(0..=u16::MAX);
        let mut seen = vec![false; 1 << 16];

        for _ in 0..permutor.len() {
            let id = permutor.next_id() as usize;
            assert!(!seen[id], "id {id} repeated within a cycle");
            seen[id] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn subrange_covered_and_bounded() {
        let mut permutor = Permutor::with_key(KEY, 1000..=2999);
        assert_eq!(permutor.len(), 2000);

        for _ in 0..2 {
            let mut ids: Vec<u16> = (0..2000).map(|_| permutor.next_id()).collect();
            assert!(ids.iter().all(|id| (1000..=2999).contains(id)));
            ids.sort_unstable();
            ids.dedup();
            assert_eq!(ids.len(), 2000);
        }
    }

    #[test]
    fn single_value_range() {
        let mut permutor = Permutor::with_key(KEY, 53..=53);

        assert_eq!(permutor.next_id(), 53);
        assert_eq!(permutor.next_id(), 53);
    }

    #[test]
    fn order_depends_on_key() {
        let mut a = Permutor::with_key(KEY, 0..=u16::MAX);
        let mut b = Permutor::with_key(KEY, 0..=u16::MAX);
        let mut c = Permutor::with_key([1, 2, 3, 4], 0..=u16::MAX);

        let seq_a: Vec<u16> = (0..64).map(|_| a.next_id()).collect();
        let seq_b: Vec<u16> = (0..64).map(|_| b.next_id()).collect();
        let seq_c: Vec<u16> = (0..64).map(|_| c.next_id()).collect();

        assert_eq!(seq_a, seq_b);
        assert_ne!(seq_a, seq_c);
    }

    #[test]
    fn output_is_not_sequential() {
        let mut permutor = Permutor::with_key(KEY, 0..=u16::MAX);
        let ids: Vec<u16> = (0..32).map(|_| permutor.next_id()).collect();

        let increments = ids
            .windows(2)
            .filter(|w| w[1] == w[0].wrapping_add(1))
            .count();
        assert!(increments < 4);
    }
}
