//! Fixed-capacity bit sets and the numeric-bytes domain of the stack.

use std::collections::BTreeSet;

use crate::platform::EBPF_TOTAL_STACK_SIZE;

/// A bit set backed by a vector of u64 words, sized once at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BitSet {
    /// Storage: each u64 holds 64 bits
    words: Vec<u64>,
    capacity: usize,
    /// Number of set bits (cached for O(1) len())
    count: usize,
}

impl BitSet {
    /// Number of bits per word.
    const BITS_PER_WORD: usize = 64;

    /// Creates a new empty bit set with the given capacity (in bits).
    pub fn new(capacity: usize) -> Self {
        let num_words = capacity.div_ceil(Self::BITS_PER_WORD);
        Self {
            words: vec![0; num_words],
            capacity,
            count: 0,
        }
    }

    /// Creates a bit set with every bit in `0..capacity` set.
    pub fn full(capacity: usize) -> Self {
        let mut bs = Self::new(capacity);
        bs.insert_range(0, capacity);
        bs
    }

    /// Returns the number of set bits.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn word_and_bit(index: usize) -> (usize, usize) {
        (index / Self::BITS_PER_WORD, index % Self::BITS_PER_WORD)
    }

    /// Returns true if the bit at the given index is set. Indices past the
    /// capacity are never set.
    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        if index >= self.capacity {
            return false;
        }
        let (word_idx, bit_idx) = Self::word_and_bit(index);
        (self.words[word_idx] & (1u64 << bit_idx)) != 0
    }

    /// Sets the bit at the given index. Returns true if the bit was not previously set.
    #[inline]
    pub fn insert(&mut self, index: usize) -> bool {
        assert!(index < self.capacity, "bit {} out of capacity {}", index, self.capacity);
        let (word_idx, bit_idx) = Self::word_and_bit(index);
        let mask = 1u64 << bit_idx;
        let was_clear = (self.words[word_idx] & mask) == 0;
        if was_clear {
            self.words[word_idx] |= mask;
            self.count += 1;
        }
        was_clear
    }

    /// Clears the bit at the given index. Returns true if the bit was previously set.
    #[inline]
    pub fn remove(&mut self, index: usize) -> bool {
        if index >= self.capacity {
            return false;
        }
        let (word_idx, bit_idx) = Self::word_and_bit(index);
        let mask = 1u64 << bit_idx;
        let was_set = (self.words[word_idx] & mask) != 0;
        if was_set {
            self.words[word_idx] &= !mask;
            self.count -= 1;
        }
        was_set
    }

    /// Sets bits `start..start + len`, clipped to the capacity.
    pub fn insert_range(&mut self, start: usize, len: usize) {
        for i in start..(start + len).min(self.capacity) {
            self.insert(i);
        }
    }

    /// Clears bits `start..start + len`.
    pub fn remove_range(&mut self, start: usize, len: usize) {
        for i in start..(start + len).min(self.capacity) {
            self.remove(i);
        }
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
        self.count = 0;
    }

    fn recount(&mut self) {
        self.count = self.words.iter().map(|w| w.count_ones() as usize).sum();
    }

    fn zip_with(&self, other: &BitSet, f: impl Fn(u64, u64) -> u64) -> BitSet {
        assert_eq!(self.capacity, other.capacity, "bit sets of different capacity");
        let mut out = BitSet {
            words: self.words.iter().zip(&other.words).map(|(a, b)| f(*a, *b)).collect(),
            capacity: self.capacity,
            count: 0,
        };
        out.recount();
        out
    }

    pub fn union(&self, other: &BitSet) -> BitSet {
        self.zip_with(other, |a, b| a | b)
    }

    pub fn intersection(&self, other: &BitSet) -> BitSet {
        self.zip_with(other, |a, b| a & b)
    }

    pub fn is_subset(&self, other: &BitSet) -> bool {
        self.words.iter().zip(&other.words).all(|(a, b)| a & !b == 0)
    }

    /// Returns an iterator over all set bit indices.
    pub fn iter(&self) -> BitSetIter<'_> {
        BitSetIter {
            bitset: self,
            word_idx: 0,
            current_word: self.words.first().copied().unwrap_or(0),
        }
    }
}

/// Iterator over set bits in a BitSet.
pub struct BitSetIter<'a> {
    bitset: &'a BitSet,
    word_idx: usize,
    current_word: u64,
}

impl Iterator for BitSetIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current_word != 0 {
                let bit_idx = self.current_word.trailing_zeros() as usize;
                self.current_word &= self.current_word - 1; // Clear lowest set bit
                return Some(self.word_idx * BitSet::BITS_PER_WORD + bit_idx);
            }

            self.word_idx += 1;
            if self.word_idx >= self.bitset.words.len() {
                return None;
            }
            self.current_word = self.bitset.words[self.word_idx];
        }
    }
}

/// Which stack bytes are known to hold plain numbers.
///
/// A set bit means the byte is numeric in every concrete state. Top is the
/// empty set, so join is intersection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NumericBytes {
    numeric: BitSet,
}

impl Default for NumericBytes {
    fn default() -> Self {
        Self::top()
    }
}

impl NumericBytes {
    pub const SIZE: usize = EBPF_TOTAL_STACK_SIZE as usize;

    pub fn top() -> Self {
        NumericBytes {
            numeric: BitSet::new(Self::SIZE),
        }
    }

    pub fn is_top(&self) -> bool {
        self.numeric.is_empty()
    }

    pub fn le(&self, other: &NumericBytes) -> bool {
        other.numeric.is_subset(&self.numeric)
    }

    pub fn join(&self, other: &NumericBytes) -> NumericBytes {
        NumericBytes {
            numeric: self.numeric.intersection(&other.numeric),
        }
    }

    pub fn widen(&self, other: &NumericBytes) -> NumericBytes {
        self.join(other)
    }

    pub fn meet(&self, other: &NumericBytes) -> NumericBytes {
        NumericBytes {
            numeric: self.numeric.union(&other.numeric),
        }
    }

    pub fn narrow(&self, other: &NumericBytes) -> NumericBytes {
        self.meet(other)
    }

    fn clip(lb: i64, width: i64) -> Option<(usize, usize)> {
        let start = lb.max(0);
        let end = (lb + width).min(Self::SIZE as i64);
        (start < end).then_some((start as usize, (end - start) as usize))
    }

    /// `(only numbers, only non-numbers)` over `[lb, lb + width)`.
    pub fn uniformity(&self, lb: i64, width: i64) -> (bool, bool) {
        let mut only_num = true;
        let mut only_non_num = true;
        for i in lb..lb + width {
            let b = i >= 0 && self.numeric.contains(i as usize);
            only_num &= b;
            only_non_num &= !b;
        }
        (only_num, only_non_num)
    }

    /// Marks `[lb, lb + width)` as holding numbers.
    pub fn reset(&mut self, lb: i64, width: i64) {
        if let Some((start, len)) = Self::clip(lb, width) {
            self.numeric.insert_range(start, len);
        }
    }

    /// Marks `[lb, lb + width)` as possibly holding non-numbers.
    pub fn havoc(&mut self, lb: i64, width: i64) {
        if let Some((start, len)) = Self::clip(lb, width) {
            self.numeric.remove_range(start, len);
        }
    }

    /// Are all bytes in `[lb, ub)` numeric?
    pub fn all_num(&self, lb: i64, ub: i64) -> bool {
        if lb < 0 || ub > Self::SIZE as i64 {
            return false;
        }
        (lb..ub).all(|i| self.numeric.contains(i as usize))
    }

    /// Length of the run of numeric bytes starting at `offset`.
    pub fn all_num_width(&self, offset: i64) -> i64 {
        if offset < 0 {
            return 0;
        }
        let mut end = offset;
        while end < Self::SIZE as i64 && self.numeric.contains(end as usize) {
            end += 1;
        }
        end - offset
    }

    /// Maximal runs of numeric bytes as `(first, last)` inclusive offsets.
    pub fn numeric_ranges(&self) -> Vec<(usize, usize)> {
        let mut out: Vec<(usize, usize)> = Vec::new();
        for i in self.numeric.iter() {
            match out.last_mut() {
                Some((_, last)) if *last + 1 == i => *last = i,
                _ => out.push((i, i)),
            }
        }
        out
    }

    /// Renders the numeric runs as `s[a...b].type=number` facts.
    pub fn to_set(&self) -> BTreeSet<String> {
        self.numeric_ranges()
            .into_iter()
            .map(|(a, b)| {
                if a == b {
                    format!("s[{}].type=number", a)
                } else {
                    format!("s[{}...{}].type=number", a, b)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_contains() {
        let mut bs = BitSet::new(100);
        assert!(!bs.contains(42));
        assert!(bs.insert(42));
        assert!(bs.contains(42));
        assert!(!bs.insert(42)); // Already set
        assert_eq!(bs.len(), 1);
        assert!(!bs.contains(1000));
    }

    #[test]
    fn test_remove() {
        let mut bs = BitSet::new(100);
        bs.insert(42);
        assert!(bs.remove(42));
        assert!(!bs.contains(42));
        assert!(!bs.remove(42)); // Already cleared
        assert_eq!(bs.len(), 0);
    }

    #[test]
    fn test_iter_and_ranges() {
        let mut bs = BitSet::new(130);
        bs.insert_range(3, 3);
        bs.insert(64); // Second word
        bs.insert(129);
        let indices: Vec<_> = bs.iter().collect();
        assert_eq!(indices, vec![3, 4, 5, 64, 129]);
        bs.remove_range(4, 100);
        assert_eq!(bs.iter().collect::<Vec<_>>(), vec![3, 129]);
        assert!(BitSet::full(130).is_full());
    }

    #[test]
    fn test_set_operations() {
        let mut a = BitSet::new(70);
        let mut b = BitSet::new(70);
        a.insert_range(0, 10);
        b.insert_range(5, 10);
        assert_eq!(a.intersection(&b).len(), 5);
        assert_eq!(a.union(&b).len(), 15);
        assert!(a.intersection(&b).is_subset(&a));
        assert!(!a.is_subset(&b));
    }

    #[test]
    fn test_numeric_bytes() {
        let mut n = NumericBytes::top();
        assert!(n.is_top());
        n.reset(4088, 8);
        assert!(n.all_num(4088, 4096));
        assert!(!n.all_num(4087, 4096));
        assert_eq!(n.uniformity(4090, 4), (true, false));
        assert_eq!(n.uniformity(4080, 4), (false, true));
        assert_eq!(n.uniformity(4086, 4), (false, false));
        assert_eq!(n.all_num_width(4090), 6);

        let mut m = NumericBytes::top();
        m.reset(4092, 4);
        let j = n.join(&m);
        assert!(n.le(&j) && m.le(&j));
        assert_eq!(j.numeric_ranges(), vec![(4092, 4095)]);

        n.havoc(4094, 10);
        assert_eq!(n.to_set().into_iter().collect::<Vec<_>>(), vec!["s[4088...4093].type=number".to_string()]);
    }
}
