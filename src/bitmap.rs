//! Busy maps for fragmented blocks.
//!
//! Every fragmented block has one bit per fragment, set while that fragment
//! is allocated. Whether a fragment is live is only ever decided here, never
//! from the fragment's own bytes.

use std::collections::BTreeMap;

const WORD_BITS: usize = u64::BITS as usize;

/// `u64` words needed for a map of `count` fragments.
pub fn words_for(count: usize) -> usize {
    (count + WORD_BITS - 1) / WORD_BITS
}

#[derive(Debug, Default)]
pub struct FragmentMaps {
    maps: BTreeMap<usize, Vec<u64>>,
}

impl FragmentMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks with a map.
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Start an all-free map of `count` fragments for `block`.
    pub fn insert(&mut self, block: usize, count: usize) {
        self.maps.insert(block, vec![0; words_for(count)]);
    }

    /// Install a map read back from a heap's metadata.
    pub fn insert_words(&mut self, block: usize, words: Vec<u64>) {
        self.maps.insert(block, words);
    }

    pub fn remove(&mut self, block: usize) -> Option<Vec<u64>> {
        self.maps.remove(&block)
    }

    pub fn words(&self, block: usize) -> Option<&[u64]> {
        self.maps.get(&block).map(Vec::as_slice)
    }

    /// Whether fragment `index` of `block` is allocated. Blocks without a map
    /// have no live fragments.
    pub fn is_busy(&self, block: usize, index: usize) -> bool {
        self.maps
            .get(&block)
            .and_then(|words| words.get(index / WORD_BITS))
            .map_or(false, |word| word & (1 << (index % WORD_BITS)) != 0)
    }

    /// Mark fragment `index` of `block` busy or free, returning whether it
    /// was busy before. Returns `None` if the block has no map.
    pub fn set(&mut self, block: usize, index: usize, busy: bool) -> Option<bool> {
        let word = self.maps.get_mut(&block)?.get_mut(index / WORD_BITS)?;
        let bit = 1 << (index % WORD_BITS);
        let was = *word & bit != 0;
        if busy {
            *word |= bit;
        } else {
            *word &= !bit;
        }
        Some(was)
    }

    /// Number of busy fragments in `block`, if it has a map.
    pub fn busy_count(&self, block: usize) -> Option<usize> {
        self.maps
            .get(&block)
            .map(|words| words.iter().map(|w| w.count_ones() as usize).sum())
    }

    /// Whether any bit at or past `count` is set in `block`'s map.
    pub fn has_bits_past(&self, block: usize, count: usize) -> bool {
        let words = match self.maps.get(&block) {
            Some(words) => words,
            None => return false,
        };
        words.iter().enumerate().any(|(i, &word)| {
            let first = i * WORD_BITS;
            if first >= count {
                word != 0
            } else if count - first < WORD_BITS {
                word >> (count - first) != 0
            } else {
                false
            }
        })
    }

    /// Blocks that have a map, in order.
    pub fn blocks(&self) -> impl Iterator<Item = usize> + '_ {
        self.maps.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_busy_bits() {
        let mut maps = FragmentMaps::new();
        assert!(!maps.is_busy(3, 0));
        assert_eq!(maps.set(3, 0, true), None);

        maps.insert(3, 100);
        assert_eq!(maps.words(3).map(<[u64]>::len), Some(2));
        assert_eq!(maps.set(3, 0, true), Some(false));
        assert_eq!(maps.set(3, 70, true), Some(false));
        assert_eq!(maps.set(3, 70, true), Some(true));
        assert!(maps.is_busy(3, 0));
        assert!(maps.is_busy(3, 70));
        assert!(!maps.is_busy(3, 1));
        assert_eq!(maps.busy_count(3), Some(2));

        assert_eq!(maps.set(3, 0, false), Some(true));
        assert_eq!(maps.busy_count(3), Some(1));
        assert_eq!(maps.blocks().collect::<Vec<_>>(), vec![3]);

        maps.remove(3);
        assert!(maps.is_empty());
        assert!(!maps.is_busy(3, 70));
    }

    #[test]
    fn test_bits_past_the_end() {
        let mut maps = FragmentMaps::new();
        maps.insert_words(0, vec![0, 1 << 3]);
        assert!(!maps.has_bits_past(0, 68));
        assert!(maps.has_bits_past(0, 67));
        assert!(maps.has_bits_past(0, 64));
        assert!(maps.has_bits_past(0, 3));
        assert!(!maps.has_bits_past(1, 0));

        maps.insert_words(1, vec![u64::MAX]);
        assert!(!maps.has_bits_past(1, 64));
        assert!(maps.has_bits_past(1, 63));
    }
}
