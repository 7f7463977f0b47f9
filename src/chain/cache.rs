//! Bounded in-memory view of the canonical chain tail.

use std::collections::BTreeMap;

use alloy::primitives::BlockNumber;
use tracing::trace;

use crate::types::Block;

/// An ordered map of the most recent canonical blocks, keyed by number.
///
/// The cache always holds a contiguous suffix of the chain the engine
/// currently believes in: every entry's `parent_hash` equals the hash of the
/// entry below it, and the entry with the highest number is the head. When
/// the configured depth is exceeded, the numerically smallest entry is
/// evicted.
#[derive(Clone, Debug)]
pub struct ChainCache {
    blocks: BTreeMap<BlockNumber, Block>,
    max_depth: usize,
}

impl ChainCache {
    pub(crate) fn new(max_depth: usize) -> Self {
        Self { blocks: BTreeMap::new(), max_depth }
    }

    /// Resets the cache to a single entry.
    pub(crate) fn anchor(&mut self, block: Block) {
        trace!(block_number = block.number, hash = %block.hash, "anchoring chain cache");
        self.blocks.clear();
        self.blocks.insert(block.number, block);
    }

    /// Appends the next block of the chain.
    ///
    /// # Panics
    ///
    /// Panics if the cache is empty or `block` does not chain onto the
    /// current head. Callers verify continuity before appending; a violation
    /// here is a bug in the engine, not a recoverable condition.
    pub(crate) fn append(&mut self, block: Block) {
        let head = self.head().expect("append called on an empty cache");
        assert_eq!(
            block.number,
            head.number + 1,
            "appended block {} does not follow head {}",
            block.number,
            head.number,
        );
        assert_eq!(
            block.parent_hash, head.hash,
            "appended block {} does not chain onto head {}",
            block.number, head.number,
        );

        self.blocks.insert(block.number, block);
        if self.blocks.len() > self.max_depth {
            self.blocks.pop_first();
        }
    }

    /// Drops every entry with a number greater than `number`.
    pub(crate) fn truncate_above(&mut self, number: BlockNumber) {
        self.blocks.split_off(&(number + 1));
    }

    #[must_use]
    pub fn get(&self, number: BlockNumber) -> Option<&Block> {
        self.blocks.get(&number)
    }

    /// The entry with the highest number.
    #[must_use]
    pub fn head(&self) -> Option<&Block> {
        self.blocks.last_key_value().map(|(_, block)| block)
    }

    /// The entry with the lowest number.
    #[must_use]
    pub fn earliest(&self) -> Option<&Block> {
        self.blocks.first_key_value().map(|(_, block)| block)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Numbers currently held, ascending.
    #[must_use]
    pub fn numbers(&self) -> Vec<BlockNumber> {
        self.blocks.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{block, chain};

    fn cache_with(blocks: &[Block], max_depth: usize) -> ChainCache {
        let mut cache = ChainCache::new(max_depth);
        let mut iter = blocks.iter();
        cache.anchor(*iter.next().expect("at least one block"));
        for b in iter {
            cache.append(*b);
        }
        cache
    }

    #[test]
    fn append_keeps_contiguous_suffix() {
        let cache = cache_with(&chain(100..=104, 0), 10);

        assert_eq!(cache.numbers(), vec![100, 101, 102, 103, 104]);
        assert_eq!(cache.head().unwrap().number, 104);
        assert_eq!(cache.earliest().unwrap().number, 100);

        let numbers = cache.numbers();
        for pair in numbers.windows(2) {
            let lower = cache.get(pair[0]).unwrap();
            let upper = cache.get(pair[1]).unwrap();
            assert_eq!(upper.parent_hash, lower.hash);
        }
    }

    #[test]
    fn append_evicts_numerically_smallest() {
        let cache = cache_with(&chain(100..=105, 0), 3);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.numbers(), vec![103, 104, 105]);
    }

    #[test]
    #[should_panic(expected = "does not chain onto head")]
    fn append_panics_on_parent_mismatch() {
        let mut cache = cache_with(&chain(100..=101, 0), 10);
        cache.append(block(102, 7));
    }

    #[test]
    #[should_panic(expected = "does not follow head")]
    fn append_panics_on_number_gap() {
        let mut cache = cache_with(&chain(100..=101, 0), 10);
        cache.append(block(103, 0));
    }

    #[test]
    fn truncate_above_drops_newer_entries() {
        let mut cache = cache_with(&chain(100..=104, 0), 10);

        cache.truncate_above(101);

        assert_eq!(cache.numbers(), vec![100, 101]);
        assert_eq!(cache.head().unwrap().number, 101);
    }

    #[test]
    fn anchor_resets_to_single_entry() {
        let mut cache = cache_with(&chain(100..=104, 0), 10);

        cache.anchor(block(200, 1));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.head().unwrap().number, 200);
    }
}
