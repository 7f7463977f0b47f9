use std::fmt;

use alloy::primitives::{Address, B256, BlockNumber, Bytes, TxHash};

/// A block header as tracked by the engine's chain cache.
///
/// Block identity is the hash: two blocks are equal exactly when their hashes
/// are equal, regardless of the other fields.
#[derive(Clone, Copy, Debug, Eq)]
pub struct Block {
    pub number: BlockNumber,
    pub hash: B256,
    pub parent_hash: B256,
}

impl Block {
    #[must_use]
    pub const fn new(number: BlockNumber, hash: B256, parent_hash: B256) -> Self {
        Self { number, hash, parent_hash }
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.hash)
    }
}

/// Block identity without parent linkage.
///
/// Used to anchor the engine before any parent relationship is known, and to
/// track per-subscriber positions (`initialized_at`, `last_seen_event_block`)
/// where only the number and hash matter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRef {
    pub number: BlockNumber,
    pub hash: B256,
}

impl BlockRef {
    #[must_use]
    pub const fn new(number: BlockNumber, hash: B256) -> Self {
        Self { number, hash }
    }
}

impl From<Block> for BlockRef {
    fn from(block: Block) -> Self {
        Self { number: block.number, hash: block.hash }
    }
}

impl From<BlockRef> for Block {
    fn from(anchor: BlockRef) -> Self {
        Self { number: anchor.number, hash: anchor.hash, parent_hash: B256::ZERO }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.hash)
    }
}

/// An event log scoped to the block that produced it.
///
/// Logs are delivered to subscribers in ascending `(block_number, log_index)`
/// order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Log {
    pub block_number: BlockNumber,
    pub block_hash: B256,
    pub transaction_hash: TxHash,
    pub transaction_index: u64,
    pub log_index: u64,
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub removed: bool,
}

/// Address plus topic filter registered alongside a subscriber.
///
/// The address is the registry key: registering a second subscriber for the
/// same address replaces the first. An empty topic list matches every log
/// emitted by the address; a non-empty list matches on the first topic (the
/// event signature).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventFilter {
    pub address: Address,
    pub topics: Vec<B256>,
}

impl EventFilter {
    #[must_use]
    pub const fn new(address: Address) -> Self {
        Self { address, topics: Vec::new() }
    }

    /// Adds an event signature topic to match on.
    #[must_use]
    pub fn topic(mut self, topic: B256) -> Self {
        self.topics.push(topic);
        self
    }

    /// Replaces the topic list.
    #[must_use]
    pub fn topics(mut self, topics: Vec<B256>) -> Self {
        self.topics = topics;
        self
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} topics)", self.address.to_checksum(None), self.topics.len())
    }
}

/// What processing a single header produced.
///
/// `rollback` carries the block subscribers were rolled back to, when a reorg
/// was repaired while handling the header. A `rollback` equal to the header
/// itself means the fork was deeper than the cached window and the engine
/// re-anchored there; callers should treat that as a fresh start.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlockOutcome {
    pub logs: Vec<Log>,
    pub rollback: Option<Block>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_equality_is_hash_identity() {
        let a = Block::new(5, B256::repeat_byte(1), B256::repeat_byte(9));
        let b = Block::new(7, B256::repeat_byte(1), B256::repeat_byte(3));
        let c = Block::new(5, B256::repeat_byte(2), B256::repeat_byte(9));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn anchor_conversion_zeroes_parent() {
        let anchor = BlockRef::new(100, B256::repeat_byte(0xaa));
        let block = Block::from(anchor);

        assert_eq!(block.number, 100);
        assert_eq!(block.hash, anchor.hash);
        assert_eq!(block.parent_hash, B256::ZERO);
    }

    #[test]
    fn filter_display_uses_checksum_address() {
        let address = "0xd8da6bf26964af9d7eed9e03e53415d37aa96045".parse::<Address>().unwrap();
        let filter = EventFilter::new(address).topic(B256::repeat_byte(1));

        let rendered = filter.to_string();
        assert!(rendered.contains("0xd8dA6BF26964af9d7eed9e03e53415d37aa96045"));
        assert!(rendered.contains("1 topics"));
    }
}
