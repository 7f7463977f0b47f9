//! Testing helpers: a scriptable in-memory chain behind [`BlockProvider`],
//! a recording subscriber, and deterministic block/log constructors.

mod macros;

use std::{
    collections::{BTreeMap, VecDeque},
    ops::RangeInclusive,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use alloy::primitives::{Address, B256, BlockNumber, Bytes};
use async_trait::async_trait;

use crate::{
    provider::{BlockProvider, Error},
    subscriber::{InitError, LogSubscriber},
    types::{Block, BlockRef, Log},
};

/// Deterministic hash for block `number` on fork `fork`.
#[must_use]
pub fn hash(number: BlockNumber, fork: u8) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = fork;
    bytes[24..].copy_from_slice(&number.to_be_bytes());
    B256::new(bytes)
}

/// A block on fork `fork` whose parent is on the same fork.
#[must_use]
pub fn block(number: BlockNumber, fork: u8) -> Block {
    Block::new(number, hash(number, fork), hash(number.saturating_sub(1), fork))
}

/// A block on fork `fork` chaining onto a parent on `parent_fork`.
#[must_use]
pub fn fork_block(number: BlockNumber, fork: u8, parent_fork: u8) -> Block {
    Block::new(number, hash(number, fork), hash(number.saturating_sub(1), parent_fork))
}

/// A linear chain of blocks on fork `fork`.
#[must_use]
pub fn chain(numbers: RangeInclusive<BlockNumber>, fork: u8) -> Vec<Block> {
    numbers.map(|number| block(number, fork)).collect()
}

/// A deterministic test address.
#[must_use]
pub fn address(seed: u8) -> Address {
    Address::repeat_byte(seed)
}

/// A log emitted by `address` in `block`.
#[must_use]
pub fn log_at(block: &Block, address: Address, log_index: u64) -> Log {
    Log {
        block_number: block.number,
        block_hash: block.hash,
        transaction_hash: B256::repeat_byte(0x77),
        transaction_index: 0,
        log_index,
        address,
        topics: Vec::new(),
        data: Bytes::new(),
        removed: false,
    }
}

#[derive(Default)]
struct MockState {
    chain: BTreeMap<BlockNumber, Block>,
    logs: Vec<Log>,
    zero_hash_latest: bool,
    staged_batches: VecDeque<Vec<Block>>,
    batch_failures: VecDeque<Error>,
    get_logs_failures: VecDeque<Error>,
    get_block_calls: Vec<BlockNumber>,
    batch_calls: Vec<(BlockNumber, BlockNumber)>,
    get_logs_calls: Vec<(BlockNumber, BlockNumber)>,
}

/// An in-memory canonical chain implementing [`BlockProvider`].
///
/// Tests drive reorgs by replacing a suffix of the chain, script failures and
/// canned batch responses, and assert on the recorded RPC traffic.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_chain(blocks: impl IntoIterator<Item = Block>) -> Self {
        let provider = Self::new();
        provider.extend_chain(blocks);
        provider
    }

    /// Adds or replaces blocks in the canonical view.
    pub fn extend_chain(&self, blocks: impl IntoIterator<Item = Block>) {
        let mut state = self.lock();
        for block in blocks {
            state.chain.insert(block.number, block);
        }
    }

    /// Reorgs the canonical view: every block at or above the first given
    /// block is replaced.
    pub fn reorg_to(&self, blocks: impl IntoIterator<Item = Block>) {
        let mut blocks = blocks.into_iter().peekable();
        let Some(first) = blocks.peek().copied() else { return };
        let mut state = self.lock();
        state.chain.split_off(&first.number);
        for block in blocks {
            state.chain.insert(block.number, block);
        }
        // drop logs that lived on the replaced suffix
        state.logs.retain(|log| log.block_number < first.number);
    }

    pub fn add_log(&self, log: Log) {
        self.lock().logs.push(log);
    }

    /// Makes the next `count` `get_logs` calls fail with clones of `error`.
    pub fn fail_next_get_logs(&self, error: Error, count: usize) {
        let mut state = self.lock();
        for _ in 0..count {
            state.get_logs_failures.push_back(error.clone());
        }
    }

    /// Makes the next `count` `batch_get_blocks` calls fail with clones of
    /// `error`.
    pub fn fail_next_batches(&self, error: Error, count: usize) {
        let mut state = self.lock();
        for _ in 0..count {
            state.batch_failures.push_back(error.clone());
        }
    }

    /// Queues a canned response served by the next `batch_get_blocks` call
    /// instead of the canonical view.
    pub fn stage_batch_response(&self, blocks: Vec<Block>) {
        self.lock().staged_batches.push_back(blocks);
    }

    /// When set, batches ending at the newest canonical block report a zero
    /// hash in their last slot.
    pub fn set_zero_hash_latest(&self, enabled: bool) {
        self.lock().zero_hash_latest = enabled;
    }

    #[must_use]
    pub fn get_block_calls(&self) -> Vec<BlockNumber> {
        self.lock().get_block_calls.clone()
    }

    #[must_use]
    pub fn batch_calls(&self) -> Vec<(BlockNumber, BlockNumber)> {
        self.lock().batch_calls.clone()
    }

    #[must_use]
    pub fn get_logs_calls(&self) -> Vec<(BlockNumber, BlockNumber)> {
        self.lock().get_logs_calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock provider mutex poisoned")
    }
}

impl BlockProvider for MockProvider {
    async fn get_block(&self, number: BlockNumber) -> Result<Block, Error> {
        let mut state = self.lock();
        state.get_block_calls.push(number);
        state.chain.get(&number).copied().ok_or(Error::BlockNotFound(number))
    }

    async fn batch_get_blocks(&self, from: BlockNumber, to: BlockNumber) -> Result<Vec<Block>, Error> {
        let mut state = self.lock();
        state.batch_calls.push((from, to));

        if let Some(error) = state.batch_failures.pop_front() {
            return Err(error);
        }
        if let Some(staged) = state.staged_batches.pop_front() {
            return Ok(staged);
        }

        let mut blocks = Vec::with_capacity((to.saturating_sub(from) + 1) as usize);
        for number in from..=to {
            let block = state.chain.get(&number).copied().ok_or(Error::BlockNotFound(number))?;
            blocks.push(block);
        }
        if state.zero_hash_latest
            && let Some(last) = blocks.last_mut()
            && state.chain.last_key_value().is_some_and(|(newest, _)| *newest == last.number)
        {
            last.hash = B256::ZERO;
        }
        Ok(blocks)
    }

    async fn get_logs(
        &self,
        from: BlockNumber,
        to: BlockNumber,
        addresses: &[Address],
    ) -> Result<Vec<Log>, Error> {
        let mut state = self.lock();
        state.get_logs_calls.push((from, to));

        if let Some(error) = state.get_logs_failures.pop_front() {
            return Err(error);
        }

        let mut logs: Vec<Log> = state
            .logs
            .iter()
            .filter(|log| {
                (from..=to).contains(&log.block_number) && addresses.contains(&log.address)
            })
            .cloned()
            .collect();
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(logs)
    }
}

/// Everything a subscriber observed, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriberEvent {
    Initialized(BlockNumber),
    Log { block_number: BlockNumber, log_index: u64 },
    Rollback(BlockNumber),
}

/// A [`LogSubscriber`] that records every call for assertions.
#[derive(Default)]
pub struct RecordingSubscriber {
    events: Mutex<Vec<SubscriberEvent>>,
    failing_initializations: AtomicUsize,
}

impl RecordingSubscriber {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` `initialize` calls fail.
    pub fn fail_initializations(&self, count: usize) {
        self.failing_initializations.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn events(&self) -> Vec<SubscriberEvent> {
        self.events.lock().expect("event mutex poisoned").clone()
    }

    /// Block numbers of successful initializations, in order.
    #[must_use]
    pub fn initialized_at(&self) -> Vec<BlockNumber> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SubscriberEvent::Initialized(number) => Some(number),
                _ => None,
            })
            .collect()
    }

    /// `(block_number, log_index)` of every handled log, in order.
    #[must_use]
    pub fn handled(&self) -> Vec<(BlockNumber, u64)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SubscriberEvent::Log { block_number, log_index } => {
                    Some((block_number, log_index))
                }
                _ => None,
            })
            .collect()
    }

    /// Rollback targets, in order.
    #[must_use]
    pub fn rollbacks(&self) -> Vec<BlockNumber> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SubscriberEvent::Rollback(number) => Some(number),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: SubscriberEvent) {
        self.events.lock().expect("event mutex poisoned").push(event);
    }
}

#[async_trait]
impl LogSubscriber for RecordingSubscriber {
    async fn initialize(&self, anchor: BlockRef) -> Result<(), InitError> {
        let remaining = self.failing_initializations.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_initializations.store(remaining - 1, Ordering::SeqCst);
            return Err("scripted initialization failure".into());
        }
        self.record(SubscriberEvent::Initialized(anchor.number));
        Ok(())
    }

    async fn handle_log(&self, log: &Log) {
        self.record(SubscriberEvent::Log {
            block_number: log.block_number,
            log_index: log.log_index,
        });
    }

    fn rollback(&self, target: BlockRef) {
        self.record(SubscriberEvent::Rollback(target.number));
    }
}
