//! The block ingest engine.
//!
//! [`EventRelay`] consumes block headers from a remote chain, keeps a bounded
//! in-memory tail of the canonical chain, fetches logs for the ranges each
//! header uncovers, detects and repairs reorgs, and fans the results out to
//! registered subscribers in a strictly ordered fashion.
//!
//! # Header handling
//!
//! Every header passed to [`EventRelay::handle_block`] is classified against
//! the cached head:
//!
//! * a header already cached with the same hash is a duplicate and a no-op;
//! * a header more than one block ahead opens a gap, filled in batches;
//! * a header that does not chain onto the head (or re-announces a cached
//!   number with a different hash) signals a reorg, repaired by finding the
//!   deepest common ancestor still shared with the node;
//! * everything else is the next block of the chain and is applied directly.
//!
//! Each path returns a [`BlockOutcome`] with the logs that were applied and,
//! when a fork was repaired, the block subscribers were rolled back to. A
//! fork deeper than the cached window cannot be repaired: the engine
//! re-anchors at the announced header and reports it as the rollback block,
//! which callers should treat as a fresh start.
//!
//! # Ordering guarantees
//!
//! Blocks are applied in ascending number order, logs within and across
//! blocks in ascending `(block_number, log_index)` order. For any single
//! subscriber, `initialize` happens before the first `handle_log`, logs
//! arrive one at a time in stream order, and a `rollback` precedes any log
//! for a block above the rollback target.

mod builder;
mod ingest;
mod log_fetcher;

use std::{collections::BTreeMap, sync::Arc};

use alloy::primitives::{Address, BlockNumber};
use futures::future::join_all;
use tracing::{debug, info, warn};

pub use builder::{
    DEFAULT_BATCH_SIZE, DEFAULT_CHUNK_PAUSE, DEFAULT_GET_LOGS_TIMEOUT, DEFAULT_MAX_BLOCKS_CACHED,
    DEFAULT_MAX_RETRY_GET_BLOCK, DEFAULT_MAX_RETRY_GET_LOGS, DEFAULT_RETRY_DELAY_GET_BLOCK,
    DEFAULT_RETRY_DELAY_GET_LOGS, EventRelayBuilder,
};
pub use ingest::{BlockIngest, DEFAULT_OUTCOME_BUFFER};

use crate::{
    EngineError,
    chain::{
        ancestor::{AncestorError, find_common_ancestor},
        cache::ChainCache,
        repair::{populate_until, repair_zero_hash_tail},
    },
    provider::{self, BlockProvider},
    relay::{
        builder::EngineConfig,
        log_fetcher::{FetchError, LogQuery, query_logs},
    },
    subscriber::{LogSubscriber, registry::SubscriptionRegistry},
    types::{Block, BlockOutcome, BlockRef, EventFilter, Log},
};

/// The block-chain consistency engine.
///
/// Owns the chain cache and the subscription registry; subscribers own their
/// internal state and are only reached through the
/// [`LogSubscriber`] contract. Construct with [`EventRelayBuilder`], anchor
/// with [`initialize`](Self::initialize), then feed headers through
/// [`handle_block`](Self::handle_block) (or wrap the engine in a
/// [`BlockIngest`] queue and let it drain arrivals serially).
pub struct EventRelay<P: BlockProvider> {
    provider: P,
    config: EngineConfig,
    cache: ChainCache,
    registry: SubscriptionRegistry,
    post_block_hooks: Vec<Box<dyn FnOnce(&Block) + Send>>,
}

impl<P: BlockProvider> EventRelay<P> {
    /// Anchors the engine at `anchor` and initializes waiting subscribers.
    ///
    /// Any previously cached state is discarded.
    pub async fn initialize(&mut self, anchor: impl Into<BlockRef>) {
        let anchor = anchor.into();
        info!(block_number = anchor.number, hash = %anchor.hash, "anchoring engine");
        self.cache.anchor(anchor.into());
        self.init_waiting_subscribers(anchor).await;
    }

    /// Fetches block `number` from the provider and anchors the engine there.
    ///
    /// # Errors
    ///
    /// * [`EngineError::BlockNotFound`] - if the node cannot produce the
    ///   block within the block retry budget.
    /// * [`EngineError::MaxRetryReached`] - if the fetch keeps failing.
    pub async fn initialize_at(&mut self, number: BlockNumber) -> Result<(), EngineError> {
        let block = provider::with_retry(&self.config.block_retry, || self.provider.get_block(number))
            .await
            .map_err(|err| match err {
                provider::Error::BlockNotFound(number) => EngineError::BlockNotFound(number),
                _ => EngineError::MaxRetryReached,
            })?;
        self.initialize(block).await;
        Ok(())
    }

    /// Registers `subscriber` for logs emitted by `filter.address`.
    ///
    /// One subscriber per address: a second subscription replaces the first.
    /// If the engine is already anchored, initialization is attempted
    /// immediately; otherwise the subscriber waits for the anchor.
    pub async fn subscribe_to_logs(&mut self, filter: EventFilter, subscriber: Arc<dyn LogSubscriber>) {
        info!(filter = %filter, "registering subscriber");
        self.registry.insert(filter, subscriber);
        if let Some(head) = self.cache.head().copied() {
            self.init_waiting_subscribers(head.into()).await;
        }
    }

    /// Registers a one-shot hook invoked after the next block is applied on
    /// the successor path.
    pub fn on_block_applied(&mut self, hook: impl FnOnce(&Block) + Send + 'static) {
        self.post_block_hooks.push(Box::new(hook));
    }

    /// Read-only view of the cached chain tail.
    #[must_use]
    pub fn cache(&self) -> &ChainCache {
        &self.cache
    }

    /// The current head, if the engine is anchored.
    #[must_use]
    pub fn head(&self) -> Option<BlockRef> {
        self.cache.head().copied().map(Into::into)
    }

    /// Addresses whose subscribers are waiting for (re-)initialization.
    #[must_use]
    pub fn pending_initialization(&self) -> Vec<Address> {
        self.registry.waiting()
    }

    /// Processes one incoming header.
    ///
    /// Headers may arrive out of order or repeatedly; the engine classifies
    /// each one and applies at most one state transition. See the module
    /// documentation for the classification and the meaning of the returned
    /// [`BlockOutcome`].
    ///
    /// # Errors
    ///
    /// * [`EngineError::NotInitialized`] - if the engine has no anchor yet.
    /// * [`EngineError::BlockNotFound`] - if the node cannot produce a block
    ///   needed to fill a gap or repair a fork.
    /// * [`EngineError::MaxRetryReached`] - if a retry budget was exhausted.
    /// * [`EngineError::FailedFetchingLogs`] / [`EngineError::Timeout`] - if
    ///   log fetching failed beyond its budget.
    pub async fn handle_block(&mut self, new_block: Block) -> Result<BlockOutcome, EngineError> {
        let head = *self.cache.head().ok_or(EngineError::NotInitialized)?;

        if let Some(cached) = self.cache.get(new_block.number)
            && cached.hash == new_block.hash
        {
            debug!(block_number = new_block.number, "duplicate header, nothing to do");
            return Ok(BlockOutcome::default());
        }
        if new_block.number <= head.number && self.cache.get(new_block.number).is_none() {
            debug!(
                block_number = new_block.number,
                head = head.number,
                "header below the cached window, ignoring"
            );
            return Ok(BlockOutcome::default());
        }

        if new_block.number > head.number + 1 {
            self.fill_gap(head, new_block).await
        } else if new_block.number == head.number + 1 && new_block.parent_hash == head.hash {
            self.apply_successor(head, new_block).await
        } else {
            self.resolve_fork(new_block).await
        }
    }

    /// Normal path: the header extends the cached chain by one block.
    async fn apply_successor(
        &mut self,
        head: Block,
        new_block: Block,
    ) -> Result<BlockOutcome, EngineError> {
        debug!(block_number = new_block.number, "applying successor block");

        let addresses = self.registry.addresses();
        let overlay = BTreeMap::from([(new_block.number, new_block)]);
        let query = match query_logs(
            &mut self.cache,
            &self.provider,
            head,
            new_block,
            &addresses,
            Some(&overlay),
            &self.config,
        )
        .await
        {
            Ok(query) => query,
            Err(FetchError::DeepReorg) => return Ok(self.reanchor(new_block, Vec::new())),
            Err(FetchError::Failed(err)) => return Err(err),
        };

        if let Some(ancestor) = query.common_ancestor {
            self.registry.rollback(ancestor.into());
        } else {
            self.cache.append(new_block);
        }

        self.apply_logs(&query.logs).await;

        let head = *self.cache.head().expect("cache is anchored");
        self.init_waiting_subscribers(head.into()).await;
        self.run_post_block_hooks(&head);

        Ok(BlockOutcome { logs: query.logs, rollback: query.common_ancestor })
    }

    /// Reorg path: the header does not extend the chain the cache believes
    /// in.
    async fn resolve_fork(&mut self, new_block: Block) -> Result<BlockOutcome, EngineError> {
        info!(
            block_number = new_block.number,
            hash = %new_block.hash,
            "incoming header diverges from the cached chain"
        );

        match self.recover_to(new_block).await? {
            Some((logs, rollback)) => {
                self.apply_logs(&logs).await;
                let head = *self.cache.head().expect("cache is anchored");
                self.init_waiting_subscribers(head.into()).await;
                Ok(BlockOutcome { logs, rollback: Some(rollback) })
            }
            None => Ok(self.reanchor(new_block, Vec::new())),
        }
    }

    /// Batch path: the header is more than one block ahead of the cache.
    ///
    /// The gap is walked in chunks of at most one batch. Each chunk fetch
    /// starts one block early so the first entry's parentage can be checked
    /// against the head; the extra entry is discarded. A fork discovered at a
    /// chunk boundary or by log verification is repaired in place, and the
    /// walk resumes from the repaired head.
    async fn fill_gap(&mut self, head: Block, new_block: Block) -> Result<BlockOutcome, EngineError> {
        info!(
            head = head.number,
            target = new_block.number,
            batch_size = self.config.batch_size,
            "filling gap toward announced block"
        );

        let mut head = head;
        let mut delivered: Vec<Log> = Vec::new();
        let mut deepest_rollback: Option<Block> = None;

        while head.number < new_block.number {
            let from = head.number + 1;
            let to = new_block.number.min(from + self.config.batch_size - 1);
            debug!(from, to, "processing gap chunk");

            let mut blocks = provider::with_retry(&self.config.block_retry, || {
                self.provider.batch_get_blocks(from - 1, to)
            })
            .await
            .map_err(|err| match err {
                provider::Error::BlockNotFound(number) => EngineError::BlockNotFound(number),
                _ => EngineError::MaxRetryReached,
            })?;
            repair_zero_hash_tail(&mut blocks, &new_block);
            blocks.retain(|block| block.number >= from);

            let (Some(first), Some(last)) = (blocks.first().copied(), blocks.last().copied()) else {
                return Err(EngineError::BlockNotFound(from));
            };

            let (logs, rollback) = if first.parent_hash != head.hash {
                debug!(chunk_start = first.number, "fork overlaps the gap");
                match self.recover_to(last).await? {
                    Some((logs, rollback)) => (logs, Some(rollback)),
                    None => return Ok(self.reanchor(new_block, delivered)),
                }
            } else {
                let addresses = self.registry.addresses();
                let overlay: BTreeMap<BlockNumber, Block> =
                    blocks.iter().map(|block| (block.number, *block)).collect();
                match query_logs(
                    &mut self.cache,
                    &self.provider,
                    head,
                    last,
                    &addresses,
                    Some(&overlay),
                    &self.config,
                )
                .await
                {
                    Ok(LogQuery { logs, common_ancestor: Some(ancestor) }) => {
                        self.registry.rollback(ancestor.into());
                        (logs, Some(ancestor))
                    }
                    Ok(LogQuery { logs, common_ancestor: None }) => {
                        for block in &blocks {
                            self.cache.append(*block);
                        }
                        (logs, None)
                    }
                    Err(FetchError::DeepReorg) => return Ok(self.reanchor(new_block, delivered)),
                    Err(FetchError::Failed(err)) => return Err(err),
                }
            };

            self.apply_logs(&logs).await;
            delivered.extend(logs);
            if let Some(rollback) = rollback
                && deepest_rollback.is_none_or(|deepest| rollback.number < deepest.number)
            {
                deepest_rollback = Some(rollback);
            }

            head = *self.cache.head().expect("cache is anchored");
            self.init_waiting_subscribers(head.into()).await;

            if head.number < new_block.number && !self.config.chunk_pause.is_zero() {
                tokio::time::sleep(self.config.chunk_pause).await;
            }
        }

        Ok(BlockOutcome { logs: delivered, rollback: deepest_rollback })
    }

    /// Re-establishes the common ancestor, repairs the chain up to `target`,
    /// and queries the logs for the rebuilt range. Subscribers are rolled
    /// back to the deepest ancestor reported by either the resolver or the
    /// log verification.
    ///
    /// Returns `None` when the fork is deeper than the cached window and the
    /// caller must re-anchor.
    async fn recover_to(
        &mut self,
        target: Block,
    ) -> Result<Option<(Vec<Log>, Block)>, EngineError> {
        let ancestor = match find_common_ancestor(
            &self.cache,
            &self.provider,
            self.config.batch_size,
            &self.config.block_retry,
        )
        .await
        {
            Ok(ancestor) => ancestor,
            Err(AncestorError::NotFoundInCache) => return Ok(None),
            Err(AncestorError::FailedGetBlock) => return Err(EngineError::MaxRetryReached),
        };

        self.cache.truncate_above(ancestor.number);
        let repaired =
            populate_until(&mut self.cache, &self.provider, &target, &self.config.block_retry).await?;
        let overlay: BTreeMap<BlockNumber, Block> =
            repaired.into_iter().map(|block| (block.number, block)).collect();

        let addresses = self.registry.addresses();
        let query = match query_logs(
            &mut self.cache,
            &self.provider,
            ancestor,
            target,
            &addresses,
            Some(&overlay),
            &self.config,
        )
        .await
        {
            Ok(query) => query,
            Err(FetchError::DeepReorg) => return Ok(None),
            Err(FetchError::Failed(err)) => return Err(err),
        };

        let rollback = match query.common_ancestor {
            Some(deeper) if deeper.number < ancestor.number => deeper,
            _ => ancestor,
        };
        info!(
            rollback = rollback.number,
            repaired_to = self.cache.head().map(|b| b.number),
            "fork repaired, rolling subscribers back"
        );
        self.registry.rollback(rollback.into());

        Ok(Some((query.logs, rollback)))
    }

    /// The fork is deeper than anything the cache can repair: start over at
    /// the announced block. Subscribers anchored above it are re-queued for
    /// initialization and drained on a later block.
    fn reanchor(&mut self, anchor: Block, logs: Vec<Log>) -> BlockOutcome {
        warn!(
            block_number = anchor.number,
            hash = %anchor.hash,
            "reorg exceeds the cached window, re-anchoring"
        );
        self.cache.anchor(anchor);
        self.registry.rollback(anchor.into());
        BlockOutcome { logs, rollback: Some(anchor) }
    }

    /// Delivers logs one at a time, in order, to their subscribers.
    async fn apply_logs(&mut self, logs: &[Log]) {
        for log in logs {
            let Some(entry) = self.registry.entry_mut(&log.address) else {
                continue;
            };
            if entry.initialized_at.is_none() || !entry.matches_topics(&log.topics) {
                continue;
            }
            entry.subscriber.handle_log(log).await;
            entry.last_seen_event_block = Some(BlockRef::new(log.block_number, log.block_hash));
        }
    }

    /// Drains the initialization worklist, running all `initialize` calls
    /// concurrently. Failures are re-queued for a later block.
    async fn init_waiting_subscribers(&mut self, at: BlockRef) {
        let waiting = self.registry.take_waiting();
        if waiting.is_empty() {
            return;
        }
        debug!(count = waiting.len(), block_number = at.number, "initializing subscribers");

        let jobs = waiting.into_iter().filter_map(|address| {
            let subscriber = self.registry.subscriber(&address)?;
            Some(async move { (address, subscriber.initialize(at).await) })
        });

        for (address, result) in join_all(jobs).await {
            match result {
                Ok(()) => self.registry.mark_initialized(address, at),
                Err(error) => {
                    warn!(
                        address = %address.to_checksum(None),
                        %error,
                        "subscriber initialization failed, will retry on a later block"
                    );
                    self.registry.requeue(address);
                }
            }
        }
    }

    fn run_post_block_hooks(&mut self, head: &Block) {
        for hook in std::mem::take(&mut self.post_block_hooks) {
            hook(head);
        }
    }
}
