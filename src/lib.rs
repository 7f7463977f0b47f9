//! Reliable, reorg-aware event log delivery for EVM chains.
//!
//! `event-relay` sits between a block header source and your application: it
//! ingests raw headers, keeps a bounded in-memory tail of the canonical
//! chain, fetches the logs each header uncovers, detects and repairs chain
//! reorganizations, and delivers a consistent, ordered, de-duplicated log
//! stream to per-address subscribers. On a reorg, subscribers are told how
//! far to roll back before the replacement logs arrive.
//!
//! The remote node is reached through the [`provider::BlockProvider`] trait;
//! any transport that can serve single blocks, block batches, and log ranges
//! can back the engine.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use event_relay::{
//!     Block, BlockIngest, EventFilter, EventRelayBuilder,
//!     provider::BlockProvider,
//!     subscriber::LogSubscriber,
//! };
//! use tokio_stream::StreamExt;
//!
//! # async fn example(
//! #     provider: impl BlockProvider + 'static,
//! #     header_source: tokio::sync::mpsc::Receiver<Block>,
//! #     contract: alloy::primitives::Address,
//! #     subscriber: Arc<dyn LogSubscriber>,
//! #     anchor: Block,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let mut engine = EventRelayBuilder::new()
//!     .max_blocks_cached(64)
//!     .batch_size(200)
//!     .build(provider)?;
//!
//! engine.initialize(anchor).await;
//! engine.subscribe_to_logs(EventFilter::new(contract), subscriber).await;
//!
//! let (ingest, mut outcomes) = BlockIngest::new(engine);
//!
//! // the header source pushes into the queue; one drain task feeds the engine
//! let mut header_source = header_source;
//! let feeder = ingest.clone();
//! tokio::spawn(async move {
//!     while let Some(header) = header_source.recv().await {
//!         feeder.enqueue(header);
//!     }
//! });
//!
//! while let Some(outcome) = outcomes.next().await {
//!     let outcome = outcome?;
//!     if let Some(rollback) = outcome.rollback {
//!         println!("rolled back to {rollback}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod provider;
pub mod subscriber;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

mod chain;
mod error;
mod relay;
mod types;

pub use chain::ChainCache;
pub use error::EngineError;
pub use relay::{
    BlockIngest, DEFAULT_BATCH_SIZE, DEFAULT_CHUNK_PAUSE, DEFAULT_GET_LOGS_TIMEOUT,
    DEFAULT_MAX_BLOCKS_CACHED, DEFAULT_MAX_RETRY_GET_BLOCK, DEFAULT_MAX_RETRY_GET_LOGS,
    DEFAULT_OUTCOME_BUFFER, DEFAULT_RETRY_DELAY_GET_BLOCK, DEFAULT_RETRY_DELAY_GET_LOGS,
    EventRelay, EventRelayBuilder,
};
pub use types::{Block, BlockOutcome, BlockRef, EventFilter, Log};
