//! Upstream RPC surface consumed by the engine.
//!
//! The engine never talks to a transport directly; everything it needs from a
//! node is expressed by [`BlockProvider`]. Implementations are expected to be
//! thin: retries, delays, and timeouts are owned by the engine so that the
//! per-operation budgets stay in one place.

use std::{future::Future, sync::Arc, time::Duration};

use alloy::primitives::{Address, BlockNumber};
use backon::{ConstantBuilder, Retryable};
use thiserror::Error;
use tracing::debug;

use crate::types::{Block, Log};

/// Errors returned by [`BlockProvider`] implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Block not found, number: {0}")]
    BlockNotFound(BlockNumber),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Operation timed out")]
    Timeout,
}

/// Read-only access to a remote node.
pub trait BlockProvider: Send + Sync {
    /// Fetches a single block by number.
    fn get_block(&self, number: BlockNumber) -> impl Future<Output = Result<Block, Error>> + Send;

    /// Fetches the blocks in `[from, to]` inclusive, ordered by ascending
    /// number.
    ///
    /// Multicall-style backends sometimes report a zero hash for the newest
    /// block in a batch; the engine repairs that slot with the externally
    /// announced hash, so implementations may pass it through as-is.
    fn batch_get_blocks(
        &self,
        from: BlockNumber,
        to: BlockNumber,
    ) -> impl Future<Output = Result<Vec<Block>, Error>> + Send;

    /// Fetches logs emitted by `addresses` in `[from, to]` inclusive.
    ///
    /// Logs must be ordered by ascending `(block_number, log_index)`.
    fn get_logs(
        &self,
        from: BlockNumber,
        to: BlockNumber,
        addresses: &[Address],
    ) -> impl Future<Output = Result<Vec<Log>, Error>> + Send;
}

impl<P: BlockProvider + ?Sized> BlockProvider for &P {
    fn get_block(&self, number: BlockNumber) -> impl Future<Output = Result<Block, Error>> + Send {
        (**self).get_block(number)
    }

    fn batch_get_blocks(
        &self,
        from: BlockNumber,
        to: BlockNumber,
    ) -> impl Future<Output = Result<Vec<Block>, Error>> + Send {
        (**self).batch_get_blocks(from, to)
    }

    fn get_logs(
        &self,
        from: BlockNumber,
        to: BlockNumber,
        addresses: &[Address],
    ) -> impl Future<Output = Result<Vec<Log>, Error>> + Send {
        (**self).get_logs(from, to, addresses)
    }
}

impl<P: BlockProvider + ?Sized> BlockProvider for Arc<P> {
    fn get_block(&self, number: BlockNumber) -> impl Future<Output = Result<Block, Error>> + Send {
        (**self).get_block(number)
    }

    fn batch_get_blocks(
        &self,
        from: BlockNumber,
        to: BlockNumber,
    ) -> impl Future<Output = Result<Vec<Block>, Error>> + Send {
        (**self).batch_get_blocks(from, to)
    }

    fn get_logs(
        &self,
        from: BlockNumber,
        to: BlockNumber,
        addresses: &[Address],
    ) -> impl Future<Output = Result<Vec<Log>, Error>> + Send {
        (**self).get_logs(from, to, addresses)
    }
}

/// A bounded fixed-delay retry budget.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RetryPolicy {
    pub max_retries: usize,
    pub delay: Duration,
}

/// Runs `operation`, retrying on any error with the fixed delay from
/// `policy`, up to `policy.max_retries` additional attempts.
pub(crate) async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    operation
        .retry(
            ConstantBuilder::default()
                .with_delay(policy.delay)
                .with_max_times(policy.max_retries),
        )
        .notify(|err: &Error, dur: Duration| {
            debug!(error = %err, "RPC call failed, retrying after {dur:?}");
        })
        .sleep(tokio::time::sleep)
        .await
}
