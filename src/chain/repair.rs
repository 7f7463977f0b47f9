//! Refills the cache between its head and a newer target block.

use alloy::primitives::B256;
use tracing::{debug, info};

use crate::{
    EngineError,
    chain::cache::ChainCache,
    provider::{self, BlockProvider, RetryPolicy},
    types::Block,
};

/// Fetches and chains the blocks in `(head, target.number]` onto the cache.
///
/// Each returned block is verified to chain onto the current head before it
/// is appended. When verification fails the node served an already-reorged
/// tail; the fetch is repeated after the retry delay, up to the block retry
/// budget. Returns every block that was appended so callers can verify log
/// hashes against blocks the bounded cache may already have evicted.
pub(crate) async fn populate_until<P: BlockProvider>(
    cache: &mut ChainCache,
    provider: &P,
    target: &Block,
    retry: &RetryPolicy,
) -> Result<Vec<Block>, EngineError> {
    let mut appended = Vec::new();

    for attempt in 0..=retry.max_retries {
        let head = *cache.head().ok_or(EngineError::NotInitialized)?;
        if head.number >= target.number {
            return Ok(appended);
        }
        if attempt > 0 {
            tokio::time::sleep(retry.delay).await;
        }

        info!(from = head.number + 1, to = target.number, "repairing chain tail");
        let mut blocks =
            provider::with_retry(retry, || provider.batch_get_blocks(head.number + 1, target.number))
                .await
                .map_err(|err| match err {
                    provider::Error::BlockNotFound(number) => EngineError::BlockNotFound(number),
                    _ => EngineError::MaxRetryReached,
                })?;
        repair_zero_hash_tail(&mut blocks, target);

        for block in blocks {
            let head = *cache.head().expect("cache is non-empty while repairing");
            if block.number != head.number + 1 || block.parent_hash != head.hash {
                debug!(
                    block_number = block.number,
                    "fetched batch no longer chains onto the cache, refetching"
                );
                break;
            }
            cache.append(block);
            appended.push(block);
        }
    }

    if cache.head().is_some_and(|head| head.number >= target.number) {
        Ok(appended)
    } else {
        Err(EngineError::MaxRetryReached)
    }
}

/// Repairs the empty hash some batched block fetchers report for the very
/// latest block: when the final entry carries a zero hash at the announced
/// number, the announced hash is substituted. This is the only hash repair
/// the engine performs.
pub(crate) fn repair_zero_hash_tail(blocks: &mut [Block], announced: &Block) {
    if let Some(last) = blocks.last_mut()
        && last.hash == B256::ZERO
        && last.number == announced.number
    {
        debug!(block_number = last.number, "substituting announced hash for zero-hash tail");
        last.hash = announced.hash;
    }
}
