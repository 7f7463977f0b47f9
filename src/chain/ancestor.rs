//! Common-ancestor search between the cached tail and the remote chain.

use std::collections::HashMap;

use alloy::primitives::{B256, BlockNumber};
use tracing::{debug, info, warn};

use crate::{
    chain::cache::ChainCache,
    provider::{self, BlockProvider, RetryPolicy},
    types::Block,
};

/// Why no common ancestor could be established.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AncestorError {
    /// The fork is deeper than the cached window, or the cache holds a single
    /// entry and offers no depth to compare.
    NotFoundInCache,
    /// The remote batch could not be fetched within the retry budget.
    FailedGetBlock,
}

/// Finds the deepest cached block that still matches the remote chain.
///
/// One batched call covers `[head - batch_size, head]`; the cache is then
/// walked from the head downward and the first hash match wins. A single
/// round-trip replaces one lookup per cached entry, which is why the cache
/// depth is capped at the batch size.
pub(crate) async fn find_common_ancestor<P: BlockProvider>(
    cache: &ChainCache,
    provider: &P,
    batch_size: u64,
    retry: &RetryPolicy,
) -> Result<Block, AncestorError> {
    if cache.len() <= 1 {
        debug!("cache holds a single block, no depth to compare against");
        return Err(AncestorError::NotFoundInCache);
    }
    let head = *cache.head().expect("cache checked non-empty above");

    let from = head.number.saturating_sub(batch_size);
    info!(from, to = head.number, "fetching remote batch for ancestor search");

    let remote = provider::with_retry(retry, || provider.batch_get_blocks(from, head.number))
        .await
        .map_err(|err| {
            warn!(error = %err, "ancestor search could not fetch the remote batch");
            AncestorError::FailedGetBlock
        })?;

    let remote_hashes: HashMap<BlockNumber, B256> =
        remote.iter().map(|block| (block.number, block.hash)).collect();

    for depth in 0..cache.len() as u64 {
        let number = head.number - depth;
        let Some(cached) = cache.get(number) else {
            break;
        };
        if remote_hashes.get(&number) == Some(&cached.hash) {
            info!(block_number = number, hash = %cached.hash, "common ancestor found");
            return Ok(*cached);
        }
    }

    warn!(depth = cache.len(), "fork is deeper than the cached window");
    Err(AncestorError::NotFoundInCache)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::{MockProvider, block, chain, fork_block};

    fn retry() -> RetryPolicy {
        RetryPolicy { max_retries: 1, delay: Duration::from_millis(1) }
    }

    fn cache_of(blocks: &[Block]) -> ChainCache {
        let mut cache = ChainCache::new(blocks.len());
        let mut iter = blocks.iter();
        cache.anchor(*iter.next().unwrap());
        for b in iter {
            cache.append(*b);
        }
        cache
    }

    #[tokio::test]
    async fn single_entry_cache_has_no_depth() {
        let provider = MockProvider::with_chain(chain(100..=100, 0));
        let cache = cache_of(&chain(100..=100, 0));

        let result = find_common_ancestor(&cache, &provider, 10, &retry()).await;

        assert_eq!(result, Err(AncestorError::NotFoundInCache));
        assert!(provider.batch_calls().is_empty());
    }

    #[tokio::test]
    async fn finds_deepest_matching_block() {
        // Remote chain diverges above 101.
        let mut canonical = chain(93..=101, 0);
        canonical.push(fork_block(102, 1, 0));
        canonical.push(block(103, 1));
        let provider = MockProvider::with_chain(canonical);

        let cache = cache_of(&chain(99..=103, 0));

        let ancestor = find_common_ancestor(&cache, &provider, 10, &retry()).await.unwrap();

        assert_eq!(ancestor.number, 101);
        assert_eq!(provider.batch_calls(), vec![(93, 103)]);
    }

    #[tokio::test]
    async fn no_match_within_window_is_not_found() {
        let provider = MockProvider::with_chain(chain(93..=103, 1));
        let cache = cache_of(&chain(100..=103, 0));

        let result = find_common_ancestor(&cache, &provider, 10, &retry()).await;

        assert_eq!(result, Err(AncestorError::NotFoundInCache));
    }

    #[tokio::test]
    async fn batch_failure_exhausts_retry_budget() {
        let provider = MockProvider::with_chain(chain(100..=103, 0));
        provider.fail_next_batches(provider::Error::Rpc("boom".into()), 2);

        let cache = cache_of(&chain(100..=103, 0));

        let result = find_common_ancestor(&cache, &provider, 10, &retry()).await;

        assert_eq!(result, Err(AncestorError::FailedGetBlock));
        // initial attempt plus one retry
        assert_eq!(provider.batch_calls().len(), 2);
    }
}
