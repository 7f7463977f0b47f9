//! Log retrieval for a block range, with per-log chain verification.

use std::{collections::BTreeMap, time::Duration};

use alloy::primitives::{Address, BlockNumber};
use backon::{ConstantBuilder, Retryable};
use tracing::{debug, info, warn};

use crate::{
    EngineError,
    chain::{
        ancestor::{AncestorError, find_common_ancestor},
        cache::ChainCache,
        repair::populate_until,
    },
    provider::{self, BlockProvider},
    relay::builder::EngineConfig,
    types::{Block, Log},
};

/// The result of a log query.
pub(crate) struct LogQuery {
    /// Logs in ascending `(block_number, log_index)` order.
    pub logs: Vec<Log>,
    /// Set when a fork was detected and repaired mid-query; subscribers must
    /// be rolled back to this block before the logs are applied.
    pub common_ancestor: Option<Block>,
}

/// Why a log query could not complete.
pub(crate) enum FetchError {
    /// A mid-query fork turned out to be deeper than the cached window. The
    /// caller re-anchors at the announced block.
    DeepReorg,
    Failed(EngineError),
}

/// Fetches logs for `(from.number, to.number]` for the given addresses.
///
/// Every returned log's `block_hash` is checked against `overlay` (blocks
/// fetched but not yet cached) and then the cache. A mismatch means the chain
/// forked underneath the query: the common ancestor is re-established, the
/// cache repaired up to `to`, and the query repeated from the ancestor. The
/// deepest ancestor seen across passes is reported so subscribers can be
/// rolled back far enough. Passes are bounded by the log retry budget.
pub(crate) async fn query_logs<P: BlockProvider>(
    cache: &mut ChainCache,
    provider: &P,
    from: Block,
    to: Block,
    addresses: &[Address],
    overlay: Option<&BTreeMap<BlockNumber, Block>>,
    config: &EngineConfig,
) -> Result<LogQuery, FetchError> {
    if addresses.is_empty() {
        return Ok(LogQuery { logs: Vec::new(), common_ancestor: None });
    }

    let mut tracked: BTreeMap<BlockNumber, Block> = overlay.cloned().unwrap_or_default();
    let mut from = from;
    let mut common_ancestor: Option<Block> = None;

    for _pass in 0..=config.log_retry.max_retries {
        if from.number >= to.number {
            return Ok(LogQuery { logs: Vec::new(), common_ancestor });
        }

        let mut logs = fetch_logs(provider, from.number + 1, to.number, addresses, config)
            .await
            .map_err(FetchError::Failed)?;
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        match verify_block_hashes(&logs, cache, &tracked) {
            Verification::Consistent => {
                return Ok(LogQuery { logs, common_ancestor });
            }
            Verification::UnknownBlock(number) => {
                return Err(FetchError::Failed(EngineError::FailedFetchingLogs(format!(
                    "log references block {number} outside the tracked window"
                ))));
            }
            Verification::Mismatch(number) => {
                warn!(
                    block_number = number,
                    "log block hash differs from the tracked chain, resolving fork"
                );
                let ancestor =
                    match find_common_ancestor(cache, provider, config.batch_size, &config.block_retry)
                        .await
                    {
                        Ok(ancestor) => ancestor,
                        Err(AncestorError::NotFoundInCache) => return Err(FetchError::DeepReorg),
                        Err(AncestorError::FailedGetBlock) => {
                            return Err(FetchError::Failed(EngineError::MaxRetryReached));
                        }
                    };

                cache.truncate_above(ancestor.number);
                let repaired = populate_until(cache, provider, &to, &config.block_retry)
                    .await
                    .map_err(FetchError::Failed)?;
                tracked = repaired.into_iter().map(|block| (block.number, block)).collect();

                common_ancestor = Some(match common_ancestor {
                    Some(previous) if previous.number < ancestor.number => previous,
                    _ => ancestor,
                });
                from = ancestor;
                info!(
                    ancestor = ancestor.number,
                    to = to.number,
                    "chain repaired, repeating log query from the common ancestor"
                );
            }
        }
    }

    Err(FetchError::Failed(EngineError::MaxRetryReached))
}

/// One timeout-wrapped, retry-budgeted `get_logs` round-trip.
async fn fetch_logs<P: BlockProvider>(
    provider: &P,
    from: BlockNumber,
    to: BlockNumber,
    addresses: &[Address],
    config: &EngineConfig,
) -> Result<Vec<Log>, EngineError> {
    info!(from, to, addresses = addresses.len(), "fetching logs");

    let result = (|| async {
        match tokio::time::timeout(config.get_logs_timeout, provider.get_logs(from, to, addresses))
            .await
        {
            Ok(response) => response,
            Err(_) => Err(provider::Error::Timeout),
        }
    })
    .retry(
        ConstantBuilder::default()
            .with_delay(config.log_retry.delay)
            .with_max_times(config.log_retry.max_retries),
    )
    .notify(|err: &provider::Error, dur: Duration| {
        if is_expected_during_reorg(err) {
            debug!(error = %err, "log fetch hit a reorg-window error, retrying after {dur:?}");
        } else {
            warn!(error = %err, "log fetch failed, retrying after {dur:?}");
        }
    })
    .sleep(tokio::time::sleep)
    .await;

    result.map_err(|err| match err {
        provider::Error::Timeout => EngineError::Timeout,
        provider::Error::BlockNotFound(number) => {
            EngineError::FailedFetchingLogs(format!("block {number} not found"))
        }
        provider::Error::Rpc(message) => EngineError::FailedFetchingLogs(message),
    })
}

/// Errors nodes routinely return while a reorg is settling; these are not
/// worth a warning.
fn is_expected_during_reorg(err: &provider::Error) -> bool {
    matches!(
        err,
        provider::Error::Rpc(message)
            if message.contains("not processed yet") || message.contains("cannot be found")
    )
}

enum Verification {
    Consistent,
    Mismatch(BlockNumber),
    UnknownBlock(BlockNumber),
}

fn verify_block_hashes(
    logs: &[Log],
    cache: &ChainCache,
    tracked: &BTreeMap<BlockNumber, Block>,
) -> Verification {
    for log in logs {
        let block = tracked.get(&log.block_number).or_else(|| cache.get(log.block_number));
        match block {
            Some(block) if block.hash == log.block_hash => {}
            Some(_) => return Verification::Mismatch(log.block_number),
            None => return Verification::UnknownBlock(log.block_number),
        }
    }
    Verification::Consistent
}
