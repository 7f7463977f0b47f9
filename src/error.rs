use alloy::primitives::BlockNumber;
use thiserror::Error;

/// Errors surfaced by the engine.
///
/// Transient RPC failures are absorbed by the retry loops and never reach
/// callers; what does reach them is either a structural failure (an exhausted
/// retry budget, a block the node cannot produce) or a configuration mistake
/// caught at build time. Deep reorgs are not errors: the engine re-anchors
/// and reports them through [`BlockOutcome::rollback`](crate::BlockOutcome).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine is not initialized, anchor it to a block first")]
    NotInitialized,

    #[error("Block not found, number: {0}")]
    BlockNotFound(BlockNumber),

    #[error("Retry budget exhausted while reconciling with the remote node")]
    MaxRetryReached,

    #[error("Failed fetching logs: {0}")]
    FailedFetchingLogs(String),

    #[error("Log fetch timed out")]
    Timeout,

    #[error("Max cached blocks must be greater than 0")]
    InvalidCacheDepth,

    #[error("Batch size must be greater than 0")]
    InvalidBatchSize,

    #[error("Max cached blocks must not exceed the batch size")]
    CacheDepthExceedsBatchSize,
}
