use std::time::Duration;

use crate::{
    EngineError,
    chain::cache::ChainCache,
    provider::{BlockProvider, RetryPolicy},
    relay::EventRelay,
    subscriber::registry::SubscriptionRegistry,
};

/// Default number of blocks kept in the chain cache.
pub const DEFAULT_MAX_BLOCKS_CACHED: usize = 32;

/// Default RPC batch width for block and log fetches.
pub const DEFAULT_BATCH_SIZE: u64 = 128;

/// Default retry budget for block fetches.
pub const DEFAULT_MAX_RETRY_GET_BLOCK: usize = 3;

/// Default delay between block fetch retries.
pub const DEFAULT_RETRY_DELAY_GET_BLOCK: Duration = Duration::from_millis(500);

/// Default retry budget for log fetches.
pub const DEFAULT_MAX_RETRY_GET_LOGS: usize = 3;

/// Default delay between log fetch retries.
pub const DEFAULT_RETRY_DELAY_GET_LOGS: Duration = Duration::from_millis(300);

/// Default per-call deadline for log fetches.
pub const DEFAULT_GET_LOGS_TIMEOUT: Duration = Duration::from_secs(30);

/// Default pause between gap-filling chunks.
pub const DEFAULT_CHUNK_PAUSE: Duration = Duration::ZERO;

#[derive(Clone, Copy, Debug)]
pub(crate) struct EngineConfig {
    pub batch_size: u64,
    pub block_retry: RetryPolicy,
    pub log_retry: RetryPolicy,
    pub get_logs_timeout: Duration,
    pub chunk_pause: Duration,
}

/// Builder/configuration for [`EventRelay`].
#[derive(Clone, Debug)]
pub struct EventRelayBuilder {
    /// How many recent canonical blocks to keep in memory. Bounds how deep a
    /// reorg can be repaired without re-anchoring.
    pub max_blocks_cached: usize,
    /// Maximum number of blocks per RPC batch. Must be at least
    /// `max_blocks_cached`: the ancestor search scans the whole cache against
    /// a single batch.
    pub batch_size: u64,
    pub max_retry_get_block: usize,
    pub retry_delay_get_block: Duration,
    pub max_retry_get_logs: usize,
    pub retry_delay_get_logs: Duration,
    /// Per-call deadline for log fetches, counted against the log retry
    /// budget when exceeded.
    pub get_logs_timeout: Duration,
    /// Pause between gap-filling chunks, giving a lagging node time to catch
    /// up. Zero disables the throttle.
    pub chunk_pause: Duration,
}

impl Default for EventRelayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRelayBuilder {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_blocks_cached: DEFAULT_MAX_BLOCKS_CACHED,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retry_get_block: DEFAULT_MAX_RETRY_GET_BLOCK,
            retry_delay_get_block: DEFAULT_RETRY_DELAY_GET_BLOCK,
            max_retry_get_logs: DEFAULT_MAX_RETRY_GET_LOGS,
            retry_delay_get_logs: DEFAULT_RETRY_DELAY_GET_LOGS,
            get_logs_timeout: DEFAULT_GET_LOGS_TIMEOUT,
            chunk_pause: DEFAULT_CHUNK_PAUSE,
        }
    }

    /// Sets how many recent blocks the chain cache holds.
    ///
    /// Must be greater than 0 and no larger than the batch size.
    #[must_use]
    pub fn max_blocks_cached(mut self, max_blocks_cached: usize) -> Self {
        self.max_blocks_cached = max_blocks_cached;
        self
    }

    /// Sets the RPC batch width for block and log fetches.
    ///
    /// Must be greater than 0.
    #[must_use]
    pub fn batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the retry budget for block fetches.
    #[must_use]
    pub fn max_retry_get_block(mut self, max_retry_get_block: usize) -> Self {
        self.max_retry_get_block = max_retry_get_block;
        self
    }

    /// Sets the delay between block fetch retries.
    #[must_use]
    pub fn retry_delay_get_block(mut self, retry_delay_get_block: Duration) -> Self {
        self.retry_delay_get_block = retry_delay_get_block;
        self
    }

    /// Sets the retry budget for log fetches.
    #[must_use]
    pub fn max_retry_get_logs(mut self, max_retry_get_logs: usize) -> Self {
        self.max_retry_get_logs = max_retry_get_logs;
        self
    }

    /// Sets the delay between log fetch retries.
    #[must_use]
    pub fn retry_delay_get_logs(mut self, retry_delay_get_logs: Duration) -> Self {
        self.retry_delay_get_logs = retry_delay_get_logs;
        self
    }

    /// Sets the per-call deadline for log fetches.
    #[must_use]
    pub fn get_logs_timeout(mut self, get_logs_timeout: Duration) -> Self {
        self.get_logs_timeout = get_logs_timeout;
        self
    }

    /// Sets the pause between gap-filling chunks.
    #[must_use]
    pub fn chunk_pause(mut self, chunk_pause: Duration) -> Self {
        self.chunk_pause = chunk_pause;
        self
    }

    /// Builds the engine around `provider`.
    ///
    /// # Errors
    ///
    /// * [`EngineError::InvalidCacheDepth`] - if `max_blocks_cached` is 0.
    /// * [`EngineError::InvalidBatchSize`] - if `batch_size` is 0.
    /// * [`EngineError::CacheDepthExceedsBatchSize`] - if the cache is deeper
    ///   than one batch.
    pub fn build<P: BlockProvider>(self, provider: P) -> Result<EventRelay<P>, EngineError> {
        if self.max_blocks_cached == 0 {
            return Err(EngineError::InvalidCacheDepth);
        }
        if self.batch_size == 0 {
            return Err(EngineError::InvalidBatchSize);
        }
        if self.max_blocks_cached as u64 > self.batch_size {
            return Err(EngineError::CacheDepthExceedsBatchSize);
        }

        let config = EngineConfig {
            batch_size: self.batch_size,
            block_retry: RetryPolicy {
                max_retries: self.max_retry_get_block,
                delay: self.retry_delay_get_block,
            },
            log_retry: RetryPolicy {
                max_retries: self.max_retry_get_logs,
                delay: self.retry_delay_get_logs,
            },
            get_logs_timeout: self.get_logs_timeout,
            chunk_pause: self.chunk_pause,
        };

        Ok(EventRelay {
            provider,
            config,
            cache: ChainCache::new(self.max_blocks_cached),
            registry: SubscriptionRegistry::new(),
            post_block_hooks: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockProvider;

    #[test]
    fn builder_defaults_match_constants() {
        let builder = EventRelayBuilder::new();

        assert_eq!(builder.max_blocks_cached, DEFAULT_MAX_BLOCKS_CACHED);
        assert_eq!(builder.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(builder.chunk_pause, Duration::ZERO);
    }

    #[test]
    fn builder_methods_update_configuration() {
        let builder = EventRelayBuilder::new()
            .max_blocks_cached(5)
            .batch_size(40)
            .max_retry_get_block(7)
            .max_retry_get_logs(9);

        assert_eq!(builder.max_blocks_cached, 5);
        assert_eq!(builder.batch_size, 40);
        assert_eq!(builder.max_retry_get_block, 7);
        assert_eq!(builder.max_retry_get_logs, 9);
    }

    #[test]
    fn rejects_zero_cache_depth() {
        let result = EventRelayBuilder::new().max_blocks_cached(0).build(MockProvider::new());

        assert!(matches!(result, Err(EngineError::InvalidCacheDepth)));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let result = EventRelayBuilder::new().batch_size(0).build(MockProvider::new());

        assert!(matches!(result, Err(EngineError::InvalidBatchSize)));
    }

    #[test]
    fn rejects_cache_deeper_than_batch() {
        let result =
            EventRelayBuilder::new().max_blocks_cached(50).batch_size(10).build(MockProvider::new());

        assert!(matches!(result, Err(EngineError::CacheDepthExceedsBatchSize)));
    }
}
