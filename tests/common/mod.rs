#![allow(dead_code)] // each test binary uses its own subset of the helpers

use std::{sync::Arc, time::Duration};

use event_relay::{Block, EventRelay, EventRelayBuilder, test_utils::MockProvider};

/// An engine over `provider` with fast retry delays, anchored at `anchor`.
pub async fn anchored_engine(
    provider: Arc<MockProvider>,
    max_blocks_cached: usize,
    batch_size: u64,
    anchor: Block,
) -> EventRelay<Arc<MockProvider>> {
    let mut engine = configured(max_blocks_cached, batch_size)
        .build(provider)
        .expect("valid configuration");
    engine.initialize(anchor).await;
    engine
}

/// A builder with test-friendly retry settings.
pub fn configured(max_blocks_cached: usize, batch_size: u64) -> EventRelayBuilder {
    EventRelayBuilder::new()
        .max_blocks_cached(max_blocks_cached)
        .batch_size(batch_size)
        .max_retry_get_block(2)
        .retry_delay_get_block(Duration::from_millis(1))
        .max_retry_get_logs(2)
        .retry_delay_get_logs(Duration::from_millis(1))
        .get_logs_timeout(Duration::from_secs(1))
}
