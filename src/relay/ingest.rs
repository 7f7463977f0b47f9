//! Serialized ingestion of inbound headers.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};

use crate::{
    EngineError,
    provider::BlockProvider,
    relay::EventRelay,
    types::{Block, BlockOutcome},
};

/// Default capacity of the outcome stream.
pub const DEFAULT_OUTCOME_BUFFER: usize = 256;

/// A FIFO of inbound headers drained serially into an [`EventRelay`].
///
/// Header sources are free to call [`enqueue`](Self::enqueue) from any task;
/// arrivals accumulate in the queue while a drain is in progress. At most one
/// drain task is active at a time (an atomic latch guards the spawn), and the
/// drainer re-reads the queue after finishing so late arrivals join the same
/// pass. The engine itself sits behind a mutex, so every header is handled to
/// completion before the next one starts, whatever the arrival order.
///
/// Outcomes are published on the stream returned by [`new`](Self::new).
/// Dropping the stream does not stop ingestion; subscribers keep receiving
/// their calls either way.
pub struct BlockIngest<P: BlockProvider> {
    shared: Arc<IngestShared<P>>,
}

impl<P: BlockProvider> Clone for BlockIngest<P> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

struct IngestShared<P: BlockProvider> {
    engine: Mutex<EventRelay<P>>,
    queue: std::sync::Mutex<VecDeque<Block>>,
    draining: AtomicBool,
    stopped: AtomicBool,
    outcomes: mpsc::Sender<Result<BlockOutcome, EngineError>>,
}

impl<P: BlockProvider + 'static> BlockIngest<P> {
    /// Wraps `engine` and returns the ingest handle plus the outcome stream.
    #[must_use]
    pub fn new(engine: EventRelay<P>) -> (Self, ReceiverStream<Result<BlockOutcome, EngineError>>) {
        Self::with_buffer(engine, DEFAULT_OUTCOME_BUFFER)
    }

    /// Like [`new`](Self::new) with an explicit outcome buffer capacity.
    #[must_use]
    pub fn with_buffer(
        engine: EventRelay<P>,
        buffer: usize,
    ) -> (Self, ReceiverStream<Result<BlockOutcome, EngineError>>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let shared = Arc::new(IngestShared {
            engine: Mutex::new(engine),
            queue: std::sync::Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            outcomes: sender,
        });
        (Self { shared }, ReceiverStream::new(receiver))
    }

    /// Locks the wrapped engine, e.g. to anchor it or register subscribers.
    pub async fn engine(&self) -> MutexGuard<'_, EventRelay<P>> {
        self.shared.engine.lock().await
    }

    /// Appends a header to the queue and kicks a drain if none is active.
    ///
    /// Headers enqueued after [`stop`](Self::stop) are discarded.
    pub fn enqueue(&self, header: Block) {
        if self.shared.stopped.load(Ordering::Acquire) {
            trace!(block_number = header.number, "ingest stopped, dropping header");
            return;
        }
        self.shared.queue.lock().expect("ingest queue mutex poisoned").push_back(header);

        if self
            .shared
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(drain(shared));
        }
    }

    /// Stops ingestion cooperatively.
    ///
    /// In-flight header handling completes; queued and future headers are
    /// discarded.
    pub fn stop(&self) {
        debug!("stopping block ingestion");
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.queue.lock().expect("ingest queue mutex poisoned").clear();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

async fn drain<P: BlockProvider>(shared: Arc<IngestShared<P>>) {
    loop {
        let next = shared.queue.lock().expect("ingest queue mutex poisoned").pop_front();

        let Some(header) = next else {
            shared.draining.store(false, Ordering::Release);
            // a header may have arrived between the pop and the release; only
            // one task can win the latch back
            let queue = shared.queue.lock().expect("ingest queue mutex poisoned");
            if queue.is_empty()
                || shared
                    .draining
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                return;
            }
            drop(queue);
            continue;
        };

        if shared.stopped.load(Ordering::Acquire) {
            return;
        }

        trace!(block_number = header.number, "draining header");
        let result = shared.engine.lock().await.handle_block(header).await;

        // a dropped outcome stream does not stop ingestion
        _ = shared.outcomes.send(result).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assert_closed, assert_next,
        relay::EventRelayBuilder,
        test_utils::{MockProvider, block, chain},
    };

    async fn ingest_over(
        provider: Arc<MockProvider>,
        anchor: Block,
    ) -> (BlockIngest<Arc<MockProvider>>, ReceiverStream<Result<BlockOutcome, EngineError>>) {
        let mut engine = EventRelayBuilder::new()
            .max_blocks_cached(10)
            .batch_size(10)
            .build(provider)
            .expect("valid configuration");
        engine.initialize(anchor).await;
        BlockIngest::new(engine)
    }

    #[tokio::test]
    async fn drains_headers_in_order() {
        let provider = Arc::new(MockProvider::with_chain(chain(100..=103, 0)));
        let (ingest, mut outcomes) = ingest_over(Arc::clone(&provider), block(100, 0)).await;

        ingest.enqueue(block(101, 0));
        ingest.enqueue(block(102, 0));
        ingest.enqueue(block(103, 0));

        for _ in 0..3 {
            assert_next!(outcomes, Ok(BlockOutcome::default()));
        }
        assert_eq!(ingest.engine().await.head().unwrap().number, 103);
        assert_eq!(provider.get_logs_calls(), vec![]);
    }

    #[tokio::test]
    async fn late_arrivals_join_the_active_drain() {
        let provider = Arc::new(MockProvider::with_chain(chain(100..=104, 0)));
        let (ingest, mut outcomes) = ingest_over(Arc::clone(&provider), block(100, 0)).await;

        ingest.enqueue(block(101, 0));
        assert_next!(outcomes, Ok(BlockOutcome::default()));

        ingest.enqueue(block(102, 0));
        ingest.enqueue(block(103, 0));
        assert_next!(outcomes, Ok(BlockOutcome::default()));
        assert_next!(outcomes, Ok(BlockOutcome::default()));

        assert_eq!(ingest.engine().await.head().unwrap().number, 103);
    }

    #[tokio::test]
    async fn stop_discards_queued_headers() {
        let provider = Arc::new(MockProvider::with_chain(chain(100..=103, 0)));
        let (ingest, mut outcomes) = ingest_over(Arc::clone(&provider), block(100, 0)).await;

        ingest.enqueue(block(101, 0));
        assert_next!(outcomes, Ok(BlockOutcome::default()));

        ingest.stop();
        ingest.enqueue(block(102, 0));

        assert!(ingest.is_stopped());
        drop(ingest);
        assert_closed!(outcomes);
    }
}
