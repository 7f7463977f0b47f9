//! Forward progress without reorgs: successors, gaps, duplicates.

mod common;

use std::sync::Arc;

use event_relay::{
    EventFilter,
    test_utils::{MockProvider, RecordingSubscriber, SubscriberEvent, address, block, chain, log_at},
};

use crate::common::anchored_engine;

#[tokio::test]
async fn linear_advance_queries_each_new_block_once() {
    let blocks = chain(100..=102, 0);
    let provider = Arc::new(MockProvider::with_chain(blocks.clone()));
    provider.add_log(log_at(&blocks[1], address(1), 0));
    provider.add_log(log_at(&blocks[2], address(1), 0));

    let mut engine = anchored_engine(Arc::clone(&provider), 10, 10, block(100, 0)).await;
    let subscriber = Arc::new(RecordingSubscriber::new());
    engine.subscribe_to_logs(EventFilter::new(address(1)), subscriber.clone()).await;

    let first = engine.handle_block(block(101, 0)).await.unwrap();
    let second = engine.handle_block(block(102, 0)).await.unwrap();

    assert!(first.rollback.is_none());
    assert!(second.rollback.is_none());
    assert_eq!(provider.get_logs_calls(), vec![(101, 101), (102, 102)]);
    assert_eq!(engine.cache().numbers(), vec![100, 101, 102]);
    assert_eq!(
        subscriber.events(),
        vec![
            SubscriberEvent::Initialized(100),
            SubscriberEvent::Log { block_number: 101, log_index: 0 },
            SubscriberEvent::Log { block_number: 102, log_index: 0 },
        ]
    );
}

#[tokio::test]
async fn duplicate_header_is_applied_once() {
    let blocks = chain(100..=101, 0);
    let provider = Arc::new(MockProvider::with_chain(blocks.clone()));
    provider.add_log(log_at(&blocks[1], address(1), 0));

    let mut engine = anchored_engine(Arc::clone(&provider), 10, 10, block(100, 0)).await;
    let subscriber = Arc::new(RecordingSubscriber::new());
    engine.subscribe_to_logs(EventFilter::new(address(1)), subscriber.clone()).await;

    let first = engine.handle_block(block(101, 0)).await.unwrap();
    let repeat = engine.handle_block(block(101, 0)).await.unwrap();

    assert_eq!(first.logs.len(), 1);
    assert!(repeat.logs.is_empty());
    assert!(repeat.rollback.is_none());
    assert_eq!(provider.get_logs_calls(), vec![(101, 101)]);
    assert_eq!(subscriber.handled(), vec![(101, 0)]);
}

#[tokio::test]
async fn gap_is_filled_in_one_batch() {
    let blocks = chain(100..=105, 0);
    let provider = Arc::new(MockProvider::with_chain(blocks.clone()));
    provider.add_log(log_at(&blocks[2], address(1), 0));
    provider.add_log(log_at(&blocks[5], address(1), 0));

    let mut engine = anchored_engine(Arc::clone(&provider), 10, 10, block(100, 0)).await;
    let subscriber = Arc::new(RecordingSubscriber::new());
    engine.subscribe_to_logs(EventFilter::new(address(1)), subscriber.clone()).await;

    let outcome = engine.handle_block(block(105, 0)).await.unwrap();

    assert!(outcome.rollback.is_none());
    // the chunk fetch starts one block early to verify parentage
    assert_eq!(provider.batch_calls(), vec![(100, 105)]);
    assert_eq!(provider.get_logs_calls(), vec![(101, 105)]);
    assert_eq!(engine.cache().numbers(), vec![100, 101, 102, 103, 104, 105]);
    assert_eq!(subscriber.handled(), vec![(102, 0), (105, 0)]);
}

#[tokio::test]
async fn wide_gap_is_chunked_by_batch_size() {
    let provider = Arc::new(MockProvider::with_chain(chain(100..=107, 0)));

    let mut engine = anchored_engine(Arc::clone(&provider), 3, 3, block(100, 0)).await;
    let subscriber = Arc::new(RecordingSubscriber::new());
    engine.subscribe_to_logs(EventFilter::new(address(1)), subscriber.clone()).await;

    let outcome = engine.handle_block(block(107, 0)).await.unwrap();

    assert!(outcome.rollback.is_none());
    assert_eq!(provider.batch_calls(), vec![(100, 103), (103, 106), (106, 107)]);
    assert_eq!(provider.get_logs_calls(), vec![(101, 103), (104, 106), (107, 107)]);
    // the cache keeps only the configured depth
    assert_eq!(engine.cache().numbers(), vec![105, 106, 107]);
}

#[tokio::test]
async fn zero_hash_tail_is_repaired_with_announced_hash() {
    let provider = Arc::new(MockProvider::with_chain(chain(100..=104, 0)));
    provider.set_zero_hash_latest(true);

    let mut engine = anchored_engine(Arc::clone(&provider), 10, 10, block(100, 0)).await;

    let announced = block(104, 0);
    let outcome = engine.handle_block(announced).await.unwrap();

    assert!(outcome.rollback.is_none());
    assert_eq!(engine.cache().head().unwrap().hash, announced.hash);
}

#[tokio::test]
async fn delivered_logs_stay_ordered_across_blocks() {
    let blocks = chain(100..=106, 0);
    let provider = Arc::new(MockProvider::with_chain(blocks.clone()));
    for (index, number) in [(1u64, 3usize), (0, 3), (0, 2), (2, 5), (0, 6)] {
        provider.add_log(log_at(&blocks[number], address(1), index));
    }

    let mut engine = anchored_engine(Arc::clone(&provider), 10, 10, block(100, 0)).await;
    let subscriber = Arc::new(RecordingSubscriber::new());
    engine.subscribe_to_logs(EventFilter::new(address(1)), subscriber.clone()).await;

    engine.handle_block(block(106, 0)).await.unwrap();

    let handled = subscriber.handled();
    assert_eq!(handled, vec![(102, 0), (103, 0), (103, 1), (105, 2), (106, 0)]);
    let mut sorted = handled.clone();
    sorted.sort_unstable();
    assert_eq!(handled, sorted);
}

#[tokio::test]
async fn initialize_at_anchors_from_the_provider() -> anyhow::Result<()> {
    let provider = Arc::new(MockProvider::with_chain(chain(100..=102, 0)));
    let mut engine = common::configured(10, 10).build(Arc::clone(&provider))?;

    engine.initialize_at(101).await?;

    assert_eq!(provider.get_block_calls(), vec![101]);
    assert_eq!(engine.head().unwrap().number, 101);
    assert_eq!(engine.cache().numbers(), vec![101]);

    Ok(())
}
