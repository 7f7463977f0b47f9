//! Convenience base for subscribers that derive one state snapshot per block.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use alloy::primitives::BlockNumber;
use async_trait::async_trait;

use crate::{
    subscriber::{InitError, LogSubscriber},
    types::{BlockRef, Log},
};

/// Folds logs into a per-block state snapshot.
pub trait SnapshotReducer: Send + Sync {
    type State: Clone + Send;

    /// The state installed at the anchor block on initialization.
    fn initial_state(&self, anchor: BlockRef) -> Self::State;

    /// Applies one log to the snapshot of its block.
    fn apply(&self, state: Self::State, log: &Log) -> Self::State;
}

struct SnapshotStore<T> {
    by_block: BTreeMap<BlockNumber, T>,
    last_seen: Option<BlockRef>,
}

/// A [`LogSubscriber`] keeping one snapshot per block.
///
/// The first log seen for a new block clones the snapshot at the last seen
/// block and installs the copy before applying the log, so each block's state
/// builds on its predecessor's. On rollback, every snapshot above the target
/// is deleted and the position rewinds, leaving the pre-fork states intact
/// for the replacement blocks to build on.
pub struct StatefulSubscriber<R: SnapshotReducer> {
    reducer: R,
    store: Mutex<SnapshotStore<R::State>>,
}

impl<R: SnapshotReducer> StatefulSubscriber<R> {
    #[must_use]
    pub fn new(reducer: R) -> Self {
        Self { reducer, store: Mutex::new(SnapshotStore { by_block: BTreeMap::new(), last_seen: None }) }
    }

    /// The snapshot derived at `number`, if one exists.
    #[must_use]
    pub fn state_at(&self, number: BlockNumber) -> Option<R::State> {
        self.lock().by_block.get(&number).cloned()
    }

    /// The snapshot at the last seen block.
    #[must_use]
    pub fn latest_state(&self) -> Option<R::State> {
        let store = self.lock();
        let last_seen = store.last_seen?;
        store.by_block.get(&last_seen.number).cloned()
    }

    /// The newest block this subscriber has seen.
    #[must_use]
    pub fn last_seen(&self) -> Option<BlockRef> {
        self.lock().last_seen
    }

    /// Block numbers with a stored snapshot, ascending.
    #[must_use]
    pub fn snapshot_numbers(&self) -> Vec<BlockNumber> {
        self.lock().by_block.keys().copied().collect()
    }

    fn lock(&self) -> MutexGuard<'_, SnapshotStore<R::State>> {
        self.store.lock().expect("snapshot mutex poisoned")
    }
}

#[async_trait]
impl<R: SnapshotReducer> LogSubscriber for StatefulSubscriber<R> {
    async fn initialize(&self, anchor: BlockRef) -> Result<(), InitError> {
        let mut store = self.lock();
        store.by_block.clear();
        store.by_block.insert(anchor.number, self.reducer.initial_state(anchor));
        store.last_seen = Some(anchor);
        Ok(())
    }

    async fn handle_log(&self, log: &Log) {
        let mut store = self.lock();

        if !store.by_block.contains_key(&log.block_number) {
            let base = store
                .last_seen
                .and_then(|seen| store.by_block.get(&seen.number))
                .cloned();
            let Some(base) = base else {
                // not initialized; the engine never delivers logs here
                return;
            };
            store.by_block.insert(log.block_number, base);
        }
        store.last_seen = Some(BlockRef::new(log.block_number, log.block_hash));

        if let Some(state) = store.by_block.remove(&log.block_number) {
            let next = self.reducer.apply(state, log);
            store.by_block.insert(log.block_number, next);
        }
    }

    fn rollback(&self, target: BlockRef) {
        let mut store = self.lock();
        store.by_block.retain(|number, _| *number <= target.number);
        store.last_seen = Some(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{address, block, hash, log_at};

    /// Counts logs per block.
    struct Counting;

    impl SnapshotReducer for Counting {
        type State = u64;

        fn initial_state(&self, _anchor: BlockRef) -> u64 {
            0
        }

        fn apply(&self, state: u64, _log: &Log) -> u64 {
            state + 1
        }
    }

    fn anchor(number: u64) -> BlockRef {
        BlockRef::new(number, hash(number, 0))
    }

    #[tokio::test]
    async fn initialize_installs_initial_snapshot() {
        let subscriber = StatefulSubscriber::new(Counting);

        subscriber.initialize(anchor(100)).await.unwrap();

        assert_eq!(subscriber.state_at(100), Some(0));
        assert_eq!(subscriber.last_seen(), Some(anchor(100)));
    }

    #[tokio::test]
    async fn first_log_of_a_block_copies_previous_snapshot() {
        let subscriber = StatefulSubscriber::new(Counting);
        subscriber.initialize(anchor(100)).await.unwrap();

        subscriber.handle_log(&log_at(&block(101, 0), address(1), 0)).await;
        subscriber.handle_log(&log_at(&block(101, 0), address(1), 1)).await;
        subscriber.handle_log(&log_at(&block(103, 0), address(1), 0)).await;

        assert_eq!(subscriber.state_at(100), Some(0));
        assert_eq!(subscriber.state_at(101), Some(2));
        // 103 builds on 101, the last seen block
        assert_eq!(subscriber.state_at(103), Some(3));
        assert_eq!(subscriber.latest_state(), Some(3));
    }

    #[tokio::test]
    async fn rollback_deletes_snapshots_above_target() {
        let subscriber = StatefulSubscriber::new(Counting);
        subscriber.initialize(anchor(100)).await.unwrap();
        for number in 101..=104 {
            subscriber.handle_log(&log_at(&block(number, 0), address(1), 0)).await;
        }

        subscriber.rollback(anchor(102));

        assert_eq!(subscriber.snapshot_numbers(), vec![100, 101, 102]);
        assert_eq!(subscriber.last_seen(), Some(anchor(102)));
        assert_eq!(subscriber.latest_state(), Some(2));
    }

    #[tokio::test]
    async fn replayed_blocks_build_on_the_rollback_point() {
        let subscriber = StatefulSubscriber::new(Counting);
        subscriber.initialize(anchor(100)).await.unwrap();
        subscriber.handle_log(&log_at(&block(101, 0), address(1), 0)).await;
        subscriber.handle_log(&log_at(&block(102, 0), address(1), 0)).await;

        subscriber.rollback(anchor(101));
        subscriber.handle_log(&log_at(&block(102, 1), address(1), 0)).await;

        assert_eq!(subscriber.state_at(102), Some(2));
        assert_eq!(subscriber.last_seen().map(|b| b.number), Some(102));
    }

    #[tokio::test]
    async fn reinitialize_resets_the_store() {
        let subscriber = StatefulSubscriber::new(Counting);
        subscriber.initialize(anchor(100)).await.unwrap();
        subscriber.handle_log(&log_at(&block(101, 0), address(1), 0)).await;

        subscriber.initialize(anchor(106)).await.unwrap();

        assert_eq!(subscriber.snapshot_numbers(), vec![106]);
        assert_eq!(subscriber.latest_state(), Some(0));
    }
}
