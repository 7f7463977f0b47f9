use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use alloy::primitives::{Address, B256};
use tracing::debug;

use crate::{
    subscriber::LogSubscriber,
    types::{BlockRef, EventFilter},
};

/// One registered subscription.
pub(crate) struct Subscription {
    pub filter: EventFilter,
    pub subscriber: Arc<dyn LogSubscriber>,
    /// Set once `initialize` succeeds; cleared while re-initialization is
    /// pending.
    pub initialized_at: Option<BlockRef>,
    /// The newest block this subscriber has seen, via `initialize` or
    /// `handle_log`.
    pub last_seen_event_block: Option<BlockRef>,
}

impl Subscription {
    /// Whether a log's topics pass the subscription filter. An empty filter
    /// matches everything; otherwise the first topic must be listed.
    pub fn matches_topics(&self, topics: &[B256]) -> bool {
        self.filter.topics.is_empty()
            || topics.first().is_some_and(|topic| self.filter.topics.contains(topic))
    }
}

/// Address-keyed subscriptions plus the initialization worklist.
///
/// One subscriber per address: a second subscription for the same address
/// replaces the first. Insertion order is retained because it determines the
/// address set passed to `get_logs`.
pub(crate) struct SubscriptionRegistry {
    entries: HashMap<Address, Subscription>,
    order: Vec<Address>,
    waiting_init: BTreeSet<Address>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self { entries: HashMap::new(), order: Vec::new(), waiting_init: BTreeSet::new() }
    }

    /// Registers a subscription and schedules it for initialization.
    pub fn insert(&mut self, filter: EventFilter, subscriber: Arc<dyn LogSubscriber>) {
        let address = filter.address;
        let subscription =
            Subscription { filter, subscriber, initialized_at: None, last_seen_event_block: None };
        if self.entries.insert(address, subscription).is_none() {
            self.order.push(address);
        } else {
            debug!(
                address = %address.to_checksum(None),
                "subscription replaced by a newer registration"
            );
        }
        self.waiting_init.insert(address);
    }

    /// Addresses passed to `get_logs`, in subscription order.
    pub fn addresses(&self) -> Vec<Address> {
        self.order.clone()
    }

    pub fn entry_mut(&mut self, address: &Address) -> Option<&mut Subscription> {
        self.entries.get_mut(address)
    }

    pub fn subscriber(&self, address: &Address) -> Option<Arc<dyn LogSubscriber>> {
        self.entries.get(address).map(|entry| Arc::clone(&entry.subscriber))
    }

    /// Drains the initialization worklist.
    pub fn take_waiting(&mut self) -> Vec<Address> {
        std::mem::take(&mut self.waiting_init).into_iter().collect()
    }

    /// Puts an address back on the worklist after a failed initialization.
    pub fn requeue(&mut self, address: Address) {
        if self.entries.contains_key(&address) {
            self.waiting_init.insert(address);
        }
    }

    /// Addresses currently waiting for initialization, ascending.
    pub fn waiting(&self) -> Vec<Address> {
        self.waiting_init.iter().copied().collect()
    }

    pub fn mark_initialized(&mut self, address: Address, at: BlockRef) {
        if let Some(entry) = self.entries.get_mut(&address) {
            entry.initialized_at = Some(at);
            entry.last_seen_event_block = Some(at);
        }
    }

    /// Informs every subscription of a fork at `target`.
    ///
    /// A subscription whose anchor is newer than `target` lost the block it
    /// was initialized at: it is reset and re-queued for initialization.
    /// A subscription that has seen events newer than `target` is told to
    /// roll back. Everything else is untouched.
    pub fn rollback(&mut self, target: BlockRef) {
        for (address, entry) in &mut self.entries {
            if let Some(anchor) = entry.initialized_at
                && anchor.number > target.number
            {
                debug!(
                    address = %address.to_checksum(None),
                    anchor = anchor.number,
                    target = target.number,
                    "subscriber anchor reorged away, scheduling re-initialization"
                );
                entry.initialized_at = None;
                entry.last_seen_event_block = None;
                self.waiting_init.insert(*address);
            } else if let Some(seen) = entry.last_seen_event_block
                && seen.number > target.number
            {
                entry.subscriber.rollback(target);
                entry.last_seen_event_block = Some(target);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
