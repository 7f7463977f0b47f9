//! The downstream contract: consumers of ordered, reorg-consistent logs.
//!
//! A subscriber registers for a single address (see
//! [`EventRelay::subscribe_to_logs`](crate::EventRelay::subscribe_to_logs))
//! and receives three kinds of calls, in a strict order:
//!
//! * `initialize(anchor)` happens before any `handle_log`, and again whenever
//!   the block it was anchored at is reorged away.
//! * `handle_log` calls arrive one at a time, in ascending
//!   `(block_number, log_index)` order.
//! * `rollback(target)` happens before any later `handle_log` for blocks
//!   above `target`; the subscriber must discard state derived from blocks
//!   newer than `target`.
//!
//! Subscribers that derive one state snapshot per block can use
//! [`StatefulSubscriber`] instead of implementing the trait by hand.

pub(crate) mod registry;
mod stateful;

use async_trait::async_trait;
use thiserror::Error;

pub use stateful::{SnapshotReducer, StatefulSubscriber};

use crate::types::{BlockRef, Log};

/// A subscriber-reported initialization failure.
///
/// Failed subscribers stay on the initialization worklist and are retried on
/// a later block.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Subscriber initialization failed: {0}")]
pub struct InitError(pub String);

impl From<&str> for InitError {
    fn from(message: &str) -> Self {
        Self(message.to_owned())
    }
}

impl From<String> for InitError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// Consumer of the engine's ordered log stream.
#[async_trait]
pub trait LogSubscriber: Send + Sync {
    /// Establishes the subscriber's starting state at `anchor`.
    async fn initialize(&self, anchor: BlockRef) -> Result<(), InitError>;

    /// Applies one log. Must not fail; errors are the subscriber's to handle
    /// and log.
    async fn handle_log(&self, log: &Log);

    /// Discards state derived from blocks newer than `target`.
    ///
    /// Called synchronously from the engine's reorg handling; implementations
    /// must not block on I/O.
    fn rollback(&self, target: BlockRef);
}
