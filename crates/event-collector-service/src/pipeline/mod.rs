//! The processing pipeline between the broker and the primary store.

use crate::broker::AckHandle;
use crate::db::EventRow;

pub mod batcher;
pub mod worker;

pub use batcher::{AdaptiveBatchSize, Batcher, BatcherConfig};
pub use worker::{WorkerContext, WorkerPool};

/// A validated event travelling from a worker to the batcher.
///
/// Carries the original message bytes so a flush failure can dead-letter the
/// exact payload that arrived, and the ack handle whose disposition is
/// decided by the batch outcome.
#[derive(Debug)]
pub struct PendingEvent {
    pub row: EventRow,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub ack: AckHandle,
}
