//! # Event Collector Service
//!
//! The collector pipeline: an AMQP consumer feeding a fixed worker pool that
//! decodes, validates, and deduplicates events before a single batching task
//! bulk-writes them into PostgreSQL. Poison messages and exhausted batches
//! land in a dead-letter store; Prometheus metrics and a health endpoint
//! observe every stage; the supervisor owns startup order and graceful
//! shutdown.
//!
//! Data flow:
//!
//! ```text
//! broker ─▶ consumer ─▶ workers ─▶ (validate ─▶ dedup) ─▶ batcher ─▶ store
//!                          │                                 │
//!                          └────────── dead letters ◀────────┘
//! ```

pub mod bootstrap;
pub mod broker;
pub mod cache;
pub mod db;
pub mod monitoring;
pub mod pipeline;
pub mod retry;

pub use bootstrap::{RunOutcome, Supervisor};
