//! # Event Collector Core
//!
//! Domain layer of the observability event collector: the canonical event
//! model with its wire codec, the rule-based validator, the shared error
//! taxonomy, and environment-driven configuration.
//!
//! The service crate builds the pipeline (broker consumer, worker pool,
//! batcher, stores) on top of these types; nothing in this crate performs
//! I/O.

pub mod config;
pub mod error;
pub mod events;

pub use config::{CollectorConfig, ConfigError, ConfigResult};
pub use error::{CollectorError, CollectorResult};
pub use events::{
    decode, encode, schema_major, DecodeError, Event, EventFamily, EventHeader, EventMetadata,
    EventPayload, EventSource, LogData, MetricsData, TraceData, TracingContext, ValidationCode,
    ValidationError, Validator,
};
