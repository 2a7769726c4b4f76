//! Primary store layer: schema, row models, bulk writer, dead-letter store.

pub mod dead_letter;
pub mod models;
pub mod schema;
pub mod writer;

pub use dead_letter::{
    DeadLetterEntry, DeadLetterStatistics, DeadLetterStore, PostgresDeadLetterStore,
};
pub use models::{EventRow, LogRow, MetricRow, RowBatch, TraceRow};
pub use writer::{EventWriter, FlushStats, PgPool, PostgresEventWriter};
