//! Dead-letter store for unprocessable messages.
//!
//! Poison messages (decode or validation failures) and batches that
//! exhausted their flush retries land here with the failure reason and the
//! original message bytes. The write itself is retried with the flush
//! backoff policy; only after that is exhausted does the caller nack the
//! delivery back to the broker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use event_collector_core::{CollectorError, CollectorResult};

use super::schema::dead_letter_events;
use super::writer::PgPool;
use crate::monitoring::metrics::DEAD_LETTER_PERSISTED_TOTAL;
use crate::retry::BackoffPolicy;

/// A dead-lettered message and its failure bookkeeping
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub event_id: Option<Uuid>,
    pub routing_key: String,
    pub original_message: Vec<u8>,
    pub error_message: String,
    pub error_details: Value,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Entry for a message that failed decoding or validation. Terminal:
    /// never retried against the same bytes.
    pub fn poison(
        routing_key: &str,
        original_message: Vec<u8>,
        error_message: String,
        error_details: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: None,
            routing_key: routing_key.to_string(),
            original_message,
            error_message,
            error_details,
            retry_count: 0,
            max_retries: 0,
            last_retry_at: None,
            next_retry_at: None,
            resolved: false,
            created_at: Utc::now(),
        }
    }

    /// Entry for an event whose batch exhausted its flush retries.
    pub fn flush_failure(
        event_id: Uuid,
        routing_key: &str,
        original_message: Vec<u8>,
        error_message: String,
        attempts: u32,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: Some(event_id),
            routing_key: routing_key.to_string(),
            original_message,
            error_message,
            error_details: Value::Null,
            retry_count: attempts as i32,
            max_retries: max_retries as i32,
            last_retry_at: Some(Utc::now()),
            next_retry_at: None,
            resolved: false,
            created_at: Utc::now(),
        }
    }
}

/// Counts and ages over the dead-letter table
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterStatistics {
    pub total_entries: i64,
    pub unresolved_entries: i64,
    pub resolved_entries: i64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

/// Dead-letter persistence interface
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Persist an entry, retrying transient store failures internally.
    async fn persist(&self, entry: DeadLetterEntry) -> CollectorResult<()>;

    /// Mark an entry as handled by external tooling.
    async fn mark_resolved(&self, entry_id: Uuid) -> CollectorResult<()>;

    /// Counts for the health/ops surface.
    async fn statistics(&self) -> CollectorResult<DeadLetterStatistics>;

    /// Delete resolved entries older than the cutoff; returns rows removed.
    async fn purge_resolved(&self, older_than: DateTime<Utc>) -> CollectorResult<usize>;
}

#[derive(Debug, Clone, Queryable, Insertable, Selectable)]
#[diesel(table_name = dead_letter_events)]
struct DeadLetterRecord {
    id: Uuid,
    event_id: Option<Uuid>,
    routing_key: String,
    original_message: Vec<u8>,
    error_message: String,
    error_details: Value,
    retry_count: i32,
    max_retries: i32,
    last_retry_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    resolved: bool,
    created_at: DateTime<Utc>,
}

impl From<DeadLetterEntry> for DeadLetterRecord {
    fn from(entry: DeadLetterEntry) -> Self {
        Self {
            id: entry.id,
            event_id: entry.event_id,
            routing_key: entry.routing_key,
            original_message: entry.original_message,
            error_message: entry.error_message,
            error_details: entry.error_details,
            retry_count: entry.retry_count,
            max_retries: entry.max_retries,
            last_retry_at: entry.last_retry_at,
            next_retry_at: entry.next_retry_at,
            resolved: entry.resolved,
            created_at: entry.created_at,
        }
    }
}

/// PostgreSQL implementation sharing the writer's connection pool
pub struct PostgresDeadLetterStore {
    pool: Arc<PgPool>,
    policy: BackoffPolicy,
    max_attempts: u32,
}

impl PostgresDeadLetterStore {
    pub fn new(pool: Arc<PgPool>, retry_interval: std::time::Duration, max_attempts: u32) -> Self {
        Self {
            pool,
            policy: BackoffPolicy::flush(retry_interval),
            max_attempts: max_attempts.max(1),
        }
    }

    async fn insert_once(&self, record: DeadLetterRecord) -> CollectorResult<()> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> CollectorResult<()> {
            let mut conn = pool.get().map_err(|e| CollectorError::DeadLetterError {
                message: format!("Failed to get database connection: {}", e),
            })?;
            diesel::insert_into(dead_letter_events::table)
                .values(&record)
                .execute(&mut conn)
                .map_err(|e| CollectorError::DeadLetterError {
                    message: e.to_string(),
                })?;
            Ok(())
        })
        .await
        .map_err(|e| CollectorError::DeadLetterError {
            message: format!("dead letter task panicked: {}", e),
        })?
    }
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    async fn persist(&self, entry: DeadLetterEntry) -> CollectorResult<()> {
        let reason = if entry.event_id.is_some() {
            "flush_failure"
        } else {
            "poison"
        };
        let record = DeadLetterRecord::from(entry);

        let mut attempt = 0;
        loop {
            match self.insert_once(record.clone()).await {
                Ok(()) => {
                    DEAD_LETTER_PERSISTED_TOTAL
                        .with_label_values(&[reason])
                        .inc();
                    return Ok(());
                }
                Err(e) if attempt + 1 < self.max_attempts => {
                    let delay = self.policy.delay(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "dead letter insert failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn mark_resolved(&self, entry_id: Uuid) -> CollectorResult<()> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> CollectorResult<()> {
            let mut conn = pool.get().map_err(|e| CollectorError::DeadLetterError {
                message: format!("Failed to get database connection: {}", e),
            })?;
            diesel::update(dead_letter_events::table.find(entry_id))
                .set(dead_letter_events::resolved.eq(true))
                .execute(&mut conn)
                .map_err(|e| CollectorError::DeadLetterError {
                    message: e.to_string(),
                })?;
            Ok(())
        })
        .await
        .map_err(|e| CollectorError::DeadLetterError {
            message: format!("dead letter task panicked: {}", e),
        })?
    }

    async fn statistics(&self) -> CollectorResult<DeadLetterStatistics> {
        #[derive(QueryableByName)]
        struct Stats {
            #[diesel(sql_type = diesel::sql_types::BigInt)]
            total_entries: i64,
            #[diesel(sql_type = diesel::sql_types::BigInt)]
            unresolved_entries: i64,
            #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Timestamptz>)]
            oldest_entry: Option<DateTime<Utc>>,
            #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Timestamptz>)]
            newest_entry: Option<DateTime<Utc>>,
        }

        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> CollectorResult<DeadLetterStatistics> {
            let mut conn = pool.get().map_err(|e| CollectorError::DeadLetterError {
                message: format!("Failed to get database connection: {}", e),
            })?;
            let stats: Stats = diesel::sql_query(
                r#"
                SELECT
                    COUNT(*) AS total_entries,
                    COUNT(*) FILTER (WHERE NOT resolved) AS unresolved_entries,
                    MIN(created_at) AS oldest_entry,
                    MAX(created_at) AS newest_entry
                FROM dead_letter_events
                "#,
            )
            .get_result(&mut conn)
            .map_err(|e| CollectorError::DeadLetterError {
                message: e.to_string(),
            })?;

            Ok(DeadLetterStatistics {
                total_entries: stats.total_entries,
                unresolved_entries: stats.unresolved_entries,
                resolved_entries: stats.total_entries - stats.unresolved_entries,
                oldest_entry: stats.oldest_entry,
                newest_entry: stats.newest_entry,
            })
        })
        .await
        .map_err(|e| CollectorError::DeadLetterError {
            message: format!("dead letter task panicked: {}", e),
        })?
    }

    async fn purge_resolved(&self, older_than: DateTime<Utc>) -> CollectorResult<usize> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> CollectorResult<usize> {
            let mut conn = pool.get().map_err(|e| CollectorError::DeadLetterError {
                message: format!("Failed to get database connection: {}", e),
            })?;
            diesel::delete(
                dead_letter_events::table
                    .filter(dead_letter_events::resolved.eq(true))
                    .filter(dead_letter_events::created_at.lt(older_than)),
            )
            .execute(&mut conn)
            .map_err(|e| CollectorError::DeadLetterError {
                message: e.to_string(),
            })
        })
        .await
        .map_err(|e| CollectorError::DeadLetterError {
            message: format!("dead letter task panicked: {}", e),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poison_entries_are_terminal() {
        let entry = DeadLetterEntry::poison(
            "logs.error",
            b"{".to_vec(),
            "Malformed payload: EOF while parsing".to_string(),
            serde_json::json!({"offset": 1}),
        );
        assert!(entry.event_id.is_none());
        assert_eq!(entry.max_retries, 0);
        assert!(!entry.resolved);
        assert!(entry.error_message.contains("Malformed"));
    }

    #[test]
    fn flush_failure_entries_carry_attempt_bookkeeping() {
        let event_id = Uuid::new_v4();
        let entry = DeadLetterEntry::flush_failure(
            event_id,
            "logs.info",
            b"{}".to_vec(),
            "Database error: connection refused".to_string(),
            5,
            5,
        );
        assert_eq!(entry.event_id, Some(event_id));
        assert_eq!(entry.retry_count, 5);
        assert_eq!(entry.max_retries, 5);
        assert!(entry.last_retry_at.is_some());
    }

    #[test]
    fn record_conversion_is_lossless() {
        let entry = DeadLetterEntry::poison(
            "traces.collector",
            vec![1, 2, 3],
            "VE_Format: data.traceId: bad id".to_string(),
            Value::Null,
        );
        let id = entry.id;
        let record = DeadLetterRecord::from(entry);
        assert_eq!(record.id, id);
        assert_eq!(record.original_message, vec![1, 2, 3]);
        assert_eq!(record.routing_key, "traces.collector");
    }
}
