//! Bulk event writer against the primary store.
//!
//! The fast path streams each table's rows through PostgreSQL's COPY
//! protocol inside one transaction. COPY cannot tolerate a primary-key
//! conflict, so a unique violation aborts the transaction and the batch is
//! replayed with per-row `INSERT .. ON CONFLICT DO NOTHING`; the conflicting
//! rows are counted as duplicates absorbed by the `event_id` key, which is
//! the idempotence backstop behind the best-effort dedup cache.

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use std::sync::Arc;
use std::time::Instant;

use event_collector_core::{CollectorError, CollectorResult};

use super::models::RowBatch;
use super::schema::{logs, metrics, traces};
use crate::monitoring::metrics::DB_FLUSH_DURATION_SECONDS;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
type PgPooled = PooledConnection<ConnectionManager<PgConnection>>;

/// Outcome of a successful batch write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    /// Rows newly inserted
    pub inserted: usize,
    /// Rows dropped by the primary-key backstop
    pub duplicates_absorbed: usize,
}

/// Seam between the batcher and the primary store
#[async_trait]
pub trait EventWriter: Send + Sync {
    async fn write_batch(&self, batch: RowBatch) -> CollectorResult<FlushStats>;

    /// Cheap connectivity probe for the health surface
    async fn ping(&self) -> CollectorResult<()>;
}

/// Diesel-backed writer using a fixed-size r2d2 pool.
///
/// Only the batcher acquires connections during flush; the pool ceiling
/// bounds store pressure no matter how the pipeline scales.
pub struct PostgresEventWriter {
    pool: Arc<PgPool>,
}

impl PostgresEventWriter {
    pub fn connect(db_url: &str, max_size: u32) -> CollectorResult<Self> {
        let manager = ConnectionManager::<PgConnection>::new(db_url);
        let pool = Pool::builder()
            .max_size(max_size)
            .build(manager)
            .map_err(|e| CollectorError::DatabaseError {
                message: format!("Failed to create connection pool: {}", e),
            })?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    fn get_connection(pool: &PgPool) -> CollectorResult<PgPooled> {
        pool.get().map_err(|e| CollectorError::DatabaseError {
            message: format!("Failed to get database connection: {}", e),
        })
    }
}

#[async_trait]
impl EventWriter for PostgresEventWriter {
    async fn write_batch(&self, batch: RowBatch) -> CollectorResult<FlushStats> {
        if batch.is_empty() {
            return Ok(FlushStats {
                inserted: 0,
                duplicates_absorbed: 0,
            });
        }

        let pool = self.pool.clone();
        let started = Instant::now();

        // diesel is synchronous; a multi-second COPY must not stall the
        // runtime the rest of the pipeline runs on.
        let stats = tokio::task::spawn_blocking(move || -> CollectorResult<FlushStats> {
            let mut conn = Self::get_connection(&pool)?;
            let total = batch.len();

            match copy_batch(&mut conn, &batch) {
                Ok(inserted) => Ok(FlushStats {
                    inserted,
                    duplicates_absorbed: 0,
                }),
                Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                    let inserted = insert_ignoring_conflicts(&mut conn, &batch)
                        .map_err(database_error)?;
                    Ok(FlushStats {
                        inserted,
                        duplicates_absorbed: total - inserted,
                    })
                }
                Err(e) => Err(database_error(e)),
            }
        })
        .await
        .map_err(|e| CollectorError::DatabaseError {
            message: format!("flush task panicked: {}", e),
        })??;

        DB_FLUSH_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        Ok(stats)
    }

    async fn ping(&self) -> CollectorResult<()> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> CollectorResult<()> {
            let mut conn = Self::get_connection(&pool)?;
            diesel::sql_query("SELECT 1")
                .execute(&mut conn)
                .map_err(database_error)?;
            Ok(())
        })
        .await
        .map_err(|e| CollectorError::DatabaseError {
            message: format!("ping task panicked: {}", e),
        })?
    }
}

/// Stream every table's rows through COPY in one transaction.
/// Stream order matches row order, so insert order within the batch is
/// preserved per table.
fn copy_batch(conn: &mut PgConnection, batch: &RowBatch) -> Result<usize, DieselError> {
    conn.transaction(|conn| {
        let mut inserted = 0;
        if !batch.logs.is_empty() {
            inserted += diesel::copy_from(logs::table)
                .from_insertable(&batch.logs)
                .execute(conn)?;
        }
        if !batch.metrics.is_empty() {
            inserted += diesel::copy_from(metrics::table)
                .from_insertable(&batch.metrics)
                .execute(conn)?;
        }
        if !batch.traces.is_empty() {
            inserted += diesel::copy_from(traces::table)
                .from_insertable(&batch.traces)
                .execute(conn)?;
        }
        Ok(inserted)
    })
}

/// Conflict fallback: same rows, per-statement inserts that skip rows whose
/// `event_id` already exists.
fn insert_ignoring_conflicts(
    conn: &mut PgConnection,
    batch: &RowBatch,
) -> Result<usize, DieselError> {
    conn.transaction(|conn| {
        let mut inserted = 0;
        if !batch.logs.is_empty() {
            inserted += diesel::insert_into(logs::table)
                .values(&batch.logs)
                .on_conflict(logs::event_id)
                .do_nothing()
                .execute(conn)?;
        }
        if !batch.metrics.is_empty() {
            inserted += diesel::insert_into(metrics::table)
                .values(&batch.metrics)
                .on_conflict(metrics::event_id)
                .do_nothing()
                .execute(conn)?;
        }
        if !batch.traces.is_empty() {
            inserted += diesel::insert_into(traces::table)
                .values(&batch.traces)
                .on_conflict(traces::event_id)
                .do_nothing()
                .execute(conn)?;
        }
        Ok(inserted)
    })
}

fn database_error(error: DieselError) -> CollectorError {
    CollectorError::DatabaseError {
        message: error.to_string(),
    }
}
