//! Batch accumulation and flushing.
//!
//! A single task owns the in-progress batch, so the buffer itself needs no
//! locking. A flush is triggered by size, by the batch timeout measured from
//! the first event in the batch, or by shutdown (channel closure). Failed
//! flushes retry with exponential backoff; an exhausted batch moves en bloc
//! to the dead-letter store and its deliveries are nacked without requeue.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use event_collector_core::{CollectorConfig, CollectorError};

use super::PendingEvent;
use crate::cache::{CacheCounters, MetadataCache};
use crate::db::{DeadLetterEntry, DeadLetterStore, EventWriter, RowBatch};
use crate::monitoring::metrics::{
    BATCH_PROCESSING_TIME_SECONDS, BATCH_SIZE_OPTIMIZED, CACHE_HIT_RATIO, DB_FLUSH_ERRORS_TOTAL,
    DB_FLUSH_SUCCESS_TOTAL,
};
use crate::retry::BackoffPolicy;

/// How often the target batch size may be recomputed
const RESIZE_INTERVAL: Duration = Duration::from_secs(30);

/// Target batch size derived from metadata-cache hit ratio.
///
/// A hot cache means cheap per-event work, so batches grow; a cold cache
/// shrinks them. The target is always clamped to `[base/2, base*2]`.
#[derive(Debug)]
pub struct AdaptiveBatchSize {
    base: usize,
    current: usize,
    last_recomputed: Option<std::time::Instant>,
    window_start: CacheCounters,
}

impl AdaptiveBatchSize {
    pub fn new(base: usize) -> Self {
        Self {
            base: base.max(1),
            current: base.max(1),
            last_recomputed: None,
            window_start: CacheCounters::default(),
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Recompute the target from the counters accumulated since the last
    /// window. No-op when called again within the resize interval.
    pub fn maybe_recompute(&mut self, counters: CacheCounters, now: std::time::Instant) {
        match self.last_recomputed {
            None => {
                // first call just anchors the window
                self.last_recomputed = Some(now);
                self.window_start = counters;
            }
            Some(last) if now.duration_since(last) < RESIZE_INTERVAL => {}
            Some(_) => {
                let hits = counters.hits.saturating_sub(self.window_start.hits);
                let misses = counters.misses.saturating_sub(self.window_start.misses);
                let total = hits + misses;

                let target = if total == 0 {
                    self.base
                } else {
                    let ratio = hits as f64 / total as f64;
                    CACHE_HIT_RATIO.set(ratio);
                    let factor = if ratio > 0.7 {
                        1.5
                    } else if ratio < 0.3 {
                        0.8
                    } else {
                        1.0
                    };
                    (self.base as f64 * factor) as usize
                };

                self.current = target.clamp(self.base / 2, self.base * 2).max(1);
                self.last_recomputed = Some(now);
                self.window_start = counters;
            }
        }
    }
}

/// Flush-related knobs, extracted from the collector configuration
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub base_batch_size: usize,
    pub batch_timeout: Duration,
    pub retry_max: u32,
    pub retry_interval: Duration,
}

impl BatcherConfig {
    pub fn from_collector(config: &CollectorConfig) -> Self {
        Self {
            base_batch_size: config.batch_size,
            batch_timeout: config.batch_timeout,
            retry_max: config.retry_max,
            retry_interval: config.retry_interval,
        }
    }
}

/// The batch-owning task
pub struct Batcher {
    config: BatcherConfig,
    rx: mpsc::Receiver<PendingEvent>,
    writer: Arc<dyn EventWriter>,
    dead_letters: Arc<dyn DeadLetterStore>,
    metadata: Arc<MetadataCache>,
    sizer: AdaptiveBatchSize,
    cancel: CancellationToken,
}

impl Batcher {
    pub fn new(
        config: BatcherConfig,
        rx: mpsc::Receiver<PendingEvent>,
        writer: Arc<dyn EventWriter>,
        dead_letters: Arc<dyn DeadLetterStore>,
        metadata: Arc<MetadataCache>,
        cancel: CancellationToken,
    ) -> Self {
        let sizer = AdaptiveBatchSize::new(config.base_batch_size);
        Self {
            config,
            rx,
            writer,
            dead_letters,
            metadata,
            sizer,
            cancel,
        }
    }

    /// Run until every sender is gone, then flush what remains and stop.
    ///
    /// Shutdown is driven by channel closure: when the workers drop their
    /// senders the final batch flushes with a single attempt and the task
    /// exits.
    pub async fn run(mut self) {
        let mut pending: Vec<PendingEvent> = Vec::with_capacity(self.config.base_batch_size);
        let mut first_at: Option<Instant> = None;

        loop {
            self.sizer
                .maybe_recompute(self.metadata.counters(), std::time::Instant::now());
            let target = self.sizer.current();

            let deadline = first_at.map(|t| t + self.config.batch_timeout);
            tokio::select! {
                item = self.rx.recv() => match item {
                    Some(item) => {
                        if pending.is_empty() {
                            first_at = Some(Instant::now());
                        }
                        pending.push(item);
                        if pending.len() >= target {
                            self.flush(&mut pending, &mut first_at).await;
                        }
                    }
                    None => {
                        self.flush(&mut pending, &mut first_at).await;
                        break;
                    }
                },
                _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                    self.flush(&mut pending, &mut first_at).await;
                }
            }
        }

        tracing::info!("batcher drained and stopped");
    }

    async fn flush(&self, pending: &mut Vec<PendingEvent>, first_at: &mut Option<Instant>) {
        let batch_started = first_at.take();
        if pending.is_empty() {
            return;
        }
        let items = std::mem::take(pending);
        BATCH_SIZE_OPTIMIZED.observe(items.len() as f64);

        let mut rows = RowBatch::default();
        for item in &items {
            rows.push(item.row.clone());
        }

        // shutdown flush is a single best-effort attempt
        let max_attempts = if self.cancel.is_cancelled() {
            1
        } else {
            self.config.retry_max.max(1)
        };
        let policy = BackoffPolicy::flush(self.config.retry_interval);
        let mut attempt: u32 = 0;

        loop {
            match self.writer.write_batch(rows.clone()).await {
                Ok(stats) => {
                    DB_FLUSH_SUCCESS_TOTAL.inc();
                    if stats.duplicates_absorbed > 0 {
                        tracing::debug!(
                            absorbed = stats.duplicates_absorbed,
                            "primary key absorbed duplicate rows"
                        );
                    }
                    for item in &items {
                        item.ack.ack().await;
                    }
                    if let Some(first) = batch_started {
                        BATCH_PROCESSING_TIME_SECONDS.observe(first.elapsed().as_secs_f64());
                    }
                    tracing::debug!(rows = items.len(), inserted = stats.inserted, "batch flushed");
                    return;
                }
                Err(e) => {
                    DB_FLUSH_ERRORS_TOTAL.inc();
                    attempt += 1;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        rows = items.len(),
                        "batch flush failed"
                    );
                    if attempt >= max_attempts {
                        self.dead_letter_batch(items, &e, attempt).await;
                        return;
                    }
                    let delay = policy.delay(attempt - 1);
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            // no further retries once shutdown begins
                            self.dead_letter_batch(items, &e, attempt).await;
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Policy (b): preserve throughput by moving the whole failed batch to
    /// the dead-letter store and releasing the deliveries to the DLX.
    async fn dead_letter_batch(&self, items: Vec<PendingEvent>, error: &CollectorError, attempts: u32) {
        tracing::error!(
            rows = items.len(),
            attempts,
            error = %error,
            "flush retries exhausted, dead-lettering batch"
        );
        for item in items {
            let PendingEvent {
                row,
                routing_key,
                body,
                ack,
            } = item;
            let entry = DeadLetterEntry::flush_failure(
                row.event_id(),
                &routing_key,
                body,
                error.to_string(),
                attempts,
                self.config.retry_max,
            );
            match self.dead_letters.persist(entry).await {
                Ok(()) => ack.nack_discard().await,
                Err(e) => {
                    tracing::error!(error = %e, "dead letter persist failed, requeueing delivery");
                    ack.nack_requeue().await;
                }
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        // guarded out by `if deadline.is_some()`
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(hits: u64, misses: u64) -> CacheCounters {
        CacheCounters { hits, misses }
    }

    #[test]
    fn first_call_anchors_the_window_without_resizing() {
        let mut sizer = AdaptiveBatchSize::new(500);
        sizer.maybe_recompute(counters(1000, 0), std::time::Instant::now());
        assert_eq!(sizer.current(), 500);
    }

    #[test]
    fn hot_cache_grows_the_batch() {
        let mut sizer = AdaptiveBatchSize::new(500);
        let start = std::time::Instant::now();
        sizer.maybe_recompute(counters(0, 0), start);
        sizer.maybe_recompute(counters(80, 20), start + RESIZE_INTERVAL);
        assert_eq!(sizer.current(), 750);
    }

    #[test]
    fn cold_cache_shrinks_the_batch() {
        let mut sizer = AdaptiveBatchSize::new(500);
        let start = std::time::Instant::now();
        sizer.maybe_recompute(counters(0, 0), start);
        sizer.maybe_recompute(counters(10, 90), start + RESIZE_INTERVAL);
        assert_eq!(sizer.current(), 400);
    }

    #[test]
    fn middling_ratio_keeps_the_base() {
        let mut sizer = AdaptiveBatchSize::new(500);
        let start = std::time::Instant::now();
        sizer.maybe_recompute(counters(0, 0), start);
        sizer.maybe_recompute(counters(50, 50), start + RESIZE_INTERVAL);
        assert_eq!(sizer.current(), 500);
    }

    #[test]
    fn recompute_is_rate_limited() {
        let mut sizer = AdaptiveBatchSize::new(500);
        let start = std::time::Instant::now();
        sizer.maybe_recompute(counters(0, 0), start);
        // inside the interval: ignored even with a hot window
        sizer.maybe_recompute(counters(100, 0), start + Duration::from_secs(5));
        assert_eq!(sizer.current(), 500);
        sizer.maybe_recompute(counters(100, 0), start + RESIZE_INTERVAL);
        assert_eq!(sizer.current(), 750);
    }

    #[test]
    fn idle_window_returns_to_base() {
        let mut sizer = AdaptiveBatchSize::new(500);
        let start = std::time::Instant::now();
        sizer.maybe_recompute(counters(0, 0), start);
        sizer.maybe_recompute(counters(100, 0), start + RESIZE_INTERVAL);
        assert_eq!(sizer.current(), 750);
        // no cache traffic at all in the next window
        sizer.maybe_recompute(counters(100, 0), start + RESIZE_INTERVAL * 2);
        assert_eq!(sizer.current(), 500);
    }

    #[test]
    fn target_never_collapses_below_one() {
        let mut sizer = AdaptiveBatchSize::new(1);
        let start = std::time::Instant::now();
        sizer.maybe_recompute(counters(0, 0), start);
        sizer.maybe_recompute(counters(0, 100), start + RESIZE_INTERVAL);
        assert!(sizer.current() >= 1);
    }
}
