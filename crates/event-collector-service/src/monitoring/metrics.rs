/*!
# Prometheus Metrics

Counters and histograms for every stage of the ingestion pipeline:
message disposition, flush outcomes, batch sizing, and cache behavior.
*/

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry for the collector
    pub static ref REGISTRY: Registry = Registry::new();

    // Message disposition

    /// Deliveries that completed the worker pipeline, by event family
    pub static ref MESSAGES_PROCESSED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("messages_processed_total", "Total messages processed by the worker pipeline"),
        &["family"]
    ).unwrap();

    /// Broker deliveries acknowledged
    pub static ref MESSAGES_ACKED_TOTAL: IntCounter = IntCounter::new(
        "messages_acked_total", "Total broker deliveries acknowledged"
    ).unwrap();

    /// Broker deliveries negatively acknowledged
    pub static ref MESSAGES_NACKED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("messages_nacked_total", "Total broker deliveries negatively acknowledged"),
        &["requeue"]
    ).unwrap();

    /// Deliveries skipped as duplicates
    pub static ref MESSAGES_SKIPPED_TOTAL: IntCounter = IntCounter::new(
        "messages_skipped_total", "Total deliveries skipped by the dedup cache"
    ).unwrap();

    // Store flushes

    /// Successful batch flushes
    pub static ref DB_FLUSH_SUCCESS_TOTAL: IntCounter = IntCounter::new(
        "db_flush_success_total", "Total successful batch flushes to the primary store"
    ).unwrap();

    /// Failed flush attempts (before retry)
    pub static ref DB_FLUSH_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "db_flush_errors_total", "Total failed flush attempts against the primary store"
    ).unwrap();

    /// Flush duration distribution
    pub static ref DB_FLUSH_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("db_flush_duration_seconds", "Duration of batch flushes in seconds")
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    ).unwrap();

    // Batching

    /// Batch sizes chosen by the adaptive sizer at flush time
    pub static ref BATCH_SIZE_OPTIMIZED: Histogram = Histogram::with_opts(
        HistogramOpts::new("batch_size_optimized", "Batch size at flush time after adaptive resizing")
            .buckets(vec![50.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 1500.0, 2000.0])
    ).unwrap();

    /// Wall time from first event in a batch to flush completion
    pub static ref BATCH_PROCESSING_TIME_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("batch_processing_time_seconds", "Time from first event in a batch to flush completion")
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0])
    ).unwrap();

    // Cache behavior

    /// Metadata cache hit ratio observed by the adaptive sizer
    pub static ref CACHE_HIT_RATIO: Gauge = Gauge::new(
        "cache_hit_ratio", "Metadata cache hit ratio over the current sizing window"
    ).unwrap();

    /// Metadata cache hits
    pub static ref CACHE_HITS_TOTAL: IntCounter = IntCounter::new(
        "cache_hits_total", "Total metadata cache hits"
    ).unwrap();

    /// Metadata cache misses
    pub static ref CACHE_MISSES_TOTAL: IntCounter = IntCounter::new(
        "cache_misses_total", "Total metadata cache misses"
    ).unwrap();

    /// Cache operations that failed and were degraded to pass-through
    pub static ref CACHE_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "cache_errors_total", "Total cache operations that failed and were treated as misses"
    ).unwrap();

    // Dead letter store

    /// Messages persisted to the dead-letter store, by reason kind
    pub static ref DEAD_LETTER_PERSISTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("dead_letter_persisted_total", "Total messages persisted to the dead-letter store"),
        &["reason"]
    ).unwrap();
}

/// Register all collector metrics with the global registry.
///
/// Idempotent registration is not required; the supervisor calls this once
/// during startup before any pipeline task runs.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(MESSAGES_PROCESSED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MESSAGES_ACKED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MESSAGES_NACKED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MESSAGES_SKIPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FLUSH_SUCCESS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FLUSH_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FLUSH_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(BATCH_SIZE_OPTIMIZED.clone()))?;
    REGISTRY.register(Box::new(BATCH_PROCESSING_TIME_SECONDS.clone()))?;
    REGISTRY.register(Box::new(CACHE_HIT_RATIO.clone()))?;
    REGISTRY.register(Box::new(CACHE_HITS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_MISSES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEAD_LETTER_PERSISTED_TOTAL.clone()))?;
    Ok(())
}

/// Render the registry in the Prometheus text exposition format.
pub fn gather_text() -> Result<String, prometheus::Error> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_and_exposition_round_trip() {
        // init_metrics is process-global; tolerate a prior registration from
        // another test in the same binary.
        let _ = init_metrics();

        MESSAGES_PROCESSED_TOTAL.with_label_values(&["log"]).inc();
        MESSAGES_ACKED_TOTAL.inc();
        MESSAGES_SKIPPED_TOTAL.inc();
        DB_FLUSH_DURATION_SECONDS.observe(0.042);
        CACHE_HIT_RATIO.set(0.85);

        let text = gather_text().unwrap();
        assert!(text.contains("messages_processed_total"));
        assert!(text.contains("db_flush_duration_seconds_bucket"));
        assert!(text.contains("cache_hit_ratio"));
    }
}
