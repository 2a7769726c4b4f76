//! Lifecycle supervisor.
//!
//! Owns startup ordering, signal handling, and the graceful drain. The
//! pipeline tears itself down as a cascade: cancelling the token stops the
//! consumer, dropping its delivery sender drains the workers, and dropping
//! their batch sender lets the batcher run its final single-attempt flush.
//! The supervisor bounds the whole drain with a hard deadline.

use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use event_collector_core::{CollectorConfig, CollectorError, CollectorResult, Validator};

use crate::broker::{BrokerConsumer, ConsumerState};
use crate::cache::{DedupCache, MetadataCache};
use crate::db::{
    DeadLetterStore, EventWriter, PostgresDeadLetterStore, PostgresEventWriter,
};
use crate::monitoring::health::{self, ComponentHealth, HealthRegistry};
use crate::monitoring::metrics;
use crate::pipeline::{Batcher, BatcherConfig, WorkerContext, WorkerPool};

/// How often the probe task refreshes dependency health
const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Terminal state of a collector run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Drained and stopped inside the shutdown deadline
    Clean,
    /// Runtime failure: the pipeline stopped without a signal, or the drain
    /// overran its deadline
    Fatal(String),
}

/// Builds the pipeline, runs it, and shepherds it back down.
pub struct Supervisor {
    config: CollectorConfig,
}

impl Supervisor {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    /// Run the collector until a shutdown signal or a fatal failure.
    ///
    /// Errors returned here are startup failures; once the pipeline is up,
    /// failures surface as [`RunOutcome::Fatal`].
    pub async fn run(self) -> CollectorResult<RunOutcome> {
        let config = self.config;

        // observability comes up first so startup itself is visible
        metrics::init_metrics().map_err(|e| CollectorError::ConfigurationError {
            message: format!("metric registration failed: {}", e),
        })?;
        let health_registry = Arc::new(HealthRegistry::new());
        let server = health::serve(config.metrics_port, health_registry.clone()).map_err(|e| {
            CollectorError::ConfigurationError {
                message: format!("failed to bind metrics port {}: {}", config.metrics_port, e),
            }
        })?;
        let server_handle = server.handle();
        let http_task = tokio::spawn(server);
        tracing::info!(port = config.metrics_port, "observability endpoints up");

        // primary store
        let writer = Arc::new(PostgresEventWriter::connect(
            &config.db_url,
            config.db_pool_max,
        )?);
        writer.ping().await?;
        let dead_letters: Arc<dyn DeadLetterStore> = Arc::new(PostgresDeadLetterStore::new(
            writer.pool(),
            config.retry_interval,
            config.retry_max,
        ));
        tracing::info!(pool_max = config.db_pool_max, "primary store ready");

        // cache (optional)
        let dedup = DedupCache::connect(config.cache_url.as_deref(), config.dedup_ttl).await?;
        let metadata = Arc::new(MetadataCache::new(dedup.connection(), config.metadata_ttl));
        tracing::info!(dedup_enabled = dedup.enabled(), "cache layer ready");

        let cancel = CancellationToken::new();
        let (delivery_tx, delivery_rx) =
            mpsc::channel(usize::from(config.prefetch_count()).max(1));
        let (batch_tx, batch_rx) = mpsc::channel(config.batch_channel_capacity());

        // batcher before workers, workers before the consumer: every stage
        // has a downstream before deliveries start flowing
        let batcher = Batcher::new(
            BatcherConfig::from_collector(&config),
            batch_rx,
            writer.clone() as Arc<dyn EventWriter>,
            dead_letters.clone(),
            metadata.clone(),
            cancel.clone(),
        );
        let batcher_task = tokio::spawn(batcher.run());

        let worker_context = WorkerContext {
            validator: Validator::new(config.clock_skew_tolerance),
            dedup: dedup.clone(),
            metadata: metadata.clone(),
            batch_tx,
            dead_letters: dead_letters.clone(),
            cancel: cancel.clone(),
        };
        let worker_tasks = WorkerPool::spawn(config.worker_pool_size, delivery_rx, worker_context);
        tracing::info!(workers = config.worker_pool_size, "worker pool running");

        let (consumer, consumer_handle) = BrokerConsumer::new(
            config.broker_url.clone(),
            config.prefetch_count(),
            delivery_tx,
            cancel.clone(),
        );
        let consumer_task = tokio::spawn(consumer.run());

        let probe_task = tokio::spawn(probe_loop(
            health_registry.clone(),
            writer.clone(),
            dedup.clone(),
            consumer_handle.state,
            cancel.clone(),
        ));

        // the pipeline future resolves only when every stage has stopped
        let mut tasks = Vec::with_capacity(worker_tasks.len() + 2);
        tasks.push(consumer_task);
        tasks.extend(worker_tasks);
        tasks.push(batcher_task);
        let pipeline = async move {
            join_all(tasks).await;
        };
        tokio::pin!(pipeline);

        let mut sigint = signal(SignalKind::interrupt()).map_err(signal_error)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(signal_error)?;

        let mut outcome = tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("SIGINT received, starting graceful shutdown");
                RunOutcome::Clean
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, starting graceful shutdown");
                RunOutcome::Clean
            }
            _ = &mut pipeline => {
                RunOutcome::Fatal("pipeline stopped without a shutdown signal".to_string())
            }
        };

        // stop intake, then give the cascade one bounded window to drain
        cancel.cancel();
        if outcome == RunOutcome::Clean {
            match tokio::time::timeout(config.shutdown_timeout, &mut pipeline).await {
                Ok(()) => tracing::info!("pipeline drained"),
                Err(_) => {
                    tracing::error!(
                        deadline_secs = config.shutdown_timeout.as_secs(),
                        "drain overran the shutdown deadline"
                    );
                    outcome = RunOutcome::Fatal("shutdown drain timed out".to_string());
                }
            }
        }

        probe_task.abort();
        server_handle.stop(false).await;
        http_task.abort();

        Ok(outcome)
    }
}

async fn probe_loop(
    health_registry: Arc<HealthRegistry>,
    writer: Arc<PostgresEventWriter>,
    dedup: DedupCache,
    broker_state: watch::Receiver<ConsumerState>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(PROBE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let database = match writer.ping().await {
            Ok(()) => ComponentHealth::healthy(),
            Err(e) => ComponentHealth::unhealthy(e.to_string()),
        };
        health_registry.set("database", database).await;

        let cache = if !dedup.enabled() {
            ComponentHealth::disabled()
        } else {
            match dedup.ping().await {
                Ok(()) => ComponentHealth::healthy(),
                Err(e) => ComponentHealth::unhealthy(e.to_string()),
            }
        };
        health_registry.set("cache", cache).await;

        let state = *broker_state.borrow();
        let broker = if state.is_healthy() {
            ComponentHealth::healthy()
        } else {
            ComponentHealth::unhealthy(format!("consumer state: {:?}", state))
        };
        health_registry.set("broker", broker).await;
    }
}

fn signal_error(error: std::io::Error) -> CollectorError {
    CollectorError::ConfigurationError {
        message: format!("failed to install signal handler: {}", error),
    }
}
