//! Fixed-size worker pool.
//!
//! Each worker pulls one delivery at a time from the shared receiver and
//! runs decode, validate, dedup, and the hand-off to the batcher. The send
//! into the batcher channel blocks under backpressure; with the broker
//! prefetch bounding unacked deliveries, a stalled store stops the pipeline
//! from pulling rather than growing memory.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use event_collector_core::{decode, Validator};

use super::PendingEvent;
use crate::broker::{AckHandle, InboundMessage};
use crate::cache::{DedupCache, MetadataCache};
use crate::db::{DeadLetterEntry, DeadLetterStore, EventRow};
use crate::monitoring::metrics::{MESSAGES_PROCESSED_TOTAL, MESSAGES_SKIPPED_TOTAL};

/// Dependencies shared by every worker
pub struct WorkerContext {
    pub validator: Validator,
    pub dedup: DedupCache,
    pub metadata: Arc<MetadataCache>,
    pub batch_tx: mpsc::Sender<PendingEvent>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub cancel: CancellationToken,
}

/// Spawns and tracks the worker tasks
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn(
        count: usize,
        delivery_rx: mpsc::Receiver<InboundMessage>,
        context: WorkerContext,
    ) -> Vec<JoinHandle<()>> {
        let shared_rx = Arc::new(Mutex::new(delivery_rx));
        let context = Arc::new(context);

        (0..count)
            .map(|index| {
                let rx = shared_rx.clone();
                let context = context.clone();
                tokio::spawn(worker_loop(index, rx, context))
            })
            .collect()
    }
}

async fn worker_loop(
    index: usize,
    rx: Arc<Mutex<mpsc::Receiver<InboundMessage>>>,
    context: Arc<WorkerContext>,
) {
    loop {
        // hold the receiver lock only while waiting, never while processing
        let message = {
            let mut guard = rx.lock().await;
            tokio::select! {
                biased;
                _ = context.cancel.cancelled() => None,
                message = guard.recv() => message,
            }
        };

        let Some(message) = message else { break };
        process_message(&context, message).await;
    }
    tracing::debug!(worker = index, "worker stopped");
}

async fn process_message(context: &WorkerContext, message: InboundMessage) {
    let InboundMessage {
        routing_key,
        redelivered,
        body,
        ack,
        ..
    } = message;

    let event = match decode(&body) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!(routing_key, redelivered, error = %e, "poison message: decode failed");
            let details = serde_json::json!({"stage": "decode", "routingKey": routing_key});
            dead_letter_poison(context, &routing_key, body, e.to_string(), details, ack).await;
            return;
        }
    };

    if let Err(e) = context.validator.validate(&event) {
        tracing::debug!(
            routing_key,
            event_id = event.event_id(),
            error = %e,
            "poison message: validation failed"
        );
        let details = serde_json::json!({
            "stage": "validate",
            "field": e.field,
            "code": e.code.to_string(),
            "routingKey": routing_key,
        });
        dead_letter_poison(context, &routing_key, body, e.to_string(), details, ack).await;
        return;
    }

    // redeliveries short-circuit here when the first attempt already marked
    // the id
    if context.dedup.is_duplicate(event.event_id()).await {
        MESSAGES_SKIPPED_TOTAL.inc();
        ack.ack().await;
        return;
    }
    context.dedup.mark_processed(event.event_id()).await;

    let attributes = context.metadata.source_attributes(&event).await;
    let row = match EventRow::from_event(&event, &attributes) {
        Ok(row) => row,
        Err(e) => {
            let details = serde_json::json!({"stage": "convert", "routingKey": routing_key});
            dead_letter_poison(context, &routing_key, body, e.to_string(), details, ack).await;
            return;
        }
    };

    MESSAGES_PROCESSED_TOTAL
        .with_label_values(&[event.family().as_str()])
        .inc();

    let pending = PendingEvent {
        row,
        routing_key,
        body,
        ack,
    };

    // reserve() applies backpressure without surrendering the event to a
    // cancelled send
    tokio::select! {
        biased;
        _ = context.cancel.cancelled() => {
            pending.ack.nack_requeue().await;
        }
        permit = context.batch_tx.reserve() => match permit {
            Ok(permit) => permit.send(pending),
            Err(_) => {
                // batcher is gone; give the message back to the broker
                pending.ack.nack_requeue().await;
            }
        }
    }
}

/// Persist a terminally failed message, then ack it. If even the dead-letter
/// write fails the delivery is requeued and the pipeline will see it again.
async fn dead_letter_poison(
    context: &WorkerContext,
    routing_key: &str,
    body: Vec<u8>,
    error_message: String,
    details: Value,
    ack: AckHandle,
) {
    let entry = DeadLetterEntry::poison(routing_key, body, error_message, details);
    match context.dead_letters.persist(entry).await {
        Ok(()) => ack.ack().await,
        Err(e) => {
            tracing::error!(error = %e, routing_key, "dead letter persist failed, requeueing");
            ack.nack_requeue().await;
        }
    }
}
