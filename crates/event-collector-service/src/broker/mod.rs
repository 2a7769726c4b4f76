//! Broker-facing types: delivery envelope, acknowledgement handle, and the
//! consumer lifecycle states.

use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use serde::Serialize;
use std::sync::{Arc, Mutex};

use crate::monitoring::metrics::{MESSAGES_ACKED_TOTAL, MESSAGES_NACKED_TOTAL};

pub mod consumer;

pub use consumer::{BrokerConsumer, ConsumerHandle};

/// Terminal disposition of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    NackRequeue,
    NackDiscard,
}

/// Acknowledgement handle for one delivery.
///
/// Wraps the broker acker; the recording variant captures dispositions for
/// pipeline tests that run without a broker.
pub enum AckHandle {
    Broker(Acker),
    Recorded(Arc<Mutex<Vec<Disposition>>>),
}

impl AckHandle {
    pub fn recorded() -> (Self, Arc<Mutex<Vec<Disposition>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (AckHandle::Recorded(log.clone()), log)
    }

    /// Acknowledge: the event is durably persisted or dead-lettered.
    pub async fn ack(&self) {
        match self {
            AckHandle::Broker(acker) => {
                if let Err(e) = acker.ack(BasicAckOptions::default()).await {
                    tracing::error!(error = %e, "failed to ack delivery");
                    return;
                }
            }
            AckHandle::Recorded(log) => {
                log.lock().expect("disposition log").push(Disposition::Ack);
            }
        }
        MESSAGES_ACKED_TOTAL.inc();
    }

    /// Negative-ack with requeue: the message re-enters the pipeline later.
    pub async fn nack_requeue(&self) {
        self.nack(true).await;
    }

    /// Negative-ack without requeue: the broker's DLX bindings take the
    /// message to `<queue>.dlq`.
    pub async fn nack_discard(&self) {
        self.nack(false).await;
    }

    async fn nack(&self, requeue: bool) {
        match self {
            AckHandle::Broker(acker) => {
                let options = BasicNackOptions {
                    requeue,
                    ..Default::default()
                };
                if let Err(e) = acker.nack(options).await {
                    tracing::error!(error = %e, requeue, "failed to nack delivery");
                    return;
                }
            }
            AckHandle::Recorded(log) => {
                let disposition = if requeue {
                    Disposition::NackRequeue
                } else {
                    Disposition::NackDiscard
                };
                log.lock().expect("disposition log").push(disposition);
            }
        }
        MESSAGES_NACKED_TOTAL
            .with_label_values(&[if requeue { "true" } else { "false" }])
            .inc();
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AckHandle::Broker(_) => f.write_str("AckHandle::Broker"),
            AckHandle::Recorded(_) => f.write_str("AckHandle::Recorded"),
        }
    }
}

/// One delivery handed from the consumer to the worker pool
#[derive(Debug)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub ack: AckHandle,
}

/// Consumer connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Running,
    Reconnecting,
    Draining,
    Closed,
}

impl ConsumerState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ConsumerState::Running | ConsumerState::Draining)
    }
}
