//! AMQP consumer: connection lifecycle, topology declaration, and the
//! delivery loop feeding the worker pool.
//!
//! One task owns the connection. On any connection or channel failure it
//! transitions to `Reconnecting` and retries with full-jitter exponential
//! backoff; unacked deliveries are redelivered by the broker after the old
//! connection drops. Acks happen in the workers and the batcher, never here.

use futures_util::stream::{select_all, StreamExt};
use lapin::options::{
    BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use event_collector_core::{CollectorError, CollectorResult};

use super::{AckHandle, ConsumerState, InboundMessage};
use crate::retry::BackoffPolicy;

/// Dead-letter exchange receiving nacked-without-requeue messages
const DEAD_LETTER_EXCHANGE: &str = "collector.dlx";

/// Queue topology: (queue, exchanges it binds to, binding key)
const QUEUE_BINDINGS: [(&str, &[&str], &str); 4] = [
    ("logs.collector", &["logs.topic"], "logs.*"),
    ("metrics.collector", &["metrics.topic"], "metrics.*"),
    ("traces.collector", &["traces.topic"], "traces.*"),
    (
        "events.collector",
        &["events.business", "events.security"],
        "events.*",
    ),
];

/// Handle the supervisor keeps for observing the consumer
pub struct ConsumerHandle {
    pub state: watch::Receiver<ConsumerState>,
}

/// Long-running broker consumer task
pub struct BrokerConsumer {
    url: String,
    prefetch: u16,
    delivery_tx: mpsc::Sender<InboundMessage>,
    state_tx: watch::Sender<ConsumerState>,
    cancel: CancellationToken,
}

impl BrokerConsumer {
    pub fn new(
        url: String,
        prefetch: u16,
        delivery_tx: mpsc::Sender<InboundMessage>,
        cancel: CancellationToken,
    ) -> (Self, ConsumerHandle) {
        let (state_tx, state_rx) = watch::channel(ConsumerState::Disconnected);
        (
            Self {
                url,
                prefetch,
                delivery_tx,
                state_tx,
                cancel,
            },
            ConsumerHandle { state: state_rx },
        )
    }

    fn set_state(&self, state: ConsumerState) {
        // receivers may be gone during teardown
        let _ = self.state_tx.send(state);
    }

    /// Run until cancelled. Consumes `self` so the delivery sender drops on
    /// exit and the worker pool drains behind it.
    pub async fn run(self) {
        let policy = BackoffPolicy::reconnect();
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.connect_and_consume(&mut attempt).await {
                Ok(()) => break, // cancelled while running
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    let delay = policy.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "broker connection lost, reconnecting"
                    );
                    self.set_state(ConsumerState::Reconnecting);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.set_state(ConsumerState::Closed);
        tracing::info!("broker consumer closed");
    }

    async fn connect_and_consume(&self, attempt: &mut u32) -> CollectorResult<()> {
        self.set_state(ConsumerState::Connecting);
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(broker_error)?;
        self.set_state(ConsumerState::Connected);

        let channel = connection.create_channel().await.map_err(broker_error)?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(broker_error)?;

        declare_topology(&channel).await?;

        let mut consumers = Vec::with_capacity(QUEUE_BINDINGS.len());
        for (queue, _, _) in QUEUE_BINDINGS {
            let consumer = channel
                .basic_consume(
                    queue,
                    &format!("collector-{}", queue),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(broker_error)?;
            consumers.push(consumer);
        }
        self.set_state(ConsumerState::Subscribed);

        let mut deliveries = select_all(consumers);
        self.set_state(ConsumerState::Running);
        // an established session resets the backoff schedule
        *attempt = 0;
        tracing::info!(prefetch = self.prefetch, "broker consumer running");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.set_state(ConsumerState::Draining);
                    // dropping the connection requeues everything unacked
                    return Ok(());
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        let message = InboundMessage {
                            delivery_tag: delivery.delivery_tag,
                            routing_key: delivery.routing_key.as_str().to_string(),
                            redelivered: delivery.redelivered,
                            body: delivery.data,
                            ack: AckHandle::Broker(delivery.acker),
                        };
                        if self.delivery_tx.send(message).await.is_err() {
                            // worker pool is gone; shut the session down
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(broker_error(e)),
                    None => {
                        return Err(CollectorError::BrokerError {
                            message: "all consumer streams closed".to_string(),
                        })
                    }
                }
            }
        }
    }
}

/// Declare the durable exchanges, queues, DLX bindings, and `.dlq` queues.
async fn declare_topology(channel: &Channel) -> CollectorResult<()> {
    let durable = ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    };

    channel
        .exchange_declare(
            DEAD_LETTER_EXCHANGE,
            ExchangeKind::Direct,
            durable,
            FieldTable::default(),
        )
        .await
        .map_err(broker_error)?;

    for (queue, exchanges, binding_key) in QUEUE_BINDINGS {
        for exchange in exchanges {
            channel
                .exchange_declare(exchange, ExchangeKind::Topic, durable, FieldTable::default())
                .await
                .map_err(broker_error)?;
        }

        let dlq_name = format!("{}.dlq", queue);

        let mut arguments = FieldTable::default();
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into()),
        );
        arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dlq_name.as_str().into()),
        );

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(broker_error)?;

        for exchange in exchanges {
            channel
                .queue_bind(
                    queue,
                    exchange,
                    binding_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(broker_error)?;
        }

        channel
            .queue_declare(
                &dlq_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;
        channel
            .queue_bind(
                &dlq_name,
                DEAD_LETTER_EXCHANGE,
                &dlq_name,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;
    }

    Ok(())
}

fn broker_error(error: lapin::Error) -> CollectorError {
    CollectorError::BrokerError {
        message: error.to_string(),
    }
}
