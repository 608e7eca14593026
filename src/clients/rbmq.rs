use std::{collections::HashMap, future::Future, sync::Arc, sync::Mutex, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, ShortString},
};
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    error::BrokerError,
    models::{
        envelope::{DlqMessage, EventEnvelope},
        outcome::{Outcome, Verdict},
    },
    services::dispatch::{Inbound, Settle},
    utils::retry_with_backoff,
};

/// Publishing side of the broker, the seam publishers depend on.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError>;

    async fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionBinding {
    pub queue: String,
    pub routing_key: String,
}

impl SubscriptionBinding {
    pub fn reminders(config: &Config) -> Self {
        Self {
            queue: config.reminder_queue_name.clone(),
            routing_key: config.reminder_binding_key.clone(),
        }
    }

    fn consumer_tag(&self) -> String {
        format!("ticket-notifier.{}.{}", self.queue, self.routing_key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    Shutdown,
    Disconnected,
}

struct Link {
    connection: Connection,
    channel: Channel,
}

/// The process-wide broker connection.
///
/// Created once at startup and shared by reference between the publisher,
/// the consumer pump and the health check. The underlying connection can be
/// replaced with [`BrokerChannel::reconnect`] without handing out a new
/// instance.
pub struct BrokerChannel {
    config: Config,
    link: RwLock<Option<Link>>,
    bindings: Mutex<HashMap<SubscriptionBinding, Consumer>>,
}

impl BrokerChannel {
    pub async fn connect(config: &Config) -> Result<Self, BrokerError> {
        let link = Self::open(config).await?;

        Ok(Self {
            config: config.clone(),
            link: RwLock::new(Some(link)),
            bindings: Mutex::new(HashMap::new()),
        })
    }

    pub async fn connect_with_backoff(config: &Config) -> Result<Self, BrokerError> {
        retry_with_backoff(&config.reconnect_retry_config(), || Self::connect(config)).await
    }

    async fn open(config: &Config) -> Result<Link, BrokerError> {
        let limit = config.broker_timeout();

        info!("Connecting to RabbitMQ");

        let connection = bounded(
            "connect",
            limit,
            Connection::connect(&config.rabbitmq_url, ConnectionProperties::default()),
            BrokerError::Connection,
        )
        .await?;

        let channel = bounded(
            "create channel",
            limit,
            connection.create_channel(),
            BrokerError::Connection,
        )
        .await?;

        bounded(
            "confirm select",
            limit,
            channel.confirm_select(ConfirmSelectOptions::default()),
            BrokerError::Connection,
        )
        .await?;

        bounded(
            "basic qos",
            limit,
            channel.basic_qos(config.prefetch_count, BasicQosOptions::default()),
            BrokerError::Connection,
        )
        .await?;

        bounded(
            "declare exchange",
            limit,
            channel.exchange_declare(
                config.exchange_name.as_str(),
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            ),
            BrokerError::Connection,
        )
        .await?;

        for queue in [&config.reminder_queue_name, &config.failed_queue_name] {
            bounded(
                "declare queue",
                limit,
                channel.queue_declare(
                    queue.as_str(),
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                ),
                BrokerError::Connection,
            )
            .await?;
        }

        bounded(
            "bind queue",
            limit,
            channel.queue_bind(
                config.reminder_queue_name.as_str(),
                config.exchange_name.as_str(),
                config.reminder_binding_key.as_str(),
                QueueBindOptions::default(),
                FieldTable::default(),
            ),
            BrokerError::Connection,
        )
        .await?;

        info!(
            exchange = %config.exchange_name,
            queue = %config.reminder_queue_name,
            binding_key = %config.reminder_binding_key,
            prefetch = config.prefetch_count,
            "RabbitMQ channel ready"
        );

        Ok(Link {
            connection,
            channel,
        })
    }

    /// Replaces the connection after a broker-side failure.
    pub async fn reconnect(&self) -> Result<(), BrokerError> {
        let link = retry_with_backoff(&self.config.reconnect_retry_config(), || {
            Self::open(&self.config)
        })
        .await?;

        let previous = self.link.write().await.replace(link);
        self.bindings_lock().clear();

        if let Some(previous) = previous {
            let _ = previous.connection.close(200, "Replaced").await;
        }

        info!("RabbitMQ connection replaced");
        Ok(())
    }

    pub async fn close(&self) {
        let Some(link) = self.link.write().await.take() else {
            return;
        };
        self.bindings_lock().clear();

        if let Err(e) = link.channel.close(200, "Normal shutdown").await {
            debug!(error = %e, "Channel close failed");
        }
        if let Err(e) = link.connection.close(200, "Normal shutdown").await {
            debug!(error = %e, "Connection close failed");
        }

        info!("RabbitMQ connection closed");
    }

    async fn channel(&self) -> Result<Channel, BrokerError> {
        self.link
            .read()
            .await
            .as_ref()
            .map(|link| link.channel.clone())
            .ok_or_else(|| BrokerError::Connection("Broker channel is closed".to_string()))
    }

    fn bindings_lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionBinding, Consumer>> {
        self.bindings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn publish_to(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        let limit = self.config.broker_timeout();

        let confirm = bounded(
            "publish",
            limit,
            channel.basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type(ShortString::from("application/json")),
            ),
            BrokerError::Publish,
        )
        .await?;

        let confirmation = bounded("publish confirm", limit, confirm, BrokerError::Publish).await?;

        if confirmation.is_nack() {
            return Err(BrokerError::Publish(format!(
                "Broker rejected message for '{}'",
                routing_key
            )));
        }

        Ok(())
    }

    pub async fn publish_to_dlq(&self, message: &DlqMessage) -> Result<(), BrokerError> {
        let payload =
            serde_json::to_vec(message).map_err(|e| BrokerError::Publish(e.to_string()))?;

        self.publish_to("", self.config.failed_queue_name.as_str(), &payload)
            .await
    }

    /// Registers a durable binding and starts consuming it.
    ///
    /// Subscribing the same (queue, routing key) pair again returns the
    /// existing consumer instead of starting a second one.
    pub async fn subscribe(&self, binding: &SubscriptionBinding) -> Result<Consumer, BrokerError> {
        if let Some(consumer) = self.bindings_lock().get(binding) {
            debug!(queue = %binding.queue, routing_key = %binding.routing_key, "Binding already registered");
            return Ok(consumer.clone());
        }

        let channel = self.channel().await?;
        let limit = self.config.broker_timeout();

        bounded(
            "declare queue",
            limit,
            channel.queue_declare(
                binding.queue.as_str(),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            ),
            BrokerError::Subscribe,
        )
        .await?;

        bounded(
            "bind queue",
            limit,
            channel.queue_bind(
                binding.queue.as_str(),
                self.config.exchange_name.as_str(),
                binding.routing_key.as_str(),
                QueueBindOptions::default(),
                FieldTable::default(),
            ),
            BrokerError::Subscribe,
        )
        .await?;

        let consumer = bounded(
            "basic consume",
            limit,
            channel.basic_consume(
                binding.queue.as_str(),
                binding.consumer_tag().as_str(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            ),
            BrokerError::Subscribe,
        )
        .await?;

        let consumer = self
            .bindings_lock()
            .entry(binding.clone())
            .or_insert(consumer)
            .clone();

        info!(queue = %binding.queue, routing_key = %binding.routing_key, "Subscribed to queue");

        Ok(consumer)
    }

    async fn unsubscribe(&self, binding: &SubscriptionBinding) {
        self.bindings_lock().remove(binding);

        let Ok(channel) = self.channel().await else {
            return;
        };

        if let Err(e) = channel
            .basic_cancel(binding.consumer_tag().as_str(), BasicCancelOptions::default())
            .await
        {
            warn!(queue = %binding.queue, error = %e, "Failed to cancel consumer");
        }
    }

    /// Feeds deliveries into the dispatch queue until shutdown or until the
    /// consumer stream ends.
    pub async fn pump(
        self: &Arc<Self>,
        binding: &SubscriptionBinding,
        mut consumer: Consumer,
        sender: mpsc::Sender<Inbound>,
        mut shutdown: watch::Receiver<bool>,
    ) -> PumpExit {
        loop {
            if *shutdown.borrow() {
                self.unsubscribe(binding).await;
                return PumpExit::Shutdown;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.unsubscribe(binding).await;
                        return PumpExit::Shutdown;
                    }
                }
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => {
                        let data = delivery.data;
                        let settlement = RabbitSettlement {
                            broker: Arc::clone(self),
                            queue: binding.queue.clone(),
                            acker: delivery.acker,
                        };

                        if sender.send(Inbound::new(data, Box::new(settlement))).await.is_err() {
                            warn!("Dispatch queue closed, stopping consumer pump");
                            self.unsubscribe(binding).await;
                            return PumpExit::Shutdown;
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, queue = %binding.queue, "Consumer stream failed");
                        self.bindings_lock().remove(binding);
                        return PumpExit::Disconnected;
                    }
                    None => {
                        warn!(queue = %binding.queue, "Consumer stream ended");
                        self.bindings_lock().remove(binding);
                        return PumpExit::Disconnected;
                    }
                },
            }
        }
    }

    /// Republishes the next attempt straight onto `queue` through the
    /// default exchange, then acks the original.
    async fn requeue(&self, queue: &str, data: &[u8], acker: &Acker) -> Result<(), BrokerError> {
        let republished = match EventEnvelope::from_slice(data) {
            Ok(envelope) => {
                let next = envelope.redelivered();
                match next.to_vec() {
                    Ok(payload) => self.publish_to("", queue, &payload).await,
                    Err(e) => Err(BrokerError::Publish(e.to_string())),
                }
            }
            Err(e) => Err(BrokerError::Publish(e.to_string())),
        };

        match republished {
            Ok(()) => ack(acker).await,
            Err(e) => {
                warn!(error = %e, "Republish failed, returning message to broker unchanged");
                reject(acker, true).await
            }
        }
    }

    async fn dead_letter(
        &self,
        data: &[u8],
        reason: &str,
        acker: &Acker,
    ) -> Result<(), BrokerError> {
        let message = DlqMessage::from_body(data, reason.to_string());

        match self.publish_to_dlq(&message).await {
            Ok(()) => reject(acker, false).await,
            Err(e) => {
                error!(error = %e, reason, "Failed to dead-letter message, returning it to broker");
                reject(acker, true).await
            }
        }
    }
}

#[async_trait]
impl EventBus for BrokerChannel {
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.publish_to(self.config.exchange_name.as_str(), routing_key, payload)
            .await
    }

    async fn is_connected(&self) -> bool {
        match self.link.read().await.as_ref() {
            Some(link) => link.connection.status().connected() && link.channel.status().connected(),
            None => false,
        }
    }
}

struct RabbitSettlement {
    broker: Arc<BrokerChannel>,
    queue: String,
    acker: Acker,
}

#[async_trait]
impl Settle for RabbitSettlement {
    async fn settle(self: Box<Self>, data: &[u8], verdict: &Verdict) -> Result<(), BrokerError> {
        match verdict.outcome {
            Outcome::Ack => ack(&self.acker).await,
            Outcome::Nack { requeue: true } => {
                self.broker.requeue(&self.queue, data, &self.acker).await
            }
            Outcome::Nack { requeue: false } => {
                let reason = verdict.failure.as_deref().unwrap_or("unknown failure");
                self.broker.dead_letter(data, reason, &self.acker).await
            }
        }
    }
}

async fn ack(acker: &Acker) -> Result<(), BrokerError> {
    acker
        .ack(BasicAckOptions::default())
        .await
        .map(|_| ())
        .map_err(|e| BrokerError::Settle(format!("Failed to acknowledge message: {}", e)))
}

async fn reject(acker: &Acker, requeue: bool) -> Result<(), BrokerError> {
    acker
        .reject(BasicRejectOptions { requeue })
        .await
        .map(|_| ())
        .map_err(|e| BrokerError::Settle(format!("Failed to reject message: {}", e)))
}

async fn bounded<T, E, F>(
    operation: &'static str,
    limit: Duration,
    future: F,
    wrap: fn(String) -> BrokerError,
) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(limit, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(wrap(format!("{} failed: {}", operation, e))),
        Err(_) => Err(BrokerError::Timeout {
            operation,
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}
