use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    clients::{email::DeliveryCapability, idempotency::IdempotencyStore},
    config::Config,
    error::{ConsumeError, DeliveryError},
    models::{
        envelope::EventEnvelope,
        outcome::{Outcome, Verdict},
        status::IdempotencyStatus,
    },
};

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub max_retries: u32,
    pub delivery_timeout: Duration,
    pub from_address: String,
}

impl ConsumerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retry_attempts,
            delivery_timeout: config.delivery_timeout(),
            from_address: config.email_from.clone(),
        }
    }
}

/// Turns one envelope into at most one `send` call and an [`Outcome`].
///
/// Delivery is at-least-once: a requeued envelope comes back with a higher
/// `attempt` and is sent again, unless its idempotency key is already
/// recorded as sent.
pub struct NotificationConsumer {
    delivery: Arc<dyn DeliveryCapability>,
    idempotency: Arc<dyn IdempotencyStore>,
    settings: ConsumerSettings,
}

impl NotificationConsumer {
    pub fn new(
        delivery: Arc<dyn DeliveryCapability>,
        idempotency: Arc<dyn IdempotencyStore>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            delivery,
            idempotency,
            settings,
        }
    }

    pub async fn on_message(&self, envelope: &EventEnvelope) -> Outcome {
        self.evaluate(envelope).await.outcome
    }

    /// Entry point for raw broker bodies.
    pub async fn handle_delivery(&self, data: &[u8]) -> Verdict {
        match EventEnvelope::from_slice(data) {
            Ok(envelope) => self.evaluate(&envelope).await,
            Err(e) => {
                warn!(error = %e, "Dead-lettering undecodable message");
                Verdict::nack(Outcome::dead_letter(), e.to_string())
            }
        }
    }

    pub async fn evaluate(&self, envelope: &EventEnvelope) -> Verdict {
        match self.process(envelope).await {
            Ok(()) => Verdict::ack(),
            Err(e) => {
                let outcome = self.outcome_for(&e, envelope.attempt());

                warn!(
                    message_id = %envelope.id(),
                    routing_key = envelope.routing_key(),
                    attempt = envelope.attempt(),
                    max_retries = self.settings.max_retries,
                    outcome = %outcome,
                    error = %e,
                    "Notification not delivered"
                );

                Verdict::nack(outcome, e.to_string())
            }
        }
    }

    fn outcome_for(&self, error: &ConsumeError, attempt: u32) -> Outcome {
        match error {
            ConsumeError::Delivery(e) if e.is_transient() && attempt <= self.settings.max_retries => {
                Outcome::retry()
            }
            _ => Outcome::dead_letter(),
        }
    }

    async fn process(&self, envelope: &EventEnvelope) -> Result<(), ConsumeError> {
        if envelope.attempt() > self.settings.max_retries {
            return Err(ConsumeError::RetriesExhausted {
                attempt: envelope.attempt(),
                max_retries: self.settings.max_retries,
            });
        }

        let notification = envelope.notification()?;
        let key = notification.idempotency_key(envelope.id());

        info!(
            message_id = %envelope.id(),
            ticket_id = %notification.ticket_id,
            kind = notification.kind.as_str(),
            attempt = envelope.attempt(),
            "Processing notification"
        );

        match self.idempotency.check(&key).await {
            Ok(IdempotencyStatus::Sent) => {
                info!(idempotency_key = %key, "Notification already sent, skipping");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!(idempotency_key = %key, error = %e, "Idempotency check failed"),
        }

        self.mark(&key, IdempotencyStatus::Processing).await;

        let sent = tokio::time::timeout(
            self.settings.delivery_timeout,
            self.delivery.send(
                &notification.recipient,
                &self.settings.from_address,
                &notification.subject,
                &notification.body,
            ),
        )
        .await
        .unwrap_or_else(|_| {
            Err(DeliveryError::Transient(format!(
                "Delivery timed out after {}ms",
                self.settings.delivery_timeout.as_millis()
            )))
        });

        match sent {
            Ok(()) => {
                self.mark(&key, IdempotencyStatus::Sent).await;
                info!(
                    message_id = %envelope.id(),
                    ticket_id = %notification.ticket_id,
                    "Notification sent successfully"
                );
                Ok(())
            }
            Err(e) => {
                self.mark(&key, IdempotencyStatus::Failed).await;
                Err(e.into())
            }
        }
    }

    async fn mark(&self, key: &str, status: IdempotencyStatus) {
        if let Err(e) = self.idempotency.mark(key, status).await {
            warn!(idempotency_key = key, status = %status, error = %e, "Failed to record idempotency status");
        } else {
            debug!(idempotency_key = key, status = %status, "Idempotency status recorded");
        }
    }
}
