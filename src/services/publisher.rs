use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    clients::rbmq::EventBus,
    models::{
        envelope::{EventEnvelope, NotificationKind},
        retry::RetryConfig,
        ticket::Ticket,
    },
    utils::retry_with_backoff,
};

/// Result of handing a notification to the broker.
///
/// Publishing is best-effort from the ticket flow's point of view, so a
/// failure is reported as `Deferred` rather than as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publication {
    Published { message_id: String },
    Deferred { reason: String },
}

impl Publication {
    pub fn is_published(&self) -> bool {
        matches!(self, Publication::Published { .. })
    }
}

#[derive(Clone)]
pub struct TicketPublisher {
    bus: Arc<dyn EventBus>,
    binding_key: String,
    retry_config: RetryConfig,
}

impl TicketPublisher {
    pub fn new(bus: Arc<dyn EventBus>, binding_key: String, retry_config: RetryConfig) -> Self {
        Self {
            bus,
            binding_key,
            retry_config,
        }
    }

    pub async fn on_ticket_created(&self, ticket: &Ticket) -> Publication {
        self.publish(ticket, NotificationKind::TicketCreated).await
    }

    pub async fn publish_reminder(&self, ticket: &Ticket) -> Publication {
        self.publish(ticket, NotificationKind::Reminder).await
    }

    async fn publish(&self, ticket: &Ticket, kind: NotificationKind) -> Publication {
        let envelope = match EventEnvelope::new(&self.binding_key, &ticket.notification(kind)) {
            Ok(envelope) => envelope,
            Err(e) => return self.deferred(ticket, kind, format!("Failed to encode envelope: {}", e)),
        };

        let body = match envelope.to_vec() {
            Ok(body) => body,
            Err(e) => return self.deferred(ticket, kind, format!("Failed to encode envelope: {}", e)),
        };

        let published = retry_with_backoff(&self.retry_config, || {
            let body = body.as_slice();
            async move { self.bus.publish(&self.binding_key, body).await }
        })
        .await;

        match published {
            Ok(()) => {
                info!(
                    ticket_id = %ticket.id,
                    message_id = %envelope.id(),
                    kind = kind.as_str(),
                    routing_key = %self.binding_key,
                    "Notification event published"
                );
                Publication::Published {
                    message_id: envelope.id().to_string(),
                }
            }
            Err(e) => self.deferred(ticket, kind, format!("Publish to broker failed: {}", e)),
        }
    }

    fn deferred(&self, ticket: &Ticket, kind: NotificationKind, reason: String) -> Publication {
        warn!(
            ticket_id = %ticket.id,
            kind = kind.as_str(),
            reason = %reason,
            "Notification event not published"
        );
        Publication::Deferred { reason }
    }
}
