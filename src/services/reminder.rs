use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clients::store::TicketStore,
    error::SchedulerTickError,
    models::{
        envelope::{EventEnvelope, NotificationKind},
        outcome::Outcome,
        ticket::Ticket,
    },
    services::{
        consumer::NotificationConsumer,
        publisher::{Publication, TicketPublisher},
        scheduler::{ScheduleTick, SweepJob},
    },
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderRouteKind {
    #[default]
    Publish,
    Direct,
}

/// Where a due reminder goes: onto the broker, or straight into the consumer.
pub enum ReminderRoute {
    Broker(TicketPublisher),
    Direct {
        consumer: Arc<NotificationConsumer>,
        routing_key: String,
    },
}

enum Reminded {
    Delivered,
    Deferred(String),
    DeadLettered(String),
}

pub struct ReminderSweep {
    store: Arc<dyn TicketStore>,
    route: ReminderRoute,
    reminder_after: Duration,
    /// Direct-route delivery attempts per ticket, carried across ticks.
    attempts: Mutex<HashMap<Uuid, u32>>,
}

impl ReminderSweep {
    pub fn new(store: Arc<dyn TicketStore>, route: ReminderRoute, reminder_after: Duration) -> Self {
        Self {
            store,
            route,
            reminder_after,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn attempts_lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, u32>> {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn remind(&self, ticket: &Ticket) -> Reminded {
        match &self.route {
            ReminderRoute::Broker(publisher) => match publisher.publish_reminder(ticket).await {
                Publication::Published { .. } => Reminded::Delivered,
                Publication::Deferred { reason } => Reminded::Deferred(reason),
            },
            ReminderRoute::Direct {
                consumer,
                routing_key,
            } => {
                let envelope = match EventEnvelope::new(
                    routing_key,
                    &ticket.notification(NotificationKind::Reminder),
                ) {
                    Ok(envelope) => envelope,
                    Err(e) => return Reminded::DeadLettered(e.to_string()),
                };

                let attempt = self.attempts_lock().get(&ticket.id).copied().unwrap_or(1);
                let verdict = consumer.evaluate(&envelope.at_attempt(attempt)).await;
                let failure = verdict.failure.unwrap_or_else(|| "unknown failure".to_string());

                match verdict.outcome {
                    Outcome::Ack => {
                        self.attempts_lock().remove(&ticket.id);
                        Reminded::Delivered
                    }
                    Outcome::Nack { requeue: true } => {
                        self.attempts_lock().insert(ticket.id, attempt.saturating_add(1));
                        Reminded::Deferred(failure)
                    }
                    Outcome::Nack { requeue: false } => {
                        self.attempts_lock().remove(&ticket.id);
                        Reminded::DeadLettered(failure)
                    }
                }
            }
        }
    }
}

#[async_trait]
impl SweepJob for ReminderSweep {
    async fn run(&self, tick: ScheduleTick) -> Result<(), SchedulerTickError> {
        let due = self
            .store
            .due_for_reminder(tick.fired_at, self.reminder_after)
            .await?;

        if due.is_empty() {
            debug!(sequence = tick.sequence, "No tickets due for a reminder");
            return Ok(());
        }

        let total = due.len();
        let mut failed = 0;

        for ticket in &due {
            match self.remind(ticket).await {
                Reminded::Delivered => {}
                Reminded::Deferred(reason) => {
                    failed += 1;
                    warn!(ticket_id = %ticket.id, reason = %reason, "Reminder not delivered");
                    continue;
                }
                Reminded::DeadLettered(reason) => {
                    failed += 1;
                    error!(ticket_id = %ticket.id, reason = %reason, "Reminder dead-lettered");
                }
            }

            if let Err(e) = self.store.mark_reminded(ticket.id, Utc::now()).await {
                failed += 1;
                warn!(ticket_id = %ticket.id, error = %e, "Failed to record reminder");
            }
        }

        info!(
            sequence = tick.sequence,
            total,
            failed,
            "Reminder sweep completed"
        );

        if failed > 0 {
            return Err(SchedulerTickError::Partial { failed, total });
        }

        Ok(())
    }
}
