use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    envelope::{NotificationKind, NotificationPayload},
    validation::validate_new_ticket,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticket {
    pub id: Uuid,
    pub requester_email: String,
    pub subject: String,
    pub description: String,
    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reminded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTicket {
    pub requester_email: String,
    pub subject: String,

    #[serde(default)]
    pub description: String,
}

impl NewTicket {
    pub fn into_ticket(self) -> anyhow::Result<Ticket> {
        validate_new_ticket(&self)?;

        Ok(Ticket {
            id: Uuid::new_v4(),
            requester_email: self.requester_email.trim().to_string(),
            subject: self.subject.trim().to_string(),
            description: self.description,
            created_at: Utc::now(),
            reminded_at: None,
        })
    }
}

impl Ticket {
    pub fn notification(&self, kind: NotificationKind) -> NotificationPayload {
        let (subject, body) = match kind {
            NotificationKind::TicketCreated => (
                format!("We received your ticket: {}", self.subject),
                format!(
                    "Your ticket {} has been created.\n\n{}",
                    self.id, self.description
                ),
            ),
            NotificationKind::Reminder => (
                format!("Reminder: ticket \"{}\" is still open", self.subject),
                format!(
                    "Your ticket {} opened at {} is still awaiting resolution.",
                    self.id,
                    self.created_at.to_rfc3339()
                ),
            ),
        };

        NotificationPayload {
            ticket_id: self.id.to_string(),
            recipient: self.requester_email.clone(),
            subject,
            body,
            kind,
        }
    }
}
