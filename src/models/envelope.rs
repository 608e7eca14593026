use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::ConsumeError, models::validation::validate_recipient};

/// The unit exchanged over the broker.
///
/// Fields are private so a published envelope keeps its routing key; the
/// only way to change `attempt` is [`EventEnvelope::redelivered`], which
/// increments it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    id: Uuid,
    routing_key: String,
    payload: serde_json::Value,
    published_at: DateTime<Utc>,
    attempt: u32,
}

impl EventEnvelope {
    pub fn new<P: Serialize>(routing_key: &str, payload: &P) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            routing_key: routing_key.to_string(),
            payload: serde_json::to_value(payload)?,
            published_at: Utc::now(),
            attempt: 1,
        })
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, ConsumeError> {
        let envelope = serde_json::from_slice::<Self>(data)
            .map_err(|e| ConsumeError::MalformedPayload(format!("Invalid envelope: {}", e)))?;

        if envelope.attempt == 0 {
            return Err(ConsumeError::MalformedPayload(
                "Envelope attempt must be at least 1".to_string(),
            ));
        }

        Ok(envelope)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Copy of this envelope for the next delivery attempt.
    pub fn redelivered(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    /// Fast-forwards the attempt counter; never moves it backwards.
    pub fn at_attempt(mut self, attempt: u32) -> Self {
        self.attempt = self.attempt.max(attempt);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn notification(&self) -> Result<NotificationPayload, ConsumeError> {
        let payload = serde_json::from_value::<NotificationPayload>(self.payload.clone())
            .map_err(|e| ConsumeError::MalformedPayload(format!("Invalid payload: {}", e)))?;

        payload.validate()?;

        Ok(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TicketCreated,
    Reminder,
}

impl NotificationKind {
    pub fn as_str(&self) -> &str {
        match self {
            NotificationKind::TicketCreated => "ticket_created",
            NotificationKind::Reminder => "reminder",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationPayload {
    #[serde(default, alias = "ticketId")]
    pub ticket_id: String,

    #[serde(default, alias = "to")]
    pub recipient: String,

    #[serde(default)]
    pub subject: String,

    #[serde(default)]
    pub body: String,

    #[serde(default = "default_kind")]
    pub kind: NotificationKind,
}

fn default_kind() -> NotificationKind {
    NotificationKind::Reminder
}

impl NotificationPayload {
    pub fn validate(&self) -> Result<(), ConsumeError> {
        if self.subject.trim().is_empty() {
            return Err(ConsumeError::MalformedPayload(
                "Missing subject in payload".to_string(),
            ));
        }

        validate_recipient(&self.recipient)
            .map_err(|e| ConsumeError::MalformedPayload(e.to_string()))
    }

    /// Deduplication key for this notification. Payloads without a ticket
    /// id are keyed by the id of the envelope carrying them.
    pub fn idempotency_key(&self, message_id: Uuid) -> String {
        match self.ticket_id.trim() {
            "" => format!("{}:{}", message_id, self.kind.as_str()),
            ticket_id => format!("{}:{}", ticket_id, self.kind.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqMessage {
    pub original_message: serde_json::Value,
    pub failure_reason: String,
    pub failed_at: String,
}

impl DlqMessage {
    /// Keeps the original body as JSON when it parses, as a string otherwise.
    pub fn from_body(data: &[u8], failure_reason: String) -> Self {
        let original_message = serde_json::from_slice::<serde_json::Value>(data)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(data).into_owned()));

        Self {
            original_message,
            failure_reason,
            failed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}
