use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{error::StoreError, models::ticket::Ticket};

/// Ticket persistence owned outside this service.
///
/// The reminder sweep only reads tickets that are due and records when a
/// reminder went out; all "who needs a reminder" state lives here.
#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn insert(&self, ticket: Ticket) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Ticket, StoreError>;

    /// Tickets created at least `reminder_after` before `now` that have not
    /// been reminded yet.
    async fn due_for_reminder(
        &self,
        now: DateTime<Utc>,
        reminder_after: Duration,
    ) -> Result<Vec<Ticket>, StoreError>;

    async fn mark_reminded(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryTicketStore {
    tickets: RwLock<HashMap<Uuid, Ticket>>,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn insert(&self, ticket: Ticket) -> Result<(), StoreError> {
        self.tickets.write().await.insert(ticket.id, ticket);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Ticket, StoreError> {
        self.tickets
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn due_for_reminder(
        &self,
        now: DateTime<Utc>,
        reminder_after: Duration,
    ) -> Result<Vec<Ticket>, StoreError> {
        let reminder_after = chrono::Duration::from_std(reminder_after)
            .map_err(|e| StoreError::Unavailable(format!("Invalid reminder delay: {}", e)))?;
        let cutoff = now - reminder_after;

        let mut due: Vec<Ticket> = self
            .tickets
            .read()
            .await
            .values()
            .filter(|ticket| ticket.reminded_at.is_none() && ticket.created_at <= cutoff)
            .cloned()
            .collect();

        due.sort_by_key(|ticket| ticket.created_at);
        Ok(due)
    }

    async fn mark_reminded(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tickets = self.tickets.write().await;
        let ticket = tickets
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        ticket.reminded_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(age_minutes: i64) -> Ticket {
        Ticket {
            id: Uuid::new_v4(),
            requester_email: "a@x.com".to_string(),
            subject: "Printer on fire".to_string(),
            description: String::new(),
            created_at: Utc::now() - chrono::Duration::minutes(age_minutes),
            reminded_at: None,
        }
    }

    #[tokio::test]
    async fn only_old_unreminded_tickets_are_due() {
        let store = InMemoryTicketStore::new();
        let old = ticket(90);
        let fresh = ticket(5);
        let reminded = ticket(120);

        store.insert(old.clone()).await.unwrap();
        store.insert(fresh).await.unwrap();
        store.insert(reminded.clone()).await.unwrap();
        store.mark_reminded(reminded.id, Utc::now()).await.unwrap();

        let due = store
            .due_for_reminder(Utc::now(), Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, old.id);
    }

    #[tokio::test]
    async fn marking_unknown_ticket_fails() {
        let store = InMemoryTicketStore::new();

        assert!(matches!(
            store.mark_reminded(Uuid::new_v4(), Utc::now()).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
