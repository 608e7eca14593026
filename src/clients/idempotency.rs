use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::{error::IdempotencyError, models::status::IdempotencyStatus};

/// Records which notifications have already been delivered.
///
/// Keys are `ticket_id:kind`, so a reminder arriving through both the
/// scheduler and the broker is only sent once.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn check(&self, key: &str) -> Result<IdempotencyStatus, IdempotencyError>;

    async fn mark(&self, key: &str, status: IdempotencyStatus) -> Result<(), IdempotencyError>;

    fn backend(&self) -> &'static str;

    async fn ping(&self) -> Result<(), IdempotencyError> {
        Ok(())
    }
}

/// Process-local store used when no Redis URL is configured.
pub struct InMemoryIdempotencyStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, (IdempotencyStatus, Instant)>>,
}

impl InMemoryIdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, (IdempotencyStatus, Instant)>>, IdempotencyError>
    {
        self.entries
            .lock()
            .map_err(|_| IdempotencyError::Backend("Idempotency map poisoned".to_string()))
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn check(&self, key: &str) -> Result<IdempotencyStatus, IdempotencyError> {
        let mut entries = self.lock()?;

        match entries.get(key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                entries.remove(key);
                Ok(IdempotencyStatus::NotFound)
            }
            Some((status, _)) => Ok(*status),
            None => Ok(IdempotencyStatus::NotFound),
        }
    }

    async fn mark(&self, key: &str, status: IdempotencyStatus) -> Result<(), IdempotencyError> {
        let mut entries = self.lock()?;
        entries.insert(key.to_string(), (status, Instant::now() + self.ttl));
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_status_transitions() {
        let store = InMemoryIdempotencyStore::new(Duration::from_secs(60));

        assert_eq!(store.check("T1:reminder").await.unwrap(), IdempotencyStatus::NotFound);

        store.mark("T1:reminder", IdempotencyStatus::Processing).await.unwrap();
        assert_eq!(store.check("T1:reminder").await.unwrap(), IdempotencyStatus::Processing);

        store.mark("T1:reminder", IdempotencyStatus::Sent).await.unwrap();
        assert_eq!(store.check("T1:reminder").await.unwrap(), IdempotencyStatus::Sent);
        assert_eq!(store.check("T1:ticket_created").await.unwrap(), IdempotencyStatus::NotFound);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let store = InMemoryIdempotencyStore::new(Duration::from_millis(20));

        store.mark("T2:reminder", IdempotencyStatus::Sent).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(store.check("T2:reminder").await.unwrap(), IdempotencyStatus::NotFound);
    }
}
