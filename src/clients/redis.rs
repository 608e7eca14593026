use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::{info, warn};

use crate::{
    clients::idempotency::IdempotencyStore,
    error::IdempotencyError,
    models::{retry::RetryConfig, status::IdempotencyStatus},
    utils::retry_with_backoff,
};

pub struct RedisIdempotencyStore {
    connection: MultiplexedConnection,
    idempotency_ttl_seconds: u64,
    retry_config: RetryConfig,
}

impl RedisIdempotencyStore {
    pub async fn connect(
        redis_url: &str,
        idempotency_ttl_seconds: u64,
        retry_config: RetryConfig,
    ) -> Result<Self, Error> {
        info!("Connecting to Redis");

        let client =
            Client::open(redis_url).map_err(|e| anyhow!("Failed to create redis client: {}", e))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| anyhow!("Failed to connect to redis: {}", e))?;

        info!("Redis connection established");

        Ok(Self {
            connection,
            idempotency_ttl_seconds,
            retry_config,
        })
    }

    fn key(idempotency_key: &str) -> String {
        format!("idempotency:{}", idempotency_key)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn check(&self, idempotency_key: &str) -> Result<IdempotencyStatus, IdempotencyError> {
        let key = Self::key(idempotency_key);
        let mut connection = self.connection.clone();

        let value: Option<String> = connection
            .get(&key)
            .await
            .map_err(|e| IdempotencyError::Backend(format!("Failed to get cached value: {}", e)))?;

        match value.as_deref() {
            None => Ok(IdempotencyStatus::NotFound),
            Some(raw) => match IdempotencyStatus::parse(raw) {
                Some(status) => Ok(status),
                None => {
                    warn!(key = %key, status = raw, "Unknown idempotency status");
                    Ok(IdempotencyStatus::NotFound)
                }
            },
        }
    }

    async fn mark(
        &self,
        idempotency_key: &str,
        status: IdempotencyStatus,
    ) -> Result<(), IdempotencyError> {
        let key = Self::key(idempotency_key);
        let value = status.to_string();

        // Only the "sent" marker is retried.
        let retry_config = match status {
            IdempotencyStatus::Sent => self.retry_config.clone(),
            _ => RetryConfig {
                max_attempts: 1,
                ..self.retry_config.clone()
            },
        };

        retry_with_backoff(&retry_config, || {
            let key = key.clone();
            let value = value.clone();
            let mut connection = self.connection.clone();
            let ttl = self.idempotency_ttl_seconds;

            async move {
                connection
                    .set_ex::<_, _, ()>(&key, value, ttl)
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .await
        .map_err(|e| IdempotencyError::Backend(format!("Failed to mark {} as {}: {}", key, status, e)))
    }

    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<(), IdempotencyError> {
        let mut connection = self.connection.clone();

        connection
            .ping::<String>()
            .await
            .map(|_| ())
            .map_err(|e| IdempotencyError::Backend(format!("Ping failed: {}", e)))
    }
}
