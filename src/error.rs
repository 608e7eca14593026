use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Failed to settle delivery: {0}")]
    Settle(String),

    #[error("Broker operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
}

/// Failure reported by a [`DeliveryCapability`](crate::clients::email::DeliveryCapability).
///
/// Transient failures are retried through broker redelivery; permanent ones
/// are dead-lettered without consuming further attempts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    #[error("Permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Attempt {attempt} exceeds the retry limit of {max_retries}")]
    RetriesExhausted { attempt: u32, max_retries: u32 },

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Ticket {0} not found")]
    NotFound(String),

    #[error("Ticket store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("Idempotency backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum SchedulerTickError {
    #[error("Reminder sweep could not read tickets: {0}")]
    Store(#[from] StoreError),

    #[error("Reminder sweep left {failed} of {total} tickets unnotified")]
    Partial { failed: usize, total: usize },

    #[error("Reminder sweep panicked: {0}")]
    Panicked(String),
}
