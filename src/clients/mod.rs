pub mod email;
pub mod health;
pub mod idempotency;
pub mod rbmq;
pub mod redis;
pub mod store;
