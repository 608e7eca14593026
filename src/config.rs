use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::{
    models::retry::RetryConfig,
    services::{reminder::ReminderRouteKind, scheduler::OverlapPolicy},
};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    #[serde(default = "default_exchange_name")]
    pub exchange_name: String,
    #[serde(default = "default_reminder_binding_key")]
    pub reminder_binding_key: String,
    #[serde(default = "default_reminder_queue_name")]
    pub reminder_queue_name: String,
    #[serde(default = "default_failed_queue_name")]
    pub failed_queue_name: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default = "default_broker_timeout_ms")]
    pub broker_timeout_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    pub redis_url: Option<String>,
    #[serde(default = "default_idempotency_ttl_seconds")]
    pub idempotency_ttl_seconds: u64,

    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    #[serde(default = "default_true")]
    pub smtp_tls: bool,
    pub email_from: String,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_publish_retry_attempts")]
    pub publish_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,
    #[serde(default = "default_delivery_timeout_seconds")]
    pub delivery_timeout_seconds: u64,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_scheduler_interval_seconds")]
    pub scheduler_interval_seconds: u64,
    #[serde(default = "default_scheduler_max_concurrent_sweeps")]
    pub scheduler_max_concurrent_sweeps: usize,
    #[serde(default = "default_reminder_after_seconds")]
    pub reminder_after_seconds: u64,
    #[serde(default)]
    pub reminder_route: ReminderRouteKind,

    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_exchange_name() -> String {
    "ticket_notifications".to_string()
}

fn default_reminder_binding_key() -> String {
    "ticket.created.reminder".to_string()
}

fn default_reminder_queue_name() -> String {
    "ticket_reminders".to_string()
}

fn default_failed_queue_name() -> String {
    "ticket_reminders_failed".to_string()
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_broker_timeout_ms() -> u64 {
    5_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_idempotency_ttl_seconds() -> u64 {
    86_400
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_publish_retry_attempts() -> u32 {
    3
}

fn default_initial_retry_delay_ms() -> u64 {
    500
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_retry_backoff_multiplier() -> u64 {
    2
}

fn default_delivery_timeout_seconds() -> u64 {
    10
}

fn default_worker_concurrency() -> usize {
    10
}

fn default_scheduler_interval_seconds() -> u64 {
    120
}

fn default_scheduler_max_concurrent_sweeps() -> usize {
    1
}

fn default_reminder_after_seconds() -> u64 {
    3_600
}

fn default_shutdown_grace_seconds() -> u64 {
    30
}

fn default_port() -> u16 {
    3000
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.reminder_binding_key.trim().is_empty() {
            return Err(anyhow!("REMINDER_BINDING_KEY cannot be empty"));
        }
        if self.scheduler_interval_seconds == 0 {
            return Err(anyhow!("SCHEDULER_INTERVAL_SECONDS must be greater than zero"));
        }
        if self.scheduler_max_concurrent_sweeps == 0 {
            return Err(anyhow!(
                "SCHEDULER_MAX_CONCURRENT_SWEEPS must be greater than zero"
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(anyhow!("WORKER_CONCURRENCY must be greater than zero"));
        }
        if self.max_retry_attempts == 0 {
            return Err(anyhow!("MAX_RETRY_ATTEMPTS must be greater than zero"));
        }
        if self.delivery_timeout_seconds == 0 || self.broker_timeout_ms == 0 {
            return Err(anyhow!("Timeouts must be greater than zero"));
        }
        Ok(())
    }

    /// Backoff policy used when (re)connecting to the broker.
    pub fn reconnect_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_reconnect_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn publish_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.publish_retry_attempts.max(1),
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn broker_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_seconds)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_seconds)
    }

    pub fn reminder_after(&self) -> Duration {
        Duration::from_secs(self.reminder_after_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn overlap_policy(&self) -> OverlapPolicy {
        match self.scheduler_max_concurrent_sweeps {
            1 => OverlapPolicy::Skip,
            limit => OverlapPolicy::Bounded(limit),
        }
    }
}
