use std::{collections::HashMap, sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    clients::{idempotency::IdempotencyStore, rbmq::EventBus},
    models::health::{HealthCheckResponse, HealthStatus, ServiceHealth},
};

pub struct HealthChecker {
    bus: Arc<dyn EventBus>,
    idempotency: Arc<dyn IdempotencyStore>,
}

impl HealthChecker {
    pub fn new(bus: Arc<dyn EventBus>, idempotency: Arc<dyn IdempotencyStore>) -> Self {
        Self { bus, idempotency }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        checks.insert("message_broker".to_string(), self.check_broker().await);
        checks.insert("idempotency_store".to_string(), self.check_idempotency().await);

        let overall_status = self.determine_overall_status(&checks);

        HealthCheckResponse {
            status: overall_status,
            timestamp: Utc::now(),
            checks,
        }
    }

    async fn check_broker(&self) -> ServiceHealth {
        let start = Instant::now();

        if self.bus.is_connected().await {
            let elapsed = start.elapsed().as_millis() as u64;
            debug!(response_time_ms = elapsed, "Broker health check passed");
            ServiceHealth::healthy(elapsed).with_backend("rabbitmq")
        } else {
            warn!("Broker connection is down");
            ServiceHealth::unhealthy("Broker connection is down".to_string())
                .with_backend("rabbitmq")
        }
    }

    async fn check_idempotency(&self) -> ServiceHealth {
        let start = Instant::now();
        let backend = self.idempotency.backend();

        match self.idempotency.ping().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(backend, response_time_ms = elapsed, "Idempotency store health check passed");
                ServiceHealth::healthy(elapsed).with_backend(backend)
            }
            Err(e) => {
                warn!(backend, error = %e, "Idempotency store health check failed");
                ServiceHealth::degraded(e.to_string()).with_backend(backend)
            }
        }
    }

    /// The broker is critical; a failing idempotency store only degrades
    /// the service since delivery continues without it.
    fn determine_overall_status(&self, checks: &HashMap<String, ServiceHealth>) -> HealthStatus {
        let critical_unhealthy = checks
            .get("message_broker")
            .is_some_and(|health| health.status == HealthStatus::Unhealthy);

        let has_degraded = checks
            .values()
            .any(|health| health.status != HealthStatus::Healthy);

        if critical_unhealthy {
            HealthStatus::Unhealthy
        } else if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}
