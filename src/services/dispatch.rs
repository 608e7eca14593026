//! Bounded worker pool between the broker and the consumer.
//!
//! ```text
//! broker pump → mpsc (bounded) → DispatchPool → [Semaphore] → NotificationConsumer
//!                                                            → Settle (ack / requeue / dead-letter)
//! ```
//!
//! A delivery is only settled after the consumer returns, so a crash or an
//! aborted handler leaves it unacknowledged and the broker hands it out again.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::BrokerError,
    models::outcome::{Outcome, Verdict},
    services::consumer::NotificationConsumer,
};

/// Transport-specific acknowledgement of one delivery.
#[async_trait]
pub trait Settle: Send {
    async fn settle(self: Box<Self>, data: &[u8], verdict: &Verdict) -> Result<(), BrokerError>;
}

pub struct Inbound {
    data: Vec<u8>,
    settlement: Box<dyn Settle>,
}

impl Inbound {
    pub fn new(data: Vec<u8>, settlement: Box<dyn Settle>) -> Self {
        Self { data, settlement }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub handled: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub settle_failures: u64,
    pub abandoned: u64,
}

pub struct DispatchPool {
    consumer: Arc<NotificationConsumer>,
    concurrency: usize,
    drain_timeout: Duration,
}

impl DispatchPool {
    pub fn new(consumer: Arc<NotificationConsumer>, concurrency: usize, drain_timeout: Duration) -> Self {
        Self {
            consumer,
            concurrency: concurrency.max(1),
            drain_timeout,
        }
    }

    /// Capacity for the queue feeding this pool.
    pub fn queue_capacity(&self) -> usize {
        self.concurrency
    }

    /// Runs until every sender of `inbound` is dropped, then waits up to the
    /// drain timeout for in-flight handlers. Handlers still running after
    /// that are aborted without settling.
    pub async fn run(self, mut inbound: mpsc::Receiver<Inbound>) -> DispatchStats {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight: JoinSet<Option<Verdict>> = JoinSet::new();
        let mut stats = DispatchStats::default();

        info!(concurrency = self.concurrency, "Dispatch pool started");

        while let Some(message) = inbound.recv().await {
            while let Some(joined) = in_flight.try_join_next() {
                record(&mut stats, joined);
            }

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!("Dispatch semaphore closed, leaving message unsettled");
                    break;
                }
            };

            let consumer = Arc::clone(&self.consumer);

            in_flight.spawn(async move {
                let Inbound { data, settlement } = message;
                let verdict = consumer.handle_delivery(&data).await;

                let settled = settlement.settle(&data, &verdict).await;
                drop(permit);

                match settled {
                    Ok(()) => Some(verdict),
                    Err(e) => {
                        warn!(error = %e, outcome = %verdict.outcome, "Failed to settle delivery");
                        None
                    }
                }
            });
        }

        debug!(in_flight = in_flight.len(), "Dispatch queue closed, draining");

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(joined) = in_flight.join_next().await {
                record(&mut stats, joined);
            }
        })
        .await;

        if drained.is_err() {
            stats.abandoned += in_flight.len() as u64;
            warn!(
                abandoned = in_flight.len(),
                "Drain timeout elapsed, aborting in-flight handlers"
            );
            in_flight.abort_all();
        }

        info!(
            handled = stats.handled,
            acked = stats.acked,
            requeued = stats.requeued,
            dead_lettered = stats.dead_lettered,
            "Dispatch pool stopped"
        );

        stats
    }
}

fn record(stats: &mut DispatchStats, joined: Result<Option<Verdict>, tokio::task::JoinError>) {
    stats.handled += 1;

    match joined {
        Ok(Some(verdict)) => match verdict.outcome {
            Outcome::Ack => stats.acked += 1,
            Outcome::Nack { requeue: true } => stats.requeued += 1,
            Outcome::Nack { requeue: false } => stats.dead_lettered += 1,
        },
        Ok(None) => stats.settle_failures += 1,
        Err(e) => {
            error!(error = %e, "Dispatch handler panicked");
            stats.settle_failures += 1;
        }
    }
}
