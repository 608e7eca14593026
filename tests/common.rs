use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use ticket_notifier::{
    clients::{
        email::DeliveryCapability,
        idempotency::InMemoryIdempotencyStore,
        rbmq::EventBus,
    },
    error::{BrokerError, DeliveryError},
    models::{
        envelope::EventEnvelope,
        outcome::{Outcome, Verdict},
        retry::RetryConfig,
        ticket::Ticket,
    },
    services::{
        consumer::{ConsumerSettings, NotificationConsumer},
        dispatch::{Inbound, Settle},
    },
};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const BINDING_KEY: &str = "ticket.created.reminder";
pub const FROM_ADDRESS: &str = "support@admin.com";

/// In-process stand-in for the broker's publishing side.
#[derive(Default)]
pub struct RecordingBus {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    failures_left: AtomicU32,
    always_fail: AtomicBool,
    disconnected: AtomicBool,
    calls: AtomicU32,
}

impl RecordingBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let bus = Self::default();
        bus.always_fail.store(true, Ordering::SeqCst);
        Arc::new(bus)
    }

    pub fn failing_first(failures: u32) -> Arc<Self> {
        let bus = Self::default();
        bus.failures_left.store(failures, Ordering::SeqCst);
        Arc::new(bus)
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<(String, EventEnvelope)> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(key, body)| (key.clone(), EventEnvelope::from_slice(body).unwrap()))
            .collect()
    }
}

#[async_trait]
impl EventBus for RecordingBus {
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish("broker unavailable".to_string()));
        }

        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::Publish("transient broker failure".to_string()));
        }

        self.published
            .lock()
            .unwrap()
            .push((routing_key.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub enum MailerStep {
    Deliver,
    Fail(DeliveryError),
    Hang,
    Slow(Duration),
}

/// Delivery capability that follows a script, counts calls and tracks how
/// many sends overlap. Once the script runs out every call succeeds.
#[derive(Default)]
pub struct ScriptedMailer {
    script: Mutex<VecDeque<MailerStep>>,
    sent_to: Mutex<Vec<String>>,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedMailer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(steps: impl IntoIterator<Item = MailerStep>) -> Arc<Self> {
        let mailer = Self::default();
        mailer.script.lock().unwrap().extend(steps);
        Arc::new(mailer)
    }

    pub fn always(step: MailerStep, times: usize) -> Arc<Self> {
        Self::scripted(std::iter::repeat_n(step, times))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn delivered_to(&self) -> Vec<String> {
        self.sent_to.lock().unwrap().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryCapability for ScriptedMailer {
    async fn send(
        &self,
        to: &str,
        _from: &str,
        _subject: &str,
        _body: &str,
    ) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MailerStep::Deliver);

        match step {
            MailerStep::Deliver => {
                self.sent_to.lock().unwrap().push(to.to_string());
                Ok(())
            }
            MailerStep::Fail(e) => Err(e),
            MailerStep::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            MailerStep::Slow(duration) => {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);

                tokio::time::sleep(duration).await;

                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.sent_to.lock().unwrap().push(to.to_string());
                Ok(())
            }
        }
    }
}

pub fn settings(max_retries: u32, delivery_timeout: Duration) -> ConsumerSettings {
    ConsumerSettings {
        max_retries,
        delivery_timeout,
        from_address: FROM_ADDRESS.to_string(),
    }
}

pub fn consumer_with(
    mailer: Arc<ScriptedMailer>,
    settings: ConsumerSettings,
) -> (Arc<NotificationConsumer>, Arc<InMemoryIdempotencyStore>) {
    let idempotency = Arc::new(InMemoryIdempotencyStore::new(Duration::from_secs(3600)));
    let consumer = Arc::new(NotificationConsumer::new(
        mailer,
        idempotency.clone(),
        settings,
    ));
    (consumer, idempotency)
}

pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2,
    }
}

pub fn ticket(requester_email: &str, age: chrono::Duration) -> Ticket {
    Ticket {
        id: Uuid::new_v4(),
        requester_email: requester_email.to_string(),
        subject: "VPN drops every hour".to_string(),
        description: "Connection resets at :00".to_string(),
        created_at: Utc::now() - age,
        reminded_at: None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub attempt: u32,
    pub outcome: Outcome,
}

/// Settlement that plays the broker's part: a requeue republishes the
/// envelope with the next attempt into the same dispatch queue.
pub struct LoopbackSettlement {
    queue: Option<mpsc::Sender<Inbound>>,
    log: Arc<Mutex<Vec<Settled>>>,
}

impl LoopbackSettlement {
    pub fn inbound(
        envelope: &EventEnvelope,
        queue: &mpsc::Sender<Inbound>,
        log: &Arc<Mutex<Vec<Settled>>>,
    ) -> Inbound {
        Self::raw(envelope.to_vec().unwrap(), queue, log)
    }

    pub fn raw(
        data: Vec<u8>,
        queue: &mpsc::Sender<Inbound>,
        log: &Arc<Mutex<Vec<Settled>>>,
    ) -> Inbound {
        Inbound::new(
            data,
            Box::new(LoopbackSettlement {
                queue: Some(queue.clone()),
                log: Arc::clone(log),
            }),
        )
    }

    /// Records the verdict but cannot requeue, so it never keeps the
    /// dispatch queue open.
    pub fn detached(envelope: &EventEnvelope, log: &Arc<Mutex<Vec<Settled>>>) -> Inbound {
        Inbound::new(
            envelope.to_vec().unwrap(),
            Box::new(LoopbackSettlement {
                queue: None,
                log: Arc::clone(log),
            }),
        )
    }
}

#[async_trait]
impl Settle for LoopbackSettlement {
    async fn settle(self: Box<Self>, data: &[u8], verdict: &Verdict) -> Result<(), BrokerError> {
        let envelope = EventEnvelope::from_slice(data).ok();

        self.log.lock().unwrap().push(Settled {
            attempt: envelope.as_ref().map(|e| e.attempt()).unwrap_or(0),
            outcome: verdict.outcome,
        });

        if verdict.outcome == Outcome::retry() {
            let queue = self
                .queue
                .as_ref()
                .ok_or_else(|| BrokerError::Settle("no queue to requeue into".to_string()))?;
            let next = envelope
                .ok_or_else(|| BrokerError::Settle("cannot requeue undecodable body".to_string()))?
                .redelivered();

            queue
                .send(Self::inbound(&next, queue, &self.log))
                .await
                .map_err(|e| BrokerError::Settle(e.to_string()))?;
        }

        Ok(())
    }
}
