use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Result, anyhow};
use ticket_notifier::{
    models::{
        envelope::{EventEnvelope, NotificationKind},
        outcome::Outcome,
    },
    services::dispatch::DispatchPool,
};
use tokio::sync::mpsc;

use crate::common::{
    BINDING_KEY, LoopbackSettlement, MailerStep, ScriptedMailer, Settled, consumer_with, settings,
    ticket,
};

/// Test: Publish, consume and send once, then acknowledge
#[tokio::test]
async fn test_end_to_end_notification_success_flow() -> Result<()> {
    let mailer = ScriptedMailer::new();
    let (consumer, _) = consumer_with(mailer.clone(), settings(5, Duration::from_secs(1)));
    let pool = DispatchPool::new(consumer, 4, Duration::from_secs(5));

    let (sender, receiver) = mpsc::channel(pool.queue_capacity());
    let log = Arc::new(Mutex::new(Vec::new()));

    let ticket = ticket("a@x.com", chrono::Duration::zero());
    let envelope = EventEnvelope::new(BINDING_KEY, &ticket.notification(NotificationKind::TicketCreated))?;
    sender
        .send(LoopbackSettlement::inbound(&envelope, &sender, &log))
        .await
        .map_err(|_| anyhow!("dispatch queue closed"))?;
    drop(sender);

    let stats = tokio::time::timeout(Duration::from_secs(5), pool.run(receiver)).await?;

    assert_eq!(mailer.calls(), 1);
    assert_eq!(stats.handled, 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(
        log.lock().unwrap().clone(),
        vec![Settled {
            attempt: 1,
            outcome: Outcome::Ack
        }]
    );

    Ok(())
}

/// Test: A send that always times out is retried up to the limit, then dead-lettered
#[tokio::test(start_paused = true)]
async fn test_repeated_timeouts_end_in_dead_letter() -> Result<()> {
    let mailer = ScriptedMailer::always(MailerStep::Hang, 10);
    let (consumer, _) = consumer_with(mailer.clone(), settings(5, Duration::from_secs(10)));
    let pool = DispatchPool::new(consumer, 1, Duration::from_secs(30));

    let (sender, receiver) = mpsc::channel(8);
    let log = Arc::new(Mutex::new(Vec::new()));

    let ticket = ticket("a@x.com", chrono::Duration::hours(2));
    let envelope = EventEnvelope::new(BINDING_KEY, &ticket.notification(NotificationKind::Reminder))?;
    sender
        .send(LoopbackSettlement::inbound(&envelope, &sender, &log))
        .await
        .map_err(|_| anyhow!("dispatch queue closed"))?;
    drop(sender);

    let stats = pool.run(receiver).await;

    assert_eq!(mailer.calls(), 5, "Exactly one send per allowed attempt");
    assert_eq!(stats.requeued, 5);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.acked, 0);

    let log = log.lock().unwrap().clone();
    let attempts: Vec<u32> = log.iter().map(|settled| settled.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3, 4, 5, 6]);
    assert!(attempts.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(log.last().map(|settled| settled.outcome), Some(Outcome::Nack { requeue: false }));

    Ok(())
}

/// Test: A transient failure recovers on redelivery
#[tokio::test]
async fn test_transient_failure_recovers_on_redelivery() -> Result<()> {
    let mailer = ScriptedMailer::scripted([
        MailerStep::Fail(ticket_notifier::error::DeliveryError::Transient(
            "connection reset".to_string(),
        )),
        MailerStep::Deliver,
    ]);
    let (consumer, _) = consumer_with(mailer.clone(), settings(5, Duration::from_secs(1)));
    let pool = DispatchPool::new(consumer, 2, Duration::from_secs(5));

    let (sender, receiver) = mpsc::channel(8);
    let log = Arc::new(Mutex::new(Vec::new()));

    let ticket = ticket("a@x.com", chrono::Duration::hours(2));
    let envelope = EventEnvelope::new(BINDING_KEY, &ticket.notification(NotificationKind::Reminder))?;
    sender
        .send(LoopbackSettlement::inbound(&envelope, &sender, &log))
        .await
        .map_err(|_| anyhow!("dispatch queue closed"))?;
    drop(sender);

    let stats = tokio::time::timeout(Duration::from_secs(5), pool.run(receiver)).await?;

    assert_eq!(mailer.calls(), 2);
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(mailer.delivered_to(), vec!["a@x.com".to_string()]);

    Ok(())
}

/// Test: Malformed bodies are dead-lettered and never reach the mailer
#[tokio::test]
async fn test_end_to_end_invalid_json_rejection() -> Result<()> {
    let mailer = ScriptedMailer::new();
    let (consumer, _) = consumer_with(mailer.clone(), settings(5, Duration::from_secs(1)));
    let pool = DispatchPool::new(consumer, 2, Duration::from_secs(5));

    let (sender, receiver) = mpsc::channel(8);
    let log = Arc::new(Mutex::new(Vec::new()));

    sender
        .send(LoopbackSettlement::raw(b"{\"invalid\": json}".to_vec(), &sender, &log))
        .await
        .map_err(|_| anyhow!("dispatch queue closed"))?;
    drop(sender);

    let stats = tokio::time::timeout(Duration::from_secs(5), pool.run(receiver)).await?;

    assert_eq!(mailer.calls(), 0);
    assert_eq!(stats.dead_lettered, 1);

    Ok(())
}

/// Test: Many messages are processed concurrently and each is sent once
#[tokio::test]
async fn test_end_to_end_high_throughput() -> Result<()> {
    let mailer = ScriptedMailer::new();
    let (consumer, _) = consumer_with(mailer.clone(), settings(5, Duration::from_secs(1)));
    let pool = DispatchPool::new(consumer, 8, Duration::from_secs(5));

    let (sender, receiver) = mpsc::channel(pool.queue_capacity());
    let log = Arc::new(Mutex::new(Vec::new()));
    let run = tokio::spawn(pool.run(receiver));

    for i in 0..50 {
        let ticket = ticket(&format!("user{}@x.com", i), chrono::Duration::hours(2));
        let envelope =
            EventEnvelope::new(BINDING_KEY, &ticket.notification(NotificationKind::Reminder))?;
        sender
            .send(LoopbackSettlement::inbound(&envelope, &sender, &log))
            .await
            .map_err(|_| anyhow!("dispatch queue closed"))?;
    }
    drop(sender);

    let stats = tokio::time::timeout(Duration::from_secs(10), run).await??;

    assert_eq!(stats.handled, 50);
    assert_eq!(stats.acked, 50);
    assert_eq!(mailer.calls(), 50);

    Ok(())
}

/// Test: The pool never runs more handlers at once than its concurrency limit
#[tokio::test(start_paused = true)]
async fn test_pool_respects_concurrency_limit() -> Result<()> {
    let mailer = ScriptedMailer::always(MailerStep::Slow(Duration::from_millis(50)), 50);
    let (consumer, _) = consumer_with(mailer.clone(), settings(5, Duration::from_secs(1)));
    let pool = DispatchPool::new(consumer, 4, Duration::from_secs(5));

    let (sender, receiver) = mpsc::channel(pool.queue_capacity());
    let log = Arc::new(Mutex::new(Vec::new()));
    let run = tokio::spawn(pool.run(receiver));

    for i in 0..50 {
        let ticket = ticket(&format!("user{}@x.com", i), chrono::Duration::hours(2));
        let envelope =
            EventEnvelope::new(BINDING_KEY, &ticket.notification(NotificationKind::Reminder))?;
        sender
            .send(LoopbackSettlement::inbound(&envelope, &sender, &log))
            .await
            .map_err(|_| anyhow!("dispatch queue closed"))?;
    }
    drop(sender);

    let stats = tokio::time::timeout(Duration::from_secs(10), run).await??;

    assert_eq!(stats.acked, 50);
    assert_eq!(mailer.delivered_to().len(), 50);
    assert!(
        mailer.peak_in_flight() <= 4,
        "Peak of {} concurrent sends exceeds the pool limit",
        mailer.peak_in_flight()
    );
    assert!(mailer.peak_in_flight() > 1, "Handlers should overlap");

    Ok(())
}

/// Test: Handlers still running after the drain timeout are abandoned unsettled
#[tokio::test(start_paused = true)]
async fn test_drain_timeout_abandons_in_flight_handlers() -> Result<()> {
    let mailer = ScriptedMailer::always(MailerStep::Hang, 1);
    let (consumer, _) = consumer_with(mailer.clone(), settings(5, Duration::from_secs(600)));
    let pool = DispatchPool::new(consumer, 1, Duration::from_secs(5));

    let (sender, receiver) = mpsc::channel(8);
    let log = Arc::new(Mutex::new(Vec::new()));

    let ticket = ticket("a@x.com", chrono::Duration::hours(2));
    let envelope = EventEnvelope::new(BINDING_KEY, &ticket.notification(NotificationKind::Reminder))?;
    sender
        .send(LoopbackSettlement::detached(&envelope, &log))
        .await
        .map_err(|_| anyhow!("dispatch queue closed"))?;
    drop(sender);

    let stats = pool.run(receiver).await;

    assert_eq!(stats.abandoned, 1);
    assert!(log.lock().unwrap().is_empty(), "Abandoned delivery must stay unsettled");

    Ok(())
}
