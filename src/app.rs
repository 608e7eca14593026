use std::sync::Arc;

use anyhow::{Context, Error, Result, anyhow};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::{
    api::{AppState, run_api_server},
    clients::{
        email::{DeliveryCapability, SmtpMailer},
        health::HealthChecker,
        idempotency::{IdempotencyStore, InMemoryIdempotencyStore},
        rbmq::{BrokerChannel, EventBus, PumpExit, SubscriptionBinding},
        redis::RedisIdempotencyStore,
        store::{InMemoryTicketStore, TicketStore},
    },
    config::Config,
    error::BrokerError,
    services::{
        consumer::{ConsumerSettings, NotificationConsumer},
        dispatch::{DispatchPool, Inbound},
        publisher::TicketPublisher,
        reminder::{ReminderRoute, ReminderRouteKind, ReminderSweep},
        scheduler::ReminderScheduler,
    },
};

/// Runs the service until SIGINT/SIGTERM, or until the broker cannot be
/// reached after the configured reconnect attempts.
pub async fn run(config: Config) -> Result<(), Error> {
    let broker = Arc::new(
        BrokerChannel::connect_with_backoff(&config)
            .await
            .context("RabbitMQ unreachable after reconnect attempts")?,
    );

    let idempotency = idempotency_store(&config).await;
    let mailer: Arc<dyn DeliveryCapability> = Arc::new(SmtpMailer::new(&config)?);
    let store: Arc<dyn TicketStore> = Arc::new(InMemoryTicketStore::new());

    let consumer = Arc::new(NotificationConsumer::new(
        mailer,
        Arc::clone(&idempotency),
        ConsumerSettings::from_config(&config),
    ));

    let bus: Arc<dyn EventBus> = broker.clone();
    let publisher = TicketPublisher::new(
        Arc::clone(&bus),
        config.reminder_binding_key.clone(),
        config.publish_retry_config(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = DispatchPool::new(
        Arc::clone(&consumer),
        config.worker_concurrency,
        config.shutdown_grace(),
    );
    let (sender, receiver) = mpsc::channel(pool.queue_capacity());
    let pool_task = tokio::spawn(pool.run(receiver));
    let mut consume_task = tokio::spawn(consume(
        Arc::clone(&broker),
        SubscriptionBinding::reminders(&config),
        sender,
        shutdown_rx.clone(),
    ));

    let route = match config.reminder_route {
        ReminderRouteKind::Publish => ReminderRoute::Broker(publisher.clone()),
        ReminderRouteKind::Direct => ReminderRoute::Direct {
            consumer: Arc::clone(&consumer),
            routing_key: config.reminder_binding_key.clone(),
        },
    };
    let sweep = Arc::new(ReminderSweep::new(
        Arc::clone(&store),
        route,
        config.reminder_after(),
    ));
    let scheduler = ReminderScheduler::new(config.scheduler_interval(), config.overlap_policy(), sweep)
        .with_shutdown_grace(config.shutdown_grace())
        .start();

    let state = Arc::new(AppState {
        health_checker: HealthChecker::new(bus, Arc::clone(&idempotency)),
        store,
        publisher,
    });
    let mut api_shutdown = shutdown_rx.clone();
    let mut api_task = tokio::spawn(run_api_server(config.port, state, async move {
        let _ = api_shutdown.wait_for(|stop| *stop).await;
    }));

    info!("Ticket notifier running");

    let failure = tokio::select! {
        _ = shutdown_signal() => None,
        joined = &mut consume_task => match joined {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(anyhow!(e).context("Notification consumer stopped")),
            Err(e) => Some(anyhow!("Notification consumer task failed: {}", e)),
        },
        joined = &mut api_task => match joined {
            Ok(Ok(())) => Some(anyhow!("HTTP server exited unexpectedly")),
            Ok(Err(e)) => Some(anyhow!(e).context("HTTP server failed")),
            Err(e) => Some(anyhow!("HTTP server task failed: {}", e)),
        },
    };

    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    if !consume_task.is_finished() {
        let _ = consume_task.await;
    }

    match pool_task.await {
        Ok(stats) => info!(
            handled = stats.handled,
            abandoned = stats.abandoned,
            "Consumer drained"
        ),
        Err(e) => error!(error = %e, "Dispatch pool task failed"),
    }

    let scheduler_stats = scheduler.stop().await;
    info!(
        fired = scheduler_stats.fired,
        skipped = scheduler_stats.skipped,
        failed = scheduler_stats.failed,
        "Reminder scheduler stopped"
    );

    if !api_task.is_finished() {
        let _ = api_task.await;
    }

    broker.close().await;

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn idempotency_store(config: &Config) -> Arc<dyn IdempotencyStore> {
    if let Some(redis_url) = &config.redis_url {
        match RedisIdempotencyStore::connect(
            redis_url,
            config.idempotency_ttl_seconds,
            config.publish_retry_config(),
        )
        .await
        {
            Ok(store) => return Arc::new(store),
            Err(e) => warn!(error = %e, "Redis unavailable, using in-memory idempotency store"),
        }
    }

    Arc::new(InMemoryIdempotencyStore::new(std::time::Duration::from_secs(
        config.idempotency_ttl_seconds,
    )))
}

/// Keeps the reminder queue subscribed, replacing the broker connection
/// whenever the consumer stream dies.
async fn consume(
    broker: Arc<BrokerChannel>,
    binding: SubscriptionBinding,
    sender: mpsc::Sender<Inbound>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), BrokerError> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let consumer = match broker.subscribe(&binding).await {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!(error = %e, "Subscribe failed, reconnecting");
                broker.reconnect().await?;
                continue;
            }
        };

        match broker
            .pump(&binding, consumer, sender.clone(), shutdown.clone())
            .await
        {
            PumpExit::Shutdown => return Ok(()),
            PumpExit::Disconnected => {
                warn!("Broker consumer disconnected, reconnecting");
                broker.reconnect().await?;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
