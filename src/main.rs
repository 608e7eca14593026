use anyhow::{Error, Result};
use ticket_notifier::{app, config::Config, utils::init_tracing};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;

    init_tracing();

    info!(
        exchange = %config.exchange_name,
        queue = %config.reminder_queue_name,
        "Configuration validated"
    );

    app::run(config).await
}
