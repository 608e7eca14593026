use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use tracing::{debug, info};

use crate::{config::Config, error::DeliveryError};

/// Transport that actually delivers a notification.
///
/// Implementations may be slow or fail; callers bound every call with a
/// timeout and treat an elapsed timeout as [`DeliveryError::Transient`].
#[async_trait]
pub trait DeliveryCapability: Send + Sync {
    async fn send(&self, to: &str, from: &str, subject: &str, body: &str)
    -> Result<(), DeliveryError>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let builder = if config.smtp_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| anyhow!("Invalid SMTP relay '{}': {}", config.smtp_host, e))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };

        let mut builder = builder
            .port(config.smtp_port)
            .timeout(Some(Duration::from_secs(config.delivery_timeout_seconds)));

        if let (Some(username), Some(password)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        info!(
            host = %config.smtp_host,
            port = config.smtp_port,
            tls = config.smtp_tls,
            "SMTP mailer initialized"
        );

        Ok(Self {
            transport: builder.build(),
        })
    }

    fn build_message(
        to: &str,
        from: &str,
        subject: &str,
        body: &str,
    ) -> Result<Message, DeliveryError> {
        let from = from
            .parse::<Mailbox>()
            .map_err(|e| DeliveryError::Permanent(format!("Invalid sender '{}': {}", from, e)))?;
        let to = to
            .parse::<Mailbox>()
            .map_err(|e| DeliveryError::Permanent(format!("Invalid recipient '{}': {}", to, e)))?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| DeliveryError::Permanent(format!("Failed to build message: {}", e)))
    }
}

#[async_trait]
impl DeliveryCapability for SmtpMailer {
    async fn send(
        &self,
        to: &str,
        from: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), DeliveryError> {
        let message = Self::build_message(to, from, subject, body)?;

        debug!(to, subject, "Sending email");

        match self.transport.send(message).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_permanent() => {
                Err(DeliveryError::Permanent(format!("SMTP rejected message: {}", e)))
            }
            Err(e) => Err(DeliveryError::Transient(format!("SMTP send failed: {}", e))),
        }
    }
}
