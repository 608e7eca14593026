use anyhow::{Result, anyhow};

use crate::models::ticket::NewTicket;

pub fn validate_recipient(address: &str) -> Result<()> {
    let address = address.trim();

    if address.is_empty() {
        return Err(anyhow!("Recipient cannot be empty"));
    }

    if address.len() > 254 {
        return Err(anyhow!("Recipient too long (maximum 254 characters)"));
    }

    let Some((local, domain)) = address.split_once('@') else {
        return Err(anyhow!("Recipient must be an email address"));
    };

    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(anyhow!("Recipient must be an email address"));
    }

    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(anyhow!("Recipient domain is invalid"));
    }

    if address.chars().any(char::is_whitespace) {
        return Err(anyhow!("Recipient contains whitespace"));
    }

    Ok(())
}

pub fn validate_new_ticket(ticket: &NewTicket) -> Result<()> {
    validate_recipient(&ticket.requester_email)?;

    if ticket.subject.trim().is_empty() {
        return Err(anyhow!("Subject cannot be empty"));
    }

    if ticket.subject.len() > 200 {
        return Err(anyhow!("Subject too long (maximum 200 characters)"));
    }

    Ok(())
}
