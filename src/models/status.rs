use std::fmt::{Display, Formatter, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyStatus {
    NotFound,
    Processing,
    Sent,
    Failed,
}

impl IdempotencyStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(IdempotencyStatus::Processing),
            "sent" => Some(IdempotencyStatus::Sent),
            "failed" => Some(IdempotencyStatus::Failed),
            _ => None,
        }
    }
}

impl Display for IdempotencyStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            IdempotencyStatus::NotFound => write!(f, "not_found"),
            IdempotencyStatus::Processing => write!(f, "processing"),
            IdempotencyStatus::Sent => write!(f, "sent"),
            IdempotencyStatus::Failed => write!(f, "failed"),
        }
    }
}
