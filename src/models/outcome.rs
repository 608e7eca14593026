use std::fmt::{Display, Formatter, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Nack { requeue: bool },
}

impl Outcome {
    pub fn dead_letter() -> Self {
        Outcome::Nack { requeue: false }
    }

    pub fn retry() -> Self {
        Outcome::Nack { requeue: true }
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Outcome::Ack => write!(f, "ack"),
            Outcome::Nack { requeue: true } => write!(f, "requeue"),
            Outcome::Nack { requeue: false } => write!(f, "dead_letter"),
        }
    }
}

/// Outcome of handling one delivery, with the failure that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub outcome: Outcome,
    pub failure: Option<String>,
}

impl Verdict {
    pub fn ack() -> Self {
        Self {
            outcome: Outcome::Ack,
            failure: None,
        }
    }

    pub fn nack(outcome: Outcome, failure: String) -> Self {
        Self {
            outcome,
            failure: Some(failure),
        }
    }
}
