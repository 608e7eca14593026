pub mod envelope;
pub mod health;
pub mod outcome;
pub mod response;
pub mod retry;
pub mod status;
pub mod ticket;
pub mod validation;
