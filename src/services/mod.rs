pub mod consumer;
pub mod dispatch;
pub mod publisher;
pub mod reminder;
pub mod scheduler;
