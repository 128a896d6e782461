//! Periodic background workers, one per concern

pub mod artifact_check;
pub mod health;
pub mod log_poller;
