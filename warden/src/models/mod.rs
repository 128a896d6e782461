//! Data model

pub mod artifact;
pub mod event;
pub mod log_entry;
pub mod status;
