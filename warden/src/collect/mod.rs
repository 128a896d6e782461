//! Log collection

pub mod aggregator;
pub mod source;
pub mod store;
