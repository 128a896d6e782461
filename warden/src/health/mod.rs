//! Health probing of the supervised service

pub mod prober;
