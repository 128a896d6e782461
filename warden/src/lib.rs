//! Warden
//!
//! Single-service deployment controller: fetches or builds an artifact,
//! supervises the resulting process, checks its health and collects its logs.

pub mod app;
pub mod collect;
pub mod control;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod health;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod utils;
pub mod workers;
