//! Artifact fetching and process supervision

pub mod fetcher;
pub mod fsm;
pub mod git;
pub mod identity;
pub mod release;
pub mod supervisor;
