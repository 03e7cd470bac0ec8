//! Background tasks that run alongside the mounted filesystem.
//!
//! Submodules:
//! - `worker`: the replication loop that drains the dirty set
pub mod worker;

pub use worker::{BatchReport, SyncWorker};
