//! Object store adapters used by the replication worker.
//!
//! Submodules:
//! - `client`: the `ObjectBackend` trait shared by all backends
//! - `localfs`: directory-backed store, for tests and single-host setups
//! - `s3`: S3-compatible store built on aws-sdk-s3
pub mod client;
pub mod localfs;
pub mod s3;

pub use client::{BackendResult, ObjectBackend};
pub use localfs::LocalFsBackend;
pub use s3::{S3Backend, S3Config};
