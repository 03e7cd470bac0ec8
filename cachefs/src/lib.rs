//! cachefs: a passthrough FUSE filesystem over a backing directory.
//!
//! Reads of regular files are served from a bounded, frequency-ranked cache
//! of whole-file copies. Every mutation is reported to a metadata store,
//! and a background worker replicates dirty files to an object store.

pub mod cadapter;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod error;
pub mod fuse;
pub mod meta;
pub mod sync;
pub mod vfs;
