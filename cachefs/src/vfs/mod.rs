//! Filesystem core, independent of the FUSE wire layer.
//!
//! Submodules:
//! - `path`: virtual path to backing path translation
//! - `attr`: attribute snapshots taken from backing files
//! - `cache`: the least-frequently-used whole-file cache
//! - `handles`: open file handles keyed by numeric id
//! - `fs`: the dispatcher tying the above to the metadata store
pub mod attr;
pub mod cache;
pub mod fs;
pub mod handles;
pub mod path;
