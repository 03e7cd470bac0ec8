use std::io;

use thiserror::Error;

/// Failures surfaced to callers of the file-operation layer.
///
/// Soft failures (cache population, metadata notifications) never show up
/// here; they are logged and absorbed by the dispatcher.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown file handle {0}")]
    BadHandle(u64),

    #[error("IO error: {0}")]
    Io(io::Error),
}

impl FsError {
    /// errno reported to the kernel for this failure.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::PermissionDenied(_) => libc::EACCES,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::BadHandle(_) => libc::EBADF,
            Self::Io(e) => match e.raw_os_error() {
                Some(code) => code,
                None => libc::EIO,
            },
        }
    }

    /// Classify an io error raised while operating on `path`.
    pub fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            io::ErrorKind::InvalidInput => Self::InvalidArgument(format!("{path}: {err}")),
            _ => Self::Io(err),
        }
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            io::ErrorKind::InvalidInput => Self::InvalidArgument(err.to_string()),
            _ => Self::Io(err),
        }
    }
}

impl From<nix::errno::Errno> for FsError {
    fn from(errno: nix::errno::Errno) -> Self {
        io::Error::from(errno).into()
    }
}

impl From<FsError> for rfuse3::Errno {
    fn from(err: FsError) -> Self {
        err.errno().into()
    }
}

/// Failures of the metadata store.
#[derive(Error, Debug)]
pub enum MetaError {
    #[error("{0} not found in metadata store")]
    NotFound(String),

    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Failures of the encryption filter.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("ciphertext shorter than the initialization vector ({0} bytes)")]
    Truncated(usize),

    #[error("ciphertext padding is invalid")]
    Padding,
}

/// Failures of the replication path (upload, download, restore).
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("content of {0} does not match its object key")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("object store error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Meta(#[from] MetaError),
}

pub type FsResult<T> = std::result::Result<T, FsError>;
pub type MetaResult<T> = std::result::Result<T, MetaError>;
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified_by_kind() {
        let e = FsError::from_io(io::Error::from(io::ErrorKind::NotFound), "/a");
        assert!(matches!(e, FsError::NotFound(ref p) if p == "/a"));
        assert_eq!(e.errno(), libc::ENOENT);

        let e = FsError::from(io::Error::from_raw_os_error(libc::EACCES));
        assert!(matches!(e, FsError::PermissionDenied(_)));

        let e = FsError::from(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(e.errno(), libc::ENOSPC);
    }
}
