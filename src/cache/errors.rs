//! Cache Error Types
//!
//! Local failures of the cache engine, mapped to errno values for FUSE replies.

use crate::api::ApiError;

/// Hashing and digest codec errors
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("I/O error while hashing: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid hasher state: {0}")]
    InvalidState(&'static str),

    #[error("Invalid digest: {0}")]
    InvalidArgument(String),
}

/// Integrity verification failures
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("I/O error during verification: {0}")]
    Io(#[from] std::io::Error),

    #[error("Size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Hash mismatch: expected {expected}, found {actual}")]
    HashMismatch { expected: String, actual: String },
}

impl From<HashError> for IntegrityError {
    fn from(err: HashError) -> Self {
        match err {
            HashError::Io(e) => IntegrityError::Io(e),
            other => IntegrityError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                other.to_string(),
            )),
        }
    }
}

/// File cache engine errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Download failed: {0}")]
    DownloadFailed(#[source] ApiError),

    #[error("Integrity check failed: {0}")]
    IntegrityFailed(#[from] IntegrityError),

    #[error("Revision conflict on {quick_key}: edit based on {base_revision}, remote is at {remote_revision}")]
    RevisionConflict {
        quick_key: String,
        base_revision: u64,
        remote_revision: u64,
    },

    #[error("Remote call failed: {0}")]
    Remote(#[source] ApiError),
}

impl From<HashError> for CacheError {
    fn from(err: HashError) -> Self {
        match err {
            HashError::Io(e) => CacheError::Io(e),
            other => CacheError::InvalidArgument(other.to_string()),
        }
    }
}

impl CacheError {
    /// Map cache error to an appropriate libc errno
    pub fn to_errno(&self) -> i32 {
        match self {
            CacheError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            CacheError::InvalidArgument(_) => libc::EINVAL,
            CacheError::DownloadFailed(e) => e.to_errno(),
            CacheError::IntegrityFailed(_) => libc::EIO,
            CacheError::RevisionConflict { .. } => libc::ESTALE,
            CacheError::Remote(e) => e.to_errno(),
        }
    }

    /// Integer status for the dispatch layer: always negative
    pub fn status(&self) -> i32 {
        -self.to_errno()
    }
}

/// Collapse an engine result into the dispatch layer's status code
pub fn status_of<T>(result: &Result<T, CacheError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status(),
    }
}
