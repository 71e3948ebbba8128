//! Remote API Error Types
//!
//! Structured error handling for remote API operations.
//! Classifies failures for the retry wrapper and maps them to errno values.

/// API error code for an invalid or expired session token
pub const ERROR_INVALID_SESSION_TOKEN: u32 = 105;

/// API error code for a signature the server did not expect
pub const ERROR_INVALID_SIGNATURE: u32 = 127;

/// How the retry wrapper treats a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Transport timed out; the server may or may not have seen the call
    TransportTimeout,
    /// Server rejected the token or signature
    TokenError,
    /// Anything else; not retried
    OtherFailure,
}

/// Remote API error types
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Request timeout")]
    Timeout,

    #[error("Session token rejected (code {0})")]
    TokenRejected(u32),

    #[error("Token refresh failed: {0}")]
    TokenRefresh(#[source] Box<ApiError>),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {0}: {1}")]
    Http(u16, String),

    #[error("API error {code}: {message}")]
    Api { code: u32, message: String },

    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("Revision conflict: edit based on {base_revision}, remote is at {remote_revision}")]
    RevisionConflict {
        base_revision: u64,
        remote_revision: u64,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cannot sign request: {0}")]
    Signing(String),

    #[error("Local IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// Map API error to an appropriate libc errno
    pub fn to_errno(&self) -> i32 {
        match self {
            ApiError::Timeout => libc::ETIMEDOUT,
            ApiError::TokenRejected(_) => libc::EACCES,
            ApiError::TokenRefresh(_) => libc::EACCES,
            ApiError::Network(_) => libc::EIO,
            ApiError::Http(404, _) => libc::ENOENT,
            ApiError::Http(_, _) => libc::EIO,
            ApiError::Api { .. } => libc::EIO,
            ApiError::Decode(_) => libc::EIO,
            ApiError::RevisionConflict { .. } => libc::ESTALE,
            ApiError::InvalidArgument(_) => libc::EINVAL,
            ApiError::Signing(_) => libc::EIO,
            ApiError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Classify this error for the retry wrapper
    pub fn retry_class(&self) -> RetryClass {
        match self {
            ApiError::Timeout => RetryClass::TransportTimeout,
            ApiError::TokenRejected(_) => RetryClass::TokenError,
            _ => RetryClass::OtherFailure,
        }
    }

    /// Create an ApiError from an API error code and message
    pub fn from_code(code: u32, message: &str) -> Self {
        match code {
            ERROR_INVALID_SESSION_TOKEN | ERROR_INVALID_SIGNATURE => ApiError::TokenRejected(code),
            _ => ApiError::Api {
                code,
                message: message.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::Http(status.as_u16(), err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}
