//! Error types for the artifact transfer engine

use thiserror::Error;

/// Result type alias for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

/// Error types that can occur while transferring artifacts
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    /// The transfer was cancelled externally
    #[error("Transfer was interrupted")]
    Interrupted,

    #[error("Unexpected HTTP status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// Transport-level failure (connect, read, write)
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Received {actual} bytes, expected {expected}")]
    ByteCountMismatch { expected: u64, actual: u64 },

    #[error("Status {status} requires a redirect, but no Location header was provided")]
    MissingLocation { status: u16 },

    #[error("Maximum number of redirects ({max}) exceeded")]
    TooManyRedirects { max: usize },

    #[error("Unknown layout strategy: {0}")]
    UnknownLayout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid byte range: {0}")]
    InvalidRange(String),

    #[error("Response does not contain an ETag header")]
    MissingEtag,

    #[error("Consistency check failed: stored digest {actual} does not match local digest {expected}")]
    DigestMismatch { expected: String, actual: String },

    #[error("No presigned URL issued for object key {0}")]
    UrlNotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// Transfer-level context: the first failed part with its byte range
    #[error("Transfer failed in part {part_number} (bytes {start}-{end}): {message}")]
    PartFailed {
        part_number: u32,
        start: u64,
        end: u64,
        message: String,
    },
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        TransferError::Transport(err.to_string())
    }
}

impl TransferError {
    /// Determine whether the operation that produced this error may be retried.
    ///
    /// Recoverable: interruption (the caller decides whether to resume),
    /// HTTP 408, 404 and 5xx responses, and transport and IO failures. A
    /// byte-count mismatch against the advertised length is fatal: the
    /// server is misbehaving, not flaky.
    ///
    /// 404 is retryable on purpose: while the storage-facing endpoint is
    /// being redeployed there is a short window during which a still-valid
    /// resource answers 404. The retry count bounds how long we tolerate it.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransferError::Interrupted => true,
            TransferError::HttpStatus { status, .. } => Self::is_recoverable_status(*status),
            TransferError::Transport(_) => true,
            TransferError::Io(_) => true,

            TransferError::ByteCountMismatch { .. } => false,
            TransferError::MissingLocation { .. } => false,
            TransferError::TooManyRedirects { .. } => false,
            TransferError::UnknownLayout(_) => false,
            TransferError::Config(_) => false,
            TransferError::InvalidRange(_) => false,
            TransferError::MissingEtag => false,
            TransferError::DigestMismatch { .. } => false,
            TransferError::UrlNotFound(_) => false,
            TransferError::Parse(_) => false,
            TransferError::PartFailed { .. } => false,
        }
    }

    /// Recoverable response statuses: timeouts, 5xx and the redeploy-window 404
    pub fn is_recoverable_status(status: u16) -> bool {
        matches!(status, 408 | 404) || (500..600).contains(&status)
    }

    /// True when this is an HTTP 403 whose message signals an expired
    /// presigned URL. Such failures are retried with a doubled URL TTL.
    pub fn is_url_expired(&self) -> bool {
        match self {
            TransferError::HttpStatus { status: 403, message } => {
                message.to_ascii_lowercase().contains("expired")
            }
            _ => false,
        }
    }

    /// True for "broken pipe"-style transport failures. The store closes the
    /// connection mid-body when the presigned link is already stale, so
    /// retrying the same URL is pointless.
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            TransferError::Transport(message) | TransferError::Io(message) => {
                message.to_ascii_lowercase().contains("broken pipe")
            }
            _ => false,
        }
    }

    /// Create an error from an unexpected HTTP status code
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        TransferError::HttpStatus {
            status,
            message: message.into(),
        }
    }

    /// Check a response status against the expected one, classifying the
    /// failure through the recoverable/fatal table
    pub fn check_status(status: u16, expected: u16) -> Result<()> {
        if status == expected {
            return Ok(());
        }
        Err(TransferError::from_http_status(
            status,
            format!("expected status {}", expected),
        ))
    }
}

/// Terminal upload failure with an explicit recoverability flag.
///
/// `recoverable` tells the caller whether restarting the whole file upload
/// later may succeed; it is distinct from the per-attempt retries that
/// already happened inside the coordinator.
#[derive(Error, Debug, Clone)]
#[error("Upload failed ({}): {error}", if *.recoverable { "recoverable" } else { "not recoverable" })]
pub struct UploadError {
    pub recoverable: bool,
    #[source]
    pub error: TransferError,
}

impl UploadError {
    pub fn new(recoverable: bool, error: TransferError) -> Self {
        UploadError { recoverable, error }
    }

    pub fn from_error(error: TransferError) -> Self {
        let recoverable = error.is_recoverable() && !error.is_broken_pipe();
        UploadError { recoverable, error }
    }
}
