use thiserror::Error;

/// Application-wide error types for Hearth.
#[derive(Error, Debug)]
pub enum AppError {
    /// The remote answered with a non-200 status.
    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// Request could not be built or the body could not be read.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Every attempt of a fetch failed with a retryable error.
    #[error("failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<AppError> },

    /// The run was cancelled or its deadline passed.
    #[error("operation cancelled")]
    Cancelled,

    /// A canonical record is missing a mandatory field.
    #[error("{field}: {message}")]
    Validation {
        field: &'static str,
        message: &'static str,
    },

    /// Proxy address is malformed or uses an unsupported protocol.
    #[error("Invalid proxy: {0}")]
    InvalidProxy(String),

    /// The proxy pool is empty.
    #[error("no proxies available")]
    NoProxies,

    /// The proxy pool has endpoints, but none of them is working.
    #[error("no working proxies available")]
    NoWorkingProxies,

    /// Circuit controller (anonymity network) failure.
    #[error("Circuit error: {0}")]
    CircuitError(String),

    /// Source payload could not be decoded.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// One or more sources failed during an orchestrated run.
    #[error("{} of {total} sources failed: {}", .failed.len(), .failed.join(", "))]
    SourcesFailed { failed: Vec<String>, total: usize },

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    ///
    /// HTTP 429 and 5xx are retryable, every other status is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Returns true if this error stems from cancellation, directly or as the
    /// last failure of an exhausted fetch.
    pub fn is_cancellation(&self) -> bool {
        match self {
            AppError::Cancelled => true,
            AppError::RetriesExhausted { last, .. } => last.is_cancellation(),
            _ => false,
        }
    }
}
