//! Error types for the streaming engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Streaming engine error types
#[derive(Error, Debug)]
pub enum Error {
    // Network errors
    #[error("network error (status {status})")]
    Network { status: u16, transient: bool },

    #[error("request timed out")]
    Timeout,

    #[error("circuit breaker is open")]
    CircuitOpen,

    // Endpoint errors
    #[error("no healthy endpoint available")]
    NoEndpointAvailable,

    #[error("endpoint probe failed: {0}")]
    ProbeFailed(String),

    // Playback errors
    #[error("playback stalled at {position}s")]
    BufferStall { position: f64 },

    #[error("fatal playback error: {0}")]
    FatalPlayback(String),

    // Lifecycle errors
    #[error("operation cancelled")]
    Cancelled,

    // Configuration errors
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify an HTTP status into the network-error taxonomy.
    ///
    /// Status 0 (no response / connection reset) and 5xx are transient;
    /// 4xx is a caller error and must not be retried.
    pub fn from_status(status: u16) -> Self {
        Error::Network {
            status,
            transient: status == 0 || status >= 500,
        }
    }

    /// Returns true if this error may resolve on retry
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network { transient, .. } => *transient,
            Error::Timeout => true,
            Error::BufferStall { .. } => true,
            Error::ProbeFailed(_) => true,
            _ => false,
        }
    }

    /// Returns the error code for telemetry
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Network { .. } => "NETWORK",
            Error::Timeout => "TIMEOUT",
            Error::CircuitOpen => "CIRCUIT_OPEN",
            Error::NoEndpointAvailable => "NO_ENDPOINT",
            Error::ProbeFailed(_) => "PROBE_FAILED",
            Error::BufferStall { .. } => "BUFFER_STALL",
            Error::FatalPlayback(_) => "FATAL_PLAYBACK",
            Error::Cancelled => "CANCELLED",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Internal(_) => "INTERNAL",
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Error::Timeout;
        }
        let status = err.status().map(|s| s.as_u16()).unwrap_or(0);
        Error::from_status(status)
    }
}
