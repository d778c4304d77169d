//! Error types for the capture core

use std::time::Duration;

use thiserror::Error;

/// Main error type for capture operations
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Caller violated a precondition (unknown monitor id, out-of-range rate)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation requires a running session
    #[error("session is not running")]
    NotRunning,

    /// The rate limiter withheld a frame
    #[error("throttled, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    /// Recoverable acquisition failure, retry permitted
    #[error("transient capture failure: {0}")]
    Transient(String),

    /// Device lost, display disconnected or permission revoked
    #[error("fatal capture failure: {0}")]
    Fatal(String),

    /// A requested optional feature is unavailable on this platform
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Wrapped platform errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Discriminant of [`CaptureError`], for callers that match on kind only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotRunning,
    Throttled,
    Transient,
    Fatal,
    Unsupported,
    Other,
}

/// Combined result type for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;

impl CaptureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            CaptureError::NotRunning => ErrorKind::NotRunning,
            CaptureError::Throttled { .. } => ErrorKind::Throttled,
            CaptureError::Transient(_) => ErrorKind::Transient,
            CaptureError::Fatal(_) => ErrorKind::Fatal,
            CaptureError::Unsupported(_) => ErrorKind::Unsupported,
            CaptureError::Other(_) => ErrorKind::Other,
        }
    }

    /// Check if the error is worth retrying on the same session
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptureError::Throttled { .. } | CaptureError::Transient(_)
        )
    }

    /// Check if the session must be reconfigured before the next attempt
    pub fn requires_reopen(&self) -> bool {
        matches!(self, CaptureError::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CaptureError::InvalidArgument("fps out of range".to_string());
        assert_eq!(err.to_string(), "invalid argument: fps out of range");

        let err = CaptureError::NotRunning;
        assert_eq!(err.to_string(), "session is not running");
    }

    #[test]
    fn test_is_retryable() {
        let throttled = CaptureError::Throttled {
            retry_after: Duration::from_millis(5),
        };
        assert!(throttled.is_retryable());

        let transient = CaptureError::Transient("timeout".to_string());
        assert!(transient.is_retryable());

        let fatal = CaptureError::Fatal("device lost".to_string());
        assert!(!fatal.is_retryable());
        assert!(fatal.requires_reopen());
    }

    #[test]
    fn test_kind() {
        assert_eq!(
            CaptureError::Unsupported("damage".to_string()).kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(CaptureError::NotRunning.kind(), ErrorKind::NotRunning);
    }
}
