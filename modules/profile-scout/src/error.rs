//! Typed errors for profile lookups.
//!
//! `ScoutError` is `Clone` because a single in-flight fetch result is handed
//! to every caller waiting on the same account.

use thiserror::Error;

/// Result type alias for profile lookups.
pub type Result<T> = std::result::Result<T, ScoutError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScoutError {
    /// Handle is empty or contains characters the platform does not allow
    #[error("invalid account handle: {0}")]
    InvalidAccount(String),

    /// Every configured proxy is blocked
    #[error("no proxy available: all endpoints are blocked")]
    NoAvailableProxy,

    /// Login failed (bad credentials, challenge, browser failure)
    #[error("session acquisition failed: {0}")]
    SessionAcquisition(String),

    /// Timeout, refused connection or upstream rate limit, after the retry cap
    #[error("transient fetch failure: {0}")]
    TransientFetch(String),

    /// Account does not exist or content is permanently inaccessible
    #[error("permanent fetch failure: {0}")]
    PermanentFetch(String),

    /// Storage layer failure
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// The caller stopped waiting; the underlying fetch keeps running
    #[error("timed out waiting for in-flight fetch of {0}")]
    WaitTimedOut(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ScoutError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScoutError::TransientFetch(_))
    }

    /// HTTP status the API layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            ScoutError::InvalidAccount(_) => 400,
            ScoutError::PermanentFetch(_) => 404,
            ScoutError::TransientFetch(_) => 502,
            ScoutError::NoAvailableProxy | ScoutError::SessionAcquisition(_) => 503,
            ScoutError::WaitTimedOut(_) => 504,
            ScoutError::CacheUnavailable(_) | ScoutError::Internal(_) => 500,
        }
    }
}

impl From<std::io::Error> for ScoutError {
    fn from(err: std::io::Error) -> Self {
        ScoutError::CacheUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for ScoutError {
    fn from(err: serde_json::Error) -> Self {
        ScoutError::CacheUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(ScoutError::TransientFetch("timeout".into()).is_retryable());
        assert!(!ScoutError::PermanentFetch("gone".into()).is_retryable());
        assert!(!ScoutError::NoAvailableProxy.is_retryable());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ScoutError::NoAvailableProxy.http_status(), 503);
        assert_eq!(ScoutError::PermanentFetch("x".into()).http_status(), 404);
        assert_eq!(ScoutError::InvalidAccount("".into()).http_status(), 400);
    }
}
