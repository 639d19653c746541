// The page-fetch boundary. Implementations load a profile through a headless
// browser (see `browser.rs`); the core decides what their failures mean.

use async_trait::async_trait;
use thiserror::Error;

use crate::account::Account;
use crate::proxy_pool::ProxyEndpoint;
use crate::session::{Credentials, Session};
use crate::types::RawProfile;

/// Raw failure from the fetch collaborator, before classification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("upstream answered {status}: {message}")]
    Status { status: u16, message: String },

    /// Login wall, checkpoint or captcha instead of the requested page
    #[error("challenge: {0}")]
    Challenge(String),

    /// Page loaded but carried no profile data
    #[error("incomplete page: {0}")]
    Incomplete(String),

    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Whether the failure points at the network path rather than the request.
    pub fn is_network(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Connect(_) => true,
            FetchError::Status { status, .. } => *status == 407 || *status == 429,
            _ => false,
        }
    }
}

#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    /// Load one profile snapshot through `proxy` (direct when `None`) using `session`.
    async fn fetch_snapshot(
        &self,
        account: &Account,
        proxy: Option<&ProxyEndpoint>,
        session: &Session,
    ) -> Result<RawProfile, FetchError>;

    /// Log in and return the resulting authenticated session.
    async fn login(
        &self,
        credentials: &Credentials,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Session, FetchError>;
}

/// Result of one attempt, as seen by the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success(RawProfile),
    /// Try again with another proxy.
    Retryable(String),
    /// Upstream refused the authenticated session; drop it and try again.
    SessionRejected(String),
    /// Retrying cannot help.
    Fatal(String),
}

pub fn classify(result: Result<RawProfile, FetchError>, authenticated: bool) -> AttemptOutcome {
    let err = match result {
        Ok(raw) if raw.is_empty() => {
            return AttemptOutcome::Retryable("page yielded no profile fields".into())
        }
        Ok(raw) => return AttemptOutcome::Success(raw),
        Err(err) => err,
    };

    let reason = err.to_string();
    match err {
        FetchError::Timeout(_)
        | FetchError::Connect(_)
        | FetchError::Incomplete(_)
        | FetchError::Other(_) => AttemptOutcome::Retryable(reason),
        FetchError::Challenge(_) if authenticated => AttemptOutcome::SessionRejected(reason),
        FetchError::Challenge(_) => AttemptOutcome::Retryable(reason),
        FetchError::Status { status, .. } => match status {
            404 | 410 | 451 => AttemptOutcome::Fatal(reason),
            401 | 403 if authenticated => AttemptOutcome::SessionRejected(reason),
            _ => AttemptOutcome::Retryable(reason),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> Result<RawProfile, FetchError> {
        Err(FetchError::Status {
            status: code,
            message: String::new(),
        })
    }

    #[test]
    fn success_passes_profile_through() {
        let raw = RawProfile {
            followers: Some(10),
            ..Default::default()
        };
        assert_eq!(classify(Ok(raw.clone()), false), AttemptOutcome::Success(raw));
    }

    #[test]
    fn empty_profile_is_retryable() {
        assert!(matches!(
            classify(Ok(RawProfile::default()), false),
            AttemptOutcome::Retryable(_)
        ));
    }

    #[test]
    fn network_failures_are_retryable() {
        for err in [
            FetchError::Timeout("30s".into()),
            FetchError::Connect("refused".into()),
            FetchError::Incomplete("no data".into()),
        ] {
            assert!(matches!(classify(Err(err), false), AttemptOutcome::Retryable(_)));
        }
        assert!(matches!(classify(status(429), false), AttemptOutcome::Retryable(_)));
        assert!(matches!(classify(status(503), true), AttemptOutcome::Retryable(_)));
    }

    #[test]
    fn not_found_is_fatal() {
        assert!(matches!(classify(status(404), false), AttemptOutcome::Fatal(_)));
        assert!(matches!(classify(status(451), true), AttemptOutcome::Fatal(_)));
    }

    #[test]
    fn auth_failures_reject_only_real_sessions() {
        assert!(matches!(classify(status(401), true), AttemptOutcome::SessionRejected(_)));
        assert!(matches!(classify(status(403), false), AttemptOutcome::Retryable(_)));
        assert!(matches!(
            classify(Err(FetchError::Challenge("login".into())), true),
            AttemptOutcome::SessionRejected(_)
        ));
    }

    #[test]
    fn network_errors_blame_the_proxy() {
        assert!(FetchError::Timeout("x".into()).is_network());
        assert!(!FetchError::Challenge("x".into()).is_network());
        assert!(!FetchError::Status { status: 404, message: String::new() }.is_network());
    }
}
