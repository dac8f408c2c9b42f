//! Error types for token source operations

use std::time::Duration;

use credential::Credential;

/// Errors from refreshing, caching or background-refreshing credentials.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("token refresh failed: {0}")]
    RefreshFailed(#[source] credential::Error),

    #[error("token refresh timed out after {0:?}")]
    RefreshTimeout(Duration),

    #[error("refresh response carried no access token")]
    MissingAccessToken,

    #[error("token source creation failed: {0}")]
    CacheCreationFailed(#[source] credential::Error),

    #[error("background refresh gave up after {failures} consecutive failures")]
    GaveUp { failures: u32 },

    #[error("invalid authorization header: {0}")]
    InvalidHeader(String),
}

impl From<credential::Error> for Error {
    fn from(err: credential::Error) -> Self {
        match err {
            credential::Error::MissingAccessToken => Error::MissingAccessToken,
            other => Error::RefreshFailed(other),
        }
    }
}

/// Result alias for token source operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A failed `token()` call.
///
/// Carries the last credential the source held next to the error. It may
/// already be expired; callers decide whether a soon-to-expire token is
/// still worth trying while the vendor is unreachable, but they cannot get
/// at it without handling the error first.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct TokenError {
    stale: Credential,
    error: Error,
}

impl TokenError {
    pub fn new(stale: Credential, error: Error) -> Self {
        Self { stale, error }
    }

    /// Last credential held before the failed refresh.
    pub fn stale(&self) -> &Credential {
        &self.stale
    }

    pub fn error(&self) -> &Error {
        &self.error
    }

    pub fn into_parts(self) -> (Credential, Error) {
        (self.stale, self.error)
    }
}

impl From<TokenError> for Error {
    fn from(err: TokenError) -> Self {
        err.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_access_token_keeps_its_own_variant() {
        let err: Error = credential::Error::MissingAccessToken.into();
        assert!(matches!(err, Error::MissingAccessToken));
    }

    #[test]
    fn vendor_errors_become_refresh_failed() {
        let err: Error = credential::Error::Http("connection reset".into()).into();
        assert!(matches!(err, Error::RefreshFailed(_)));
        assert_eq!(
            err.to_string(),
            "token refresh failed: HTTP request failed: connection reset"
        );
    }

    #[test]
    fn token_error_displays_inner_error_and_keeps_stale() {
        let stale = Credential::new("at_old", "rt", 1);
        let err = TokenError::new(stale.clone(), Error::RefreshTimeout(Duration::from_secs(30)));
        assert_eq!(err.to_string(), "token refresh timed out after 30s");
        assert_eq!(err.stale(), &stale);

        let (credential, inner) = err.into_parts();
        assert_eq!(credential.access_token, "at_old");
        assert!(matches!(inner, Error::RefreshTimeout(_)));
    }

    #[test]
    fn gave_up_names_failure_count() {
        let err = Error::GaveUp { failures: 6 };
        assert!(err.to_string().contains("6 consecutive failures"));
    }
}
