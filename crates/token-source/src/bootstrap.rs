//! Token source for vendors without a refresh grant
//!
//! Some vendor APIs only hand out credentials through their full login flow.
//! `BootstrapTokenSource` runs that login on every `token()` call, one at a
//! time. To avoid logging in on every request, use it as the `Refresher` of
//! a `LazyTokenSource`: the lazy source then logs in again only once the held
//! credential has expired.

use std::future::Future;

use credential::{BoxFuture, Credential};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, TokenError};
use crate::refresher::Refresher;
use crate::source::TokenSource;

pub struct BootstrapTokenSource<F> {
    login: F,
    /// Result of the last successful login, returned as stale on failure.
    last: Mutex<Credential>,
}

impl<F, Fut> BootstrapTokenSource<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = credential::Result<Credential>> + Send + 'static,
{
    pub fn new(login: F) -> Self {
        Self {
            login,
            last: Mutex::new(Credential::default()),
        }
    }

    /// Run the full login and return its credential.
    ///
    /// Logins are serialized: a caller arriving while another login is in
    /// flight waits for it, then performs its own.
    pub async fn token(&self) -> Result<Credential, TokenError> {
        let mut last = self.last.lock().await;

        debug!("running full login");
        match (self.login)().await {
            Ok(credential) if credential.access_token.is_empty() => {
                crate::metrics::record_refresh("missing_access_token");
                warn!("login returned no access token");
                Err(TokenError::new(last.clone(), Error::MissingAccessToken))
            }
            Ok(credential) => {
                crate::metrics::record_refresh("success");
                *last = credential.clone();
                Ok(credential)
            }
            Err(e) => {
                crate::metrics::record_refresh("failed");
                warn!(error = %e, "login failed");
                Err(TokenError::new(last.clone(), e.into()))
            }
        }
    }
}

impl<F, Fut> TokenSource for BootstrapTokenSource<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = credential::Result<Credential>> + Send + 'static,
{
    fn token(&self) -> BoxFuture<'_, Result<Credential, TokenError>> {
        Box::pin(BootstrapTokenSource::token(self))
    }
}

/// A login ignores the held credential; renewing means logging in again.
impl<F, Fut> Refresher for BootstrapTokenSource<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = credential::Result<Credential>> + Send + 'static,
{
    fn refresh<'a>(&'a self, _current: &'a Credential) -> BoxFuture<'a, credential::Result<Credential>> {
        Box::pin(async move { (self.login)().await })
    }
}
