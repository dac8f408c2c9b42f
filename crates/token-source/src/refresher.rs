//! Refresher capability
//!
//! Vendor integrations implement `Refresher` to renew a credential. The core
//! only ever sees this trait, so tests substitute fakes and every vendor
//! login/refresh scheme plugs in the same way.

use std::future::Future;

use credential::{BoxFuture, Credential, OAuth2Endpoint};

/// Renew a credential given the one currently held.
///
/// `current` may be expired and may carry a refresh token or other
/// vendor-specific resumption data in `extra`. Returning a credential
/// without an access token is treated as a failed refresh.
///
/// Uses a boxed future return type for dyn-compatibility (`Box<dyn Refresher>`).
pub trait Refresher: Send + Sync {
    fn refresh<'a>(&'a self, current: &'a Credential) -> BoxFuture<'a, credential::Result<Credential>>;
}

/// Standard OAuth2 `refresh_token` grant against a vendor token endpoint.
pub struct OAuth2Refresher {
    client: reqwest::Client,
    endpoint: OAuth2Endpoint,
}

impl OAuth2Refresher {
    pub fn new(client: reqwest::Client, endpoint: OAuth2Endpoint) -> Self {
        Self { client, endpoint }
    }
}

impl Refresher for OAuth2Refresher {
    fn refresh<'a>(&'a self, current: &'a Credential) -> BoxFuture<'a, credential::Result<Credential>> {
        Box::pin(async move {
            let now = credential::now_millis();
            let response =
                credential::refresh_token(&self.client, &self.endpoint, &current.refresh_token)
                    .await?;
            Ok(response.into_credential(now))
        })
    }
}

/// Refresher backed by a closure over an owned copy of the current credential.
pub struct FnRefresher<F>(F);

/// Wrap a closure as a `Refresher`.
pub fn refresh_fn<F, Fut>(f: F) -> FnRefresher<F>
where
    F: Fn(Credential) -> Fut + Send + Sync,
    Fut: Future<Output = credential::Result<Credential>> + Send + 'static,
{
    FnRefresher(f)
}

impl<F, Fut> Refresher for FnRefresher<F>
where
    F: Fn(Credential) -> Fut + Send + Sync,
    Fut: Future<Output = credential::Result<Credential>> + Send + 'static,
{
    fn refresh<'a>(&'a self, current: &'a Credential) -> BoxFuture<'a, credential::Result<Credential>> {
        Box::pin((self.0)(current.clone()))
    }
}
