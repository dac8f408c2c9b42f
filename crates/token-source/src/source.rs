//! Uniform token interface consumed by HTTP clients
//!
//! Both `LazyTokenSource` and `BootstrapTokenSource` implement `TokenSource`.
//! Client code holds an `Arc<dyn TokenSource>` and calls `authorize()` before
//! every outbound request.

use credential::{BoxFuture, Credential};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};

use crate::error::{Error, Result, TokenError};

/// Anything that can hand out a currently valid credential.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> BoxFuture<'_, std::result::Result<Credential, TokenError>>;
}

/// Insert `Authorization: Bearer <access token>` into `headers`.
///
/// A failed refresh is returned as an error and `headers` are left
/// untouched; the stale credential is never sent.
pub async fn authorize(source: &dyn TokenSource, headers: &mut HeaderMap) -> Result<()> {
    let credential = source.token().await?;

    let mut value = HeaderValue::from_str(&format!("Bearer {}", credential.access_token))
        .map_err(|e| Error::InvalidHeader(format!("access token is not a valid header value: {e}")))?;
    value.set_sensitive(true);

    headers.insert(AUTHORIZATION, value);
    Ok(())
}
