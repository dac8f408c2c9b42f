//! OAuth2 `refresh_token` grant
//!
//! Most vendors that do offer a refresh grant follow RFC 6749 section 6:
//! POST a form with `grant_type=refresh_token` to the token endpoint and get
//! back a JSON body with a new access token. Refresh responses are often
//! partial (no new refresh token, no `expires_in`), so every field except the
//! access token is optional here and the gaps are filled by `merge`.

use common::Secret;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::credential::Credential;
use crate::error::{Error, Result};

/// Token endpoint of one vendor OAuth2 client.
#[derive(Debug, Clone)]
pub struct OAuth2Endpoint {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Option<Secret<String>>,
}

/// Response from the token endpoint.
///
/// `expires_in` is a delta in seconds from the response time. Unknown
/// fields are kept in `extra`.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenResponse {
    /// Convert to an absolute credential as of `now_millis`.
    ///
    /// A response without `expires_in` never expires on its own; callers
    /// that want to bound it use the background loop's lifetime clamp.
    pub fn into_credential(self, now_millis: u64) -> Credential {
        let expires = match self.expires_in {
            Some(secs) => now_millis.saturating_add(secs.saturating_mul(1000)),
            None => u64::MAX,
        };
        Credential {
            access_token: self.access_token,
            refresh_token: self.refresh_token.unwrap_or_default(),
            expires,
            extra: self.extra,
        }
    }
}

/// Exchange a refresh token for a new access token.
///
/// 401/403 (and `invalid_grant` 400s) mean the refresh token is revoked or
/// expired and are reported as `InvalidCredentials`; the caller has to log in
/// again rather than retry.
pub async fn refresh_token(
    client: &reqwest::Client,
    endpoint: &OAuth2Endpoint,
    refresh: &str,
) -> Result<TokenResponse> {
    if refresh.is_empty() {
        return Err(Error::MissingRefreshToken);
    }

    let mut form = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh),
        ("client_id", endpoint.client_id.as_str()),
    ];
    if let Some(secret) = &endpoint.client_secret {
        form.push(("client_secret", secret.expose().as_str()));
    }

    let response = client
        .post(&endpoint.token_url)
        .form(&form)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401
            || status.as_u16() == 403
            || (status.as_u16() == 400 && body.contains("invalid_grant"))
        {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))
}
