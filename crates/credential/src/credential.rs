//! Credential value type, validity predicate and merge rule
//!
//! `expires` is a unix timestamp in milliseconds (absolute, not a delta).
//! A credential built without a known expiry uses `0`, which is always in
//! the past, so the first lookup forces a refresh.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    duration_millis(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default(),
    )
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Bearer credential for one vendor account.
///
/// An empty `refresh_token` means the vendor issued none. `extra` carries
/// vendor-specific fields (token type, scopes, ids) untouched.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "access")]
    pub access_token: String,
    #[serde(rename = "refresh", default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
    /// Expiration as unix timestamp in milliseconds
    #[serde(default)]
    pub expires: u64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>, expires: u64) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires,
            extra: Map::new(),
        }
    }

    /// Credential expiring `lifetime` from now.
    pub fn expiring_in(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        lifetime: Duration,
    ) -> Self {
        let expires = now_millis().saturating_add(duration_millis(lifetime));
        Self::new(access_token, refresh_token, expires)
    }

    /// Attach a vendor-specific field.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Usable right now: has an access token and has not expired.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(now_millis())
    }

    pub fn is_valid_at(&self, now_millis: u64) -> bool {
        !self.access_token.is_empty() && now_millis < self.expires
    }

    /// Valid now and still valid `leeway` from now.
    pub fn is_valid_for(&self, leeway: Duration) -> bool {
        self.is_valid_at(now_millis().saturating_add(duration_millis(leeway)))
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// Time left until expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.expires.saturating_sub(now_millis()))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &redacted(&self.access_token))
            .field("refresh_token", &redacted(&self.refresh_token))
            .field("expires", &self.expires)
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn redacted(token: &str) -> &'static str {
    if token.is_empty() { "" } else { "[REDACTED]" }
}

/// Combine the held credential with a refresh result.
///
/// Every field comes from `new`, except that an empty refresh token in `new`
/// keeps the one from `old`: vendors routinely omit it from refresh responses
/// and losing it would force a full re-login. A result without an access
/// token is rejected outright.
pub fn merge(old: &Credential, new: Credential) -> Result<Credential> {
    if new.access_token.is_empty() {
        return Err(Error::MissingAccessToken);
    }

    let mut merged = new;
    if merged.refresh_token.is_empty() && !old.refresh_token.is_empty() {
        merged.refresh_token = old.refresh_token.clone();
    }
    Ok(merged)
}
