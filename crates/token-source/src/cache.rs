//! Shared token sources keyed by account credentials
//!
//! Several configured devices often belong to one vendor account. Each of
//! them logging in separately trips rate limits and anti-automation checks,
//! so integrations look their token source up here first. The cache is an
//! ordinary value: build one at startup and hand clones to every
//! integration factory.
//!
//! Lookups take the read lock. Creation takes the write lock, checks again
//! (another task may have created the entry while this one waited) and only
//! then runs the creation closure, so each key is created at most once.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::lazy::LazyTokenSource;

/// Digest of an (identity, secret) pair.
///
/// SHA-256 over `identity || 0x00 || secret`, hex encoded. Equal pairs give
/// equal keys; changing either half changes the key. Reveals nothing about
/// the secret, so it is safe to log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey(String);

impl CredentialKey {
    pub fn new(identity: &str, secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(identity.as_bytes());
        hasher.update([0u8]);
        hasher.update(secret.as_bytes());

        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry of shared `LazyTokenSource`s.
///
/// Cloning is cheap and clones share the same entries.
#[derive(Clone, Default)]
pub struct TokenSourceCache {
    entries: Arc<RwLock<HashMap<CredentialKey, Arc<LazyTokenSource>>>>,
}

impl TokenSourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the source cached under `key`, creating it with `create` if absent.
    ///
    /// `create` typically performs the initial login. It runs at most once
    /// per key no matter how many tasks race here; all of them get the same
    /// instance. A failed `create` caches nothing, so the next call tries
    /// again from scratch.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &CredentialKey,
        create: F,
    ) -> Result<Arc<LazyTokenSource>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = credential::Result<LazyTokenSource>>,
    {
        if let Some(source) = self.entries.read().await.get(key) {
            debug!(key = %key, "token source cache hit");
            return Ok(source.clone());
        }

        let mut entries = self.entries.write().await;
        if let Some(source) = entries.get(key) {
            debug!(key = %key, "token source created while waiting for lock");
            return Ok(source.clone());
        }

        let source = match create().await {
            Ok(source) => Arc::new(source),
            Err(e) => {
                warn!(key = %key, error = %e, "failed to create token source");
                return Err(Error::CacheCreationFailed(e));
            }
        };

        entries.insert(key.clone(), source.clone());
        crate::metrics::set_cache_entries(entries.len());
        info!(key = %key, entries = entries.len(), "token source created");
        Ok(source)
    }

    /// Drop the source cached under `key`, if any.
    ///
    /// Used when an account's secret changes or its refresh token was
    /// revoked. Holders of the old `Arc` keep working with it; the next
    /// `get_or_create` builds a fresh one.
    pub async fn clear(&self, key: &CredentialKey) {
        let mut entries = self.entries.write().await;
        if entries.remove(key).is_some() {
            crate::metrics::set_cache_entries(entries.len());
            info!(key = %key, "token source evicted");
        }
    }

    pub async fn contains(&self, key: &CredentialKey) -> bool {
        self.entries.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
