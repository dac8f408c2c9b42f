//! Account wiring
//!
//! Turns configured accounts into shared token sources and background refresh
//! loops. Accounts with the same identity, refresh token and token endpoint
//! resolve to the same `CredentialKey`, so they share one source and one loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use credential::{Credential, OAuth2Endpoint, TokenStore};
use token_source::{
    CredentialKey, LazyTokenSource, LoopStatus, OAuth2Refresher, RefreshLoop, TokenSourceCache,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{AccountConfig, KeeperConfig};

/// A configured account and the loop keeping its token fresh.
pub struct AccountHandle {
    pub name: String,
    pub key: CredentialKey,
    pub source: Arc<LazyTokenSource>,
    pub status: watch::Receiver<LoopStatus>,
}

pub struct Accounts {
    handles: Vec<AccountHandle>,
    tasks: Vec<(String, JoinHandle<token_source::Result<()>>)>,
}

impl Accounts {
    /// Build a source for every account, fetch its first token and spawn
    /// its refresh loop.
    ///
    /// A failing first refresh is logged, not fatal: the loop keeps trying
    /// and `/health` reports the account once it gives up.
    pub async fn start(
        keeper: &KeeperConfig,
        accounts: &[AccountConfig],
        client: &reqwest::Client,
        store: Option<Arc<dyn TokenStore>>,
        cache: &TokenSourceCache,
        shutdown: &watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let mut handles = Vec::with_capacity(accounts.len());
        let mut tasks = Vec::new();
        let mut statuses: HashMap<CredentialKey, watch::Receiver<LoopStatus>> = HashMap::new();

        for account in accounts {
            let refresh_token = account
                .refresh_token
                .as_ref()
                .with_context(|| format!("account {} has no refresh token", account.name))?;
            let key = account_key(account, refresh_token.expose());

            let source = cache
                .get_or_create(&key, || {
                    build_source(keeper, account, client, store.clone(), &key)
                })
                .await
                .with_context(|| format!("failed to create token source for {}", account.name))?;

            if let Some(status) = statuses.get(&key) {
                info!(account = %account.name, key = %key, "sharing token source with another account");
                handles.push(AccountHandle {
                    name: account.name.clone(),
                    key,
                    source,
                    status: status.clone(),
                });
                continue;
            }

            let mut refresh_loop = RefreshLoop::new(account.name.clone(), source.clone())
                .with_interval(keeper.refresh_interval());
            if let Some(max_lifetime) = keeper.max_lifetime() {
                refresh_loop = refresh_loop.with_max_lifetime(max_lifetime);
            }

            match refresh_loop.refresh_once().await {
                Ok(credential) => info!(
                    account = %account.name,
                    expires_in_secs = credential.remaining().as_secs(),
                    "initial token ready"
                ),
                Err(e) => warn!(
                    account = %account.name,
                    error = %e,
                    "initial token refresh failed, background loop will retry"
                ),
            }

            let status = refresh_loop.status();
            statuses.insert(key.clone(), status.clone());
            tasks.push((account.name.clone(), refresh_loop.spawn(shutdown.clone())));
            handles.push(AccountHandle {
                name: account.name.clone(),
                key,
                source,
                status,
            });
        }

        crate::metrics::set_accounts(handles.len());
        Ok(Self { handles, tasks })
    }

    pub fn handles(&self) -> &[AccountHandle] {
        &self.handles
    }

    /// Number of background loops (shared accounts run one loop).
    pub fn loops(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every loop to finish after shutdown was signalled.
    ///
    /// Loops still running after `timeout` are aborted.
    pub async fn join(self, timeout: Duration) {
        for (name, mut task) in self.tasks {
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(account = %name, error = %e, "refresh loop had stopped"),
                Ok(Err(e)) => error!(account = %name, error = %e, "refresh loop panicked"),
                Err(_) => {
                    warn!(account = %name, "refresh loop did not stop in time, aborting");
                    task.abort();
                }
            }
        }
    }
}

/// Cache key for an account. The token endpoint and client id are part of
/// the identity: the same refresh token sent to another endpoint is a
/// different credential.
fn account_key(account: &AccountConfig, refresh_token: &str) -> CredentialKey {
    let identity = format!(
        "{}\0{}\0{}",
        account.identity, account.token_url, account.client_id
    );
    CredentialKey::new(&identity, refresh_token)
}

/// Source for one account: resumes from the store when it holds a credential
/// for `key`, otherwise starts from the configured refresh token.
async fn build_source(
    keeper: &KeeperConfig,
    account: &AccountConfig,
    client: &reqwest::Client,
    store: Option<Arc<dyn TokenStore>>,
    key: &CredentialKey,
) -> credential::Result<LazyTokenSource> {
    let refresh_token = account
        .refresh_token
        .as_ref()
        .map(|token| token.expose().as_str())
        .unwrap_or_default();
    let seed = Credential::new("", refresh_token, 0);

    let refresher = OAuth2Refresher::new(
        client.clone(),
        OAuth2Endpoint {
            token_url: account.token_url.clone(),
            client_id: account.client_id.clone(),
            client_secret: account.client_secret.clone(),
        },
    );

    let source = match store {
        Some(store) => {
            let stored = store.get(key.as_str()).await?;
            if stored.is_some() {
                info!(account = %account.name, "resuming from stored token");
            }
            LazyTokenSource::new(Some(stored.unwrap_or(seed)), refresher)
                .with_store(store, key.as_str())
        }
        None => LazyTokenSource::new(Some(seed), refresher),
    };

    Ok(source.with_refresh_timeout(keeper.refresh_timeout()))
}
