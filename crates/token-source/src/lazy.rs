//! Lazily refreshing token holder
//!
//! A `LazyTokenSource` owns exactly one credential and the `Refresher` that
//! renews it. `token()` hands out the held credential while it is valid and
//! refreshes it otherwise. The tokio Mutex is held across the refresh
//! round-trip, so concurrent callers of an expired source wait for the first
//! refresh and then see its result instead of starting their own.

use std::sync::Arc;
use std::time::Duration;

use credential::{Credential, TokenStore, merge};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, TokenError};
use crate::refresher::Refresher;
use crate::source::TokenSource;

/// Refresh calls that take longer than this count as failed.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a source writes its credential after every successful refresh.
struct Persistence {
    store: Arc<dyn TokenStore>,
    key: String,
}

pub struct LazyTokenSource {
    held: Mutex<Credential>,
    /// Copy of `held` readable without waiting for an in-flight refresh
    published: watch::Sender<Credential>,
    refresher: Box<dyn Refresher>,
    refresh_timeout: Duration,
    leeway: Duration,
    persistence: Option<Persistence>,
}

impl LazyTokenSource {
    /// Create a source around an initial credential.
    ///
    /// `None` is treated as already expired, so the first `token()` call
    /// refreshes instead of returning an unusable empty credential.
    pub fn new(initial: Option<Credential>, refresher: impl Refresher + 'static) -> Self {
        let initial = initial.unwrap_or_default();
        let (published, _) = watch::channel(initial.clone());
        Self {
            held: Mutex::new(initial),
            published,
            refresher: Box::new(refresher),
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            leeway: Duration::ZERO,
            persistence: None,
        }
    }

    /// Bound every refresh call; a timeout is reported as a failed refresh.
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Refresh once the credential has less than `leeway` left.
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Write every refreshed credential to `store` under `key`.
    pub fn with_store(mut self, store: Arc<dyn TokenStore>, key: impl Into<String>) -> Self {
        self.persistence = Some(Persistence {
            store,
            key: key.into(),
        });
        self
    }

    /// Create a source resuming from whatever `store` holds under `key`.
    ///
    /// Refreshed credentials are written back to the same key.
    pub async fn from_store(
        store: Arc<dyn TokenStore>,
        key: impl Into<String>,
        refresher: impl Refresher + 'static,
    ) -> credential::Result<Self> {
        let key = key.into();
        let initial = store.get(&key).await?;
        if initial.is_some() {
            debug!(key = %key, "resuming from stored credential");
        }
        Ok(Self::new(initial, refresher).with_store(store, key))
    }

    /// Return a valid credential, refreshing it first if needed.
    ///
    /// On refresh failure the previously held credential comes back inside
    /// the `TokenError` and the held state is left unchanged. Refresh errors
    /// are not retried here.
    pub async fn token(&self) -> Result<Credential, TokenError> {
        let mut held = self.held.lock().await;

        if held.is_valid_for(self.leeway) {
            return Ok(held.clone());
        }

        debug!(
            has_refresh_token = held.has_refresh_token(),
            "credential expired or missing, refreshing"
        );

        let refreshed =
            match tokio::time::timeout(self.refresh_timeout, self.refresher.refresh(&held)).await {
                Ok(Ok(credential)) => credential,
                Ok(Err(e)) => {
                    crate::metrics::record_refresh("failed");
                    warn!(error = %e, "token refresh failed");
                    return Err(TokenError::new(held.clone(), e.into()));
                }
                Err(_) => {
                    crate::metrics::record_refresh("timeout");
                    warn!(
                        timeout_secs = self.refresh_timeout.as_secs(),
                        "token refresh timed out"
                    );
                    return Err(TokenError::new(
                        held.clone(),
                        Error::RefreshTimeout(self.refresh_timeout),
                    ));
                }
            };

        let merged = match merge(&held, refreshed) {
            Ok(merged) => merged,
            Err(e) => {
                crate::metrics::record_refresh("missing_access_token");
                warn!(error = %e, "refresh result rejected");
                return Err(TokenError::new(held.clone(), e.into()));
            }
        };

        *held = merged;
        self.published.send_replace(held.clone());
        crate::metrics::record_refresh("success");
        info!(
            expires_in_secs = held.remaining().as_secs(),
            "token refreshed"
        );

        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.store.set(&persistence.key, &held).await {
                warn!(key = %persistence.key, error = %e, "failed to persist refreshed token");
            }
        }

        Ok(held.clone())
    }

    /// The held credential without refreshing.
    ///
    /// Waits for an in-flight refresh to finish; use `snapshot` where that
    /// must not block.
    pub async fn current(&self) -> Credential {
        self.held.lock().await.clone()
    }

    /// Last published credential. Never waits on the refresh lock, so during
    /// a refresh it returns the credential held before the refresh started.
    pub fn snapshot(&self) -> Credential {
        self.published.borrow().clone()
    }

    /// Force the next `token()` call to refresh, e.g. after the vendor API
    /// rejected the access token. The refresh token is kept.
    pub async fn invalidate(&self) {
        let mut held = self.held.lock().await;
        held.expires = 0;
        self.published.send_replace(held.clone());
    }

    /// Lower the held expiry to `latest` (unix ms) if it is later.
    ///
    /// Returns whether the expiry was changed.
    pub async fn clamp_expiry(&self, latest: u64) -> bool {
        let mut held = self.held.lock().await;
        if held.expires > latest {
            held.expires = latest;
            self.published.send_replace(held.clone());
            true
        } else {
            false
        }
    }
}

impl TokenSource for LazyTokenSource {
    fn token(&self) -> credential::BoxFuture<'_, Result<Credential, TokenError>> {
        Box::pin(LazyTokenSource::token(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresher::refresh_fn;
    use credential::{BoxFuture, MemoryTokenStore, now_millis};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HOUR: Duration = Duration::from_secs(3600);

    /// Refresher that counts calls and returns `A<n>` with no refresh token.
    fn counting_refresher(calls: Arc<AtomicUsize>) -> impl Refresher {
        refresh_fn(move |_current: Credential| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Credential::expiring_in(format!("A{n}"), "", HOUR))
            }
        })
    }

    #[tokio::test]
    async fn valid_credential_is_returned_without_refresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = LazyTokenSource::new(
            Some(Credential::expiring_in("A0", "R0", HOUR)),
            counting_refresher(calls.clone()),
        );

        assert_eq!(source.token().await.unwrap().access_token, "A0");
        assert_eq!(source.token().await.unwrap().access_token, "A0");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_call_after_refresh_does_not_refresh_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = LazyTokenSource::new(None, counting_refresher(calls.clone()));

        assert_eq!(source.token().await.unwrap().access_token, "A1");
        assert_eq!(source.token().await.unwrap().access_token, "A1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn absent_initial_credential_refreshes_first() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = LazyTokenSource::new(None, counting_refresher(calls.clone()));

        assert_eq!(source.current().await.expires, 0);
        let credential = source.token().await.unwrap();
        assert_eq!(credential.access_token, "A1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_keeps_refresh_token_the_vendor_omitted() {
        let now = now_millis();
        let source = LazyTokenSource::new(
            Some(Credential::new("A1", "R1", now - 1_000)),
            refresh_fn(move |_current: Credential| async move {
                Ok(Credential::new("A2", "", now + 3_600_000))
            }),
        );

        let credential = source.token().await.unwrap();
        assert_eq!(credential.access_token, "A2");
        assert_eq!(credential.refresh_token, "R1");
        assert_eq!(credential.expires, now + 3_600_000);
    }

    #[tokio::test]
    async fn refresher_receives_held_credential() {
        let source = LazyTokenSource::new(
            Some(Credential::new("A1", "R1", 0).with_extra("vin", "WVW1")),
            refresh_fn(|current: Credential| async move {
                assert_eq!(current.refresh_token, "R1");
                assert_eq!(current.extra["vin"], "WVW1");
                Ok(Credential::expiring_in("A2", "R2", HOUR))
            }),
        );

        assert_eq!(source.token().await.unwrap().refresh_token, "R2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_refresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let source = Arc::new(LazyTokenSource::new(
            Some(Credential::new("A0", "R0", 0)),
            refresh_fn(move |_current: Credential| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    // Hold the refresh open so the other callers pile up on the lock
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Credential::expiring_in("A1", "", HOUR))
                }
            }),
        ));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let source = source.clone();
            handles.push(tokio::spawn(async move { source.token().await }));
        }
        for handle in handles {
            let credential = handle.await.unwrap().unwrap();
            assert_eq!(credential.access_token, "A1");
            assert_eq!(credential.refresh_token, "R0");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_returns_stale_credential_and_error() {
        let stale = Credential::new("A1", "R1", now_millis() - 1_000);
        let source = LazyTokenSource::new(
            Some(stale.clone()),
            refresh_fn(|_current: Credential| async move {
                Err(credential::Error::Http("connection reset".into()))
            }),
        );

        let err = source.token().await.unwrap_err();
        assert!(matches!(err.error(), Error::RefreshFailed(_)));
        assert_eq!(err.stale(), &stale);
        assert_eq!(source.current().await, stale);
    }

    #[tokio::test]
    async fn failed_refresh_is_not_retried_internally() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let source = LazyTokenSource::new(
            None,
            refresh_fn(move |_current: Credential| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(credential::Error::TokenExchange("503".into()))
                }
            }),
        );

        assert!(source.token().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(source.token().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_access_token_is_never_merged() {
        let held = Credential::new("A1", "R1", 0);
        let source = LazyTokenSource::new(
            Some(held.clone()),
            refresh_fn(|_current: Credential| async move {
                Ok(Credential::expiring_in("", "R2", HOUR))
            }),
        );

        let err = source.token().await.unwrap_err();
        assert!(matches!(err.error(), Error::MissingAccessToken));
        assert_eq!(source.current().await, held);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_refresh_times_out_as_failure() {
        let source = LazyTokenSource::new(
            Some(Credential::new("A1", "R1", 0)),
            refresh_fn(|_current: Credential| async move {
                tokio::time::sleep(Duration::from_secs(120)).await;
                Ok(Credential::expiring_in("A2", "", HOUR))
            }),
        )
        .with_refresh_timeout(Duration::from_secs(5));

        let err = source.token().await.unwrap_err();
        assert!(matches!(err.error(), Error::RefreshTimeout(d) if *d == Duration::from_secs(5)));
        assert_eq!(err.stale().access_token, "A1");
    }

    #[tokio::test]
    async fn leeway_refreshes_before_expiry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = LazyTokenSource::new(
            Some(Credential::expiring_in("A0", "R0", Duration::from_secs(30))),
            counting_refresher(calls.clone()),
        )
        .with_leeway(Duration::from_secs(60));

        assert_eq!(source.token().await.unwrap().access_token, "A1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_refresh_and_keeps_refresh_token() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = LazyTokenSource::new(
            Some(Credential::expiring_in("A0", "R0", HOUR)),
            counting_refresher(calls.clone()),
        );

        source.invalidate().await;
        let credential = source.token().await.unwrap();
        assert_eq!(credential.access_token, "A1");
        assert_eq!(credential.refresh_token, "R0");
    }

    #[tokio::test]
    async fn clamp_expiry_only_lowers() {
        let source = LazyTokenSource::new(
            Some(Credential::new("A0", "", 10_000)),
            counting_refresher(Arc::new(AtomicUsize::new(0))),
        );

        assert!(!source.clamp_expiry(20_000).await);
        assert_eq!(source.current().await.expires, 10_000);
        assert!(source.clamp_expiry(5_000).await);
        assert_eq!(source.current().await.expires, 5_000);
    }

    #[tokio::test]
    async fn refreshed_credential_is_persisted() {
        let store = Arc::new(MemoryTokenStore::new());
        let source = LazyTokenSource::new(
            Some(Credential::new("A0", "R0", 0)),
            counting_refresher(Arc::new(AtomicUsize::new(0))),
        )
        .with_store(store.clone(), "ford");

        source.token().await.unwrap();

        let stored = store.get("ford").await.unwrap().unwrap();
        assert_eq!(stored.access_token, "A1");
        assert_eq!(stored.refresh_token, "R0");
    }

    #[tokio::test]
    async fn from_store_resumes_stored_credential() {
        let store = Arc::new(MemoryTokenStore::new());
        store
            .set("ford", &Credential::expiring_in("A_stored", "R_stored", HOUR))
            .await
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let source = LazyTokenSource::from_store(store, "ford", counting_refresher(calls.clone()))
            .await
            .unwrap();

        assert_eq!(source.token().await.unwrap().access_token, "A_stored");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn usable_as_dyn_token_source() {
        let source: Arc<dyn TokenSource> = Arc::new(LazyTokenSource::new(
            None,
            counting_refresher(Arc::new(AtomicUsize::new(0))),
        ));

        assert_eq!(source.token().await.unwrap().access_token, "A1");
    }

    /// Store whose writes always fail.
    struct ReadOnlyStore;

    impl TokenStore for ReadOnlyStore {
        fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, credential::Result<Option<Credential>>> {
            Box::pin(async { Ok(None) })
        }

        fn set<'a>(
            &'a self,
            _key: &'a str,
            _credential: &'a Credential,
        ) -> BoxFuture<'a, credential::Result<()>> {
            Box::pin(async { Err(credential::Error::Io("read-only file system".into())) })
        }

        fn remove<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, credential::Result<Option<Credential>>> {
            Box::pin(async { Ok(None) })
        }
    }

    #[tokio::test]
    async fn store_failure_does_not_fail_token() {
        let source = LazyTokenSource::new(
            Some(Credential::new("A0", "R0", 0)),
            counting_refresher(Arc::new(AtomicUsize::new(0))),
        )
        .with_store(Arc::new(ReadOnlyStore), "ford");

        let credential = source.token().await.unwrap();
        assert_eq!(credential.access_token, "A1");
        assert_eq!(credential.refresh_token, "R0");
        assert_eq!(source.current().await, credential);
    }

    #[tokio::test]
    async fn snapshot_tracks_held_credential() {
        let source = LazyTokenSource::new(None, counting_refresher(Arc::new(AtomicUsize::new(0))));
        assert_eq!(source.snapshot(), Credential::default());

        let credential = source.token().await.unwrap();
        assert_eq!(source.snapshot(), credential);

        source.clamp_expiry(5_000).await;
        assert_eq!(source.snapshot().expires, 5_000);

        source.invalidate().await;
        assert_eq!(source.snapshot().expires, 0);
        assert_eq!(source.snapshot().access_token, "A1");
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_does_not_wait_for_refresh() {
        let source = Arc::new(LazyTokenSource::new(
            Some(Credential::new("A0", "R0", 0)),
            refresh_fn(|_current: Credential| async move {
                tokio::time::sleep(Duration::from_secs(20)).await;
                Ok(Credential::expiring_in("A1", "", HOUR))
            }),
        ));

        let refreshing = source.clone();
        let handle = tokio::spawn(async move { refreshing.token().await });
        // Let the spawned task take the lock and start its refresh
        tokio::task::yield_now().await;

        assert_eq!(source.snapshot().access_token, "A0");
        assert_eq!(handle.await.unwrap().unwrap().access_token, "A1");
        assert_eq!(source.snapshot().access_token, "A1");
    }
}
