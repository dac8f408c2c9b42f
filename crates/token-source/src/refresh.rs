//! Proactive background token refresh
//!
//! Spawns a periodic task that asks a `LazyTokenSource` for its token on a
//! fixed interval, so the refresh after expiry is paid here instead of by the
//! next API request. Repeated failures are counted; more than
//! `MAX_CONSECUTIVE_FAILURES` in a row stops the loop, because a credential
//! that cannot be refreshed for that long needs a new login, not more retries.

use std::sync::Arc;
use std::time::Duration;

use credential::{Credential, duration_millis, now_millis};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result, TokenError};
use crate::lazy::LazyTokenSource;

/// Failures tolerated in a row; the next one stops the loop.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Default tick interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// State published by a running loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    /// Last refresh succeeded (or none was due yet)
    Running,
    /// Last `failures` refreshes failed in a row
    Failing { failures: u32 },
    /// Stopped after too many failures; the credential needs a new login
    GaveUp { failures: u32 },
    /// Stopped by shutdown
    Stopped,
}

impl LoopStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            LoopStatus::Running => "running",
            LoopStatus::Failing { .. } => "failing",
            LoopStatus::GaveUp { .. } => "gave_up",
            LoopStatus::Stopped => "stopped",
        }
    }
}

pub struct RefreshLoop {
    name: String,
    source: Arc<LazyTokenSource>,
    interval: Duration,
    max_lifetime: Option<Duration>,
    status: watch::Sender<LoopStatus>,
}

impl RefreshLoop {
    /// `name` identifies the account in logs.
    pub fn new(name: impl Into<String>, source: Arc<LazyTokenSource>) -> Self {
        let (status, _) = watch::channel(LoopStatus::Running);
        Self {
            name: name.into(),
            source,
            interval: DEFAULT_INTERVAL,
            max_lifetime: None,
            status,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Never trust a credential for longer than `max_lifetime` from the
    /// moment it was obtained, whatever expiry the vendor claims.
    pub fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = Some(max_lifetime);
        self
    }

    /// Receiver tracking this loop's status.
    pub fn status(&self) -> watch::Receiver<LoopStatus> {
        self.status.subscribe()
    }

    /// Run one refresh: fetch the token and apply the lifetime clamp.
    pub async fn refresh_once(&self) -> std::result::Result<Credential, TokenError> {
        let mut credential = self.source.token().await?;

        if let Some(max_lifetime) = self.max_lifetime {
            let latest = now_millis().saturating_add(duration_millis(max_lifetime));
            if credential.expires > latest && self.source.clamp_expiry(latest).await {
                debug!(
                    account = %self.name,
                    max_lifetime_secs = max_lifetime.as_secs(),
                    "clamped token lifetime"
                );
                credential.expires = latest;
            }
        }

        Ok(credential)
    }

    /// Tick until shutdown or until the failure limit is exceeded.
    ///
    /// The first tick is skipped: setup code has just obtained the token.
    /// Returns `Ok(())` when `shutdown` fires (or its sender is dropped) and
    /// `Error::GaveUp` after more than `MAX_CONSECUTIVE_FAILURES` failures.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;

        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(account = %self.name, "background refresh stopped");
                        self.status.send_replace(LoopStatus::Stopped);
                        return Ok(());
                    }
                    continue;
                }
            }

            match self.refresh_once().await {
                Ok(credential) => {
                    if failures > 0 {
                        info!(account = %self.name, failures, "background refresh recovered");
                    }
                    failures = 0;
                    self.status.send_replace(LoopStatus::Running);
                    debug!(
                        account = %self.name,
                        expires_in_secs = credential.remaining().as_secs(),
                        "background refresh tick"
                    );
                }
                Err(e) => {
                    failures += 1;
                    if failures > MAX_CONSECUTIVE_FAILURES {
                        error!(
                            account = %self.name,
                            failures,
                            error = %e,
                            "background refresh giving up, account needs a new login"
                        );
                        crate::metrics::record_giveup();
                        self.status.send_replace(LoopStatus::GaveUp { failures });
                        return Err(Error::GaveUp { failures });
                    }
                    warn!(
                        account = %self.name,
                        failures,
                        error = %e,
                        "background refresh failed, will retry next tick"
                    );
                    self.status.send_replace(LoopStatus::Failing { failures });
                }
            }
        }
    }

    /// Spawn `run` on the tokio runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(self.run(shutdown))
    }
}
