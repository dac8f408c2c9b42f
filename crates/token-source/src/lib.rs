//! Credential lifecycle for vendor integrations
//!
//! Keeps short-lived bearer credentials valid without re-authenticating more
//! often than necessary and without two callers racing the same refresh.
//!
//! Components:
//! 1. `Refresher`: vendor capability that renews a credential
//! 2. `LazyTokenSource`: holds one credential, refreshes on demand, one
//!    refresh in flight at a time
//! 3. `TokenSourceCache` + `CredentialKey`: shares one source between
//!    integrations configured with the same account
//! 4. `BootstrapTokenSource`: for vendors whose only renewal is a full login
//! 5. `RefreshLoop`: proactive periodic refresh that gives up after repeated
//!    failures
//!
//! HTTP clients attach the credential with `authorize()` before each request.

pub mod bootstrap;
pub mod cache;
pub mod error;
pub mod lazy;
pub mod metrics;
pub mod refresh;
pub mod refresher;
pub mod source;

pub use bootstrap::BootstrapTokenSource;
pub use cache::{CredentialKey, TokenSourceCache};
pub use error::{Error, Result, TokenError};
pub use lazy::LazyTokenSource;
pub use refresh::{LoopStatus, MAX_CONSECUTIVE_FAILURES, RefreshLoop};
pub use refresher::{FnRefresher, OAuth2Refresher, Refresher, refresh_fn};
pub use source::{TokenSource, authorize};
