//! Vendor credential value type and its collaborators
//!
//! A `Credential` is the bearer token a vendor integration attaches to its
//! API calls, plus whatever it needs to renew it. This crate holds the value
//! type and the pieces that do not care how the credential is scheduled:
//!
//! - `credential`: validity predicate and the merge rule applied after a refresh
//! - `oauth2`: the standard `refresh_token` grant against a token endpoint
//! - `store`: key-value persistence (`TokenStore`) with file and memory backends
//!
//! Lifecycle management (lazy refresh, shared caches, background refresh)
//! lives in the `token-source` crate.

pub mod credential;
pub mod error;
pub mod oauth2;
pub mod store;

use std::future::Future;
use std::pin::Pin;

pub use credential::{Credential, duration_millis, merge, now_millis};
pub use error::{Error, Result};
pub use oauth2::{OAuth2Endpoint, TokenResponse, refresh_token};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};

/// Boxed future used by the dyn-compatible traits in this workspace.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
