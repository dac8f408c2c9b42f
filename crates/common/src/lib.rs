//! Shared types for the credential lifecycle crates
//!
//! `Secret` keeps account passwords, refresh tokens and client secrets out of
//! logs; `Error` covers configuration loading for binaries built on top.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
