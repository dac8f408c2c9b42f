//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Account secrets (refresh tokens, client secrets) are read from the env
//! var or file named in the config and are never stored in the TOML itself.

use common::Secret;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub keeper: KeeperConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Daemon-wide settings
#[derive(Debug, Deserialize)]
pub struct KeeperConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Upper bound on how long any token is trusted, whatever the vendor says
    #[serde(default)]
    pub max_lifetime_secs: Option<u64>,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
    /// Where refreshed tokens are persisted; in-memory only when unset
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// One vendor account using the OAuth2 refresh grant
#[derive(Debug, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    /// Login identity (usually the account e-mail); part of the cache key
    pub identity: String,
    pub token_url: String,
    pub client_id: String,
    #[serde(default)]
    pub refresh_token_env: Option<String>,
    #[serde(default)]
    pub refresh_token_file: Option<PathBuf>,
    #[serde(default)]
    pub client_secret_env: Option<String>,
    #[serde(skip)]
    pub refresh_token: Option<Secret<String>>,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_refresh_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    64
}

impl KeeperConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, validate it, then resolve
    /// account secrets.
    ///
    /// Refresh token resolution order per account:
    /// 1. env var named by `refresh_token_env`
    /// 2. `refresh_token_file` path
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config.validate()?;

        for account in &mut config.accounts {
            account.resolve_secrets()?;
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.keeper.refresh_interval_secs == 0 {
            return Err(common::Error::Config(
                "refresh_interval_secs must be greater than 0".into(),
            ));
        }

        if self.keeper.refresh_timeout_secs == 0 {
            return Err(common::Error::Config(
                "refresh_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.keeper.max_lifetime_secs == Some(0) {
            return Err(common::Error::Config(
                "max_lifetime_secs must be greater than 0 when set".into(),
            ));
        }

        if self.keeper.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        let mut names = HashSet::new();
        for account in &self.accounts {
            if account.name.trim().is_empty() {
                return Err(common::Error::Config("account name must not be empty".into()));
            }
            if !names.insert(account.name.as_str()) {
                return Err(common::Error::Config(format!(
                    "duplicate account name: {}",
                    account.name
                )));
            }
            if !account.token_url.starts_with("http://") && !account.token_url.starts_with("https://")
            {
                return Err(common::Error::Config(format!(
                    "account {}: token_url must start with http:// or https://, got: {}",
                    account.name, account.token_url
                )));
            }
            if account.refresh_token_env.is_none() && account.refresh_token_file.is_none() {
                return Err(common::Error::Config(format!(
                    "account {}: one of refresh_token_env or refresh_token_file is required",
                    account.name
                )));
            }
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("token-keeper.toml")
    }
}

impl AccountConfig {
    fn resolve_secrets(&mut self) -> common::Result<()> {
        let from_env = self
            .refresh_token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .and_then(|value| Secret::from_trimmed(&value));

        self.refresh_token = match (from_env, &self.refresh_token_file) {
            (Some(token), _) => Some(token),
            (None, Some(file)) => {
                let contents = std::fs::read_to_string(file).map_err(|e| {
                    common::Error::Config(format!(
                        "account {}: failed to read refresh_token_file {}: {e}",
                        self.name,
                        file.display()
                    ))
                })?;
                Secret::from_trimmed(&contents)
            }
            (None, None) => None,
        };

        if self.refresh_token.is_none() {
            return Err(common::Error::Config(format!(
                "account {}: no refresh token found",
                self.name
            )));
        }

        self.client_secret = self
            .client_secret_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .and_then(|value| Secret::from_trimmed(&value));

        Ok(())
    }
}
