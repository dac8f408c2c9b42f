//! Key-value persistence for credentials
//!
//! Refreshed credentials can be written through a `TokenStore` so a restart
//! resumes from the last refresh token instead of logging in again. Keys are
//! opaque strings chosen by the integration (usually a cache key digest).
//!
//! `FileTokenStore` keeps a JSON object `{ key: credential }` on disk. All
//! writes use atomic temp-file + rename and a tokio Mutex serializes writers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::BoxFuture;
use crate::credential::Credential;
use crate::error::{Error, Result};

/// Get/set persistence consumed by token sources.
pub trait TokenStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Credential>>>;

    fn set<'a>(&'a self, key: &'a str, credential: &'a Credential) -> BoxFuture<'a, Result<()>>;

    /// Remove a key, returning the stored credential if there was one.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Credential>>>;
}

/// Process-local store, nothing survives a restart.
#[derive(Default)]
pub struct MemoryTokenStore {
    state: Mutex<HashMap<String, Credential>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Credential>>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, credential: &'a Credential) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.state
                .lock()
                .await
                .insert(key.to_string(), credential.clone());
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Credential>>> {
        Box::pin(async move { Ok(self.state.lock().await.remove(key)) })
    }
}

/// JSON file backed store.
///
/// The file is read once at load time; the in-memory map is the source of
/// truth afterwards and every mutation rewrites the whole file.
pub struct FileTokenStore {
    path: PathBuf,
    state: Mutex<HashMap<String, Credential>>,
}

impl FileTokenStore {
    /// Load credentials from the given file path.
    ///
    /// A missing file is a cold start: the store begins empty and the file is
    /// created on first write.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let credentials: HashMap<String, Credential> = serde_json::from_str(&contents)
                    .map_err(|e| Error::CredentialParse(format!("parsing token file: {e}")))?;
                info!(path = %path.display(), entries = credentials.len(), "loaded stored tokens");
                credentials
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "token file not found, starting with empty store");
                HashMap::new()
            }
            Err(e) => return Err(Error::Io(format!("reading token file: {e}"))),
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl TokenStore for FileTokenStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Credential>>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, credential: &'a Credential) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.insert(key.to_string(), credential.clone());
            debug!(key, "stored token");
            write_atomic(&self.path, &state).await
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Credential>>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let removed = state.remove(key);
            if removed.is_some() {
                debug!(key, "removed stored token");
                write_atomic(&self.path, &state).await?;
            }
            Ok(removed)
        })
    }
}

/// Distinguishes temp files of concurrent writes within one process.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write the token map atomically with owner-only permissions.
///
/// The temp file lives next to the target and is named after it, so stores
/// sharing a directory never rename each other's data into place.
async fn write_atomic(path: &Path, data: &HashMap<String, Credential>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing tokens: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("token file path has no parent directory".into()))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Io("token file path has no file name".into()))?
        .to_string_lossy();
    let tmp_path = dir.join(format!(
        ".{file_name}.tmp.{}.{}",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting token file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp token file: {e}")))?;

    debug!(path = %path.display(), "persisted tokens");
    Ok(())
}
