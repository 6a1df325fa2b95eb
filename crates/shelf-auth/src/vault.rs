//! Credential vault: durable key/value storage for secrets and profiles
//!
//! The rest of the core only talks to `CredentialVault`. Two implementations
//! ship here: `FileVault`, a JSON object file written atomically, and
//! `MemoryVault`, an in-process map for tests and throwaway sessions.
//!
//! Every key this core uses is built through [`keys`], so the on-disk naming
//! scheme stays stable across releases.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Boxed future returned by vault operations.
pub type VaultFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable secure storage injected into the session core.
///
/// Implementations guarantee atomicity per key only. A read that fails is
/// reported as `Err`; callers decide whether that means "absent".
pub trait CredentialVault: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> VaultFuture<'a, Option<String>>;

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> VaultFuture<'a, ()>;

    /// Removing a missing key is not an error.
    fn remove<'a>(&'a self, key: &'a str) -> VaultFuture<'a, ()>;
}

/// Vault key naming scheme.
pub mod keys {
    pub const OAUTH_STATE: &str = "oauth_state";
    pub const OAUTH_CODE_VERIFIER: &str = "oauth_code_verifier";
    pub const OAUTH_PROVIDER_ID: &str = "oauth_provider_id";
    pub const OAUTH_SERVER_URL: &str = "oauth_server_url";
    pub const CURRENT_USER_ID: &str = "current_user_id";
    pub const AVAILABLE_USERS: &str = "available_users";

    pub fn user_profile(user_id: &str) -> String {
        format!("user_profile_{user_id}")
    }

    pub fn user_token(user_id: &str) -> String {
        format!("user_token_{user_id}")
    }

    pub fn user_server(user_id: &str) -> String {
        format!("user_server_{user_id}")
    }
}

/// In-memory vault.
///
/// `fail_reads`/`fail_writes` switch it into an unavailable state so callers
/// can exercise their storage-failure handling. `fail_writes_for` limits
/// write failures to keys with a given prefix.
#[derive(Default)]
pub struct MemoryVault {
    entries: Mutex<HashMap<String, String>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    failing_prefix: Mutex<Option<String>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail `set`/`remove` for keys starting with `prefix`; `None` clears it.
    pub async fn fail_writes_for(&self, prefix: Option<&str>) {
        *self.failing_prefix.lock().await = prefix.map(str::to_owned);
    }

    /// Whether `key` currently holds a value (test inspection helper).
    pub async fn contains(&self, key: &str) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn check_writable(&self, key: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("vault unavailable for writing".into()));
        }
        if let Some(prefix) = self.failing_prefix.lock().await.as_deref() {
            if key.starts_with(prefix) {
                return Err(Error::Storage(format!("vault refused write to {key}")));
            }
        }
        Ok(())
    }
}

impl CredentialVault for MemoryVault {
    fn get<'a>(&'a self, key: &'a str) -> VaultFuture<'a, Option<String>> {
        Box::pin(async move {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(Error::Storage("vault unavailable for reading".into()));
            }
            Ok(self.entries.lock().await.get(key).cloned())
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> VaultFuture<'a, ()> {
        Box::pin(async move {
            self.check_writable(key).await?;
            self.entries
                .lock()
                .await
                .insert(key.to_owned(), value.to_owned());
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> VaultFuture<'a, ()> {
        Box::pin(async move {
            self.check_writable(key).await?;
            self.entries.lock().await.remove(key);
            Ok(())
        })
    }
}

/// File-backed vault.
///
/// The whole map is kept in memory and rewritten on every mutation. The
/// Mutex serializes writers; reads clone a single value under the lock.
pub struct FileVault {
    path: PathBuf,
    state: Mutex<HashMap<String, String>>,
}

impl FileVault {
    /// Open the vault file, creating it as `{}` if it does not exist.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Storage(format!("reading vault file: {e}")))?;
            let entries: HashMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::Serialization(format!("parsing vault file: {e}")))?;
            info!(path = %path.display(), entries = entries.len(), "loaded credential vault");
            entries
        } else {
            info!(path = %path.display(), "vault file not found, starting empty");
            let entries = HashMap::new();
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| Error::Storage(format!("creating vault directory: {e}")))?;
            }
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialVault for FileVault {
    fn get<'a>(&'a self, key: &'a str) -> VaultFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> VaultFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();
            next.insert(key.to_owned(), value.to_owned());
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(key, "vault entry set");
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> VaultFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.contains_key(key) {
                return Ok(());
            }
            let mut next = state.clone();
            next.remove(key);
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(key, "vault entry removed");
            Ok(())
        })
    }
}

/// Write the vault map to `path` via temp file + rename, mode 0600 on unix.
async fn write_atomic(path: &Path, data: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Serialization(format!("serializing vault: {e}")))?;

    let dir = path
        .parent()
        .map(|d| if d.as_os_str().is_empty() { Path::new(".") } else { d })
        .ok_or_else(|| Error::Storage("vault path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".vault.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Storage(format!("writing temp vault file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Storage(format!("setting vault file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Storage(format!("renaming temp vault file: {e}")))?;

    debug!(path = %path.display(), "persisted vault");
    Ok(())
}
