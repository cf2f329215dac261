//! Persistence backends for the account store
//!
//! The store always hands the backend a full snapshot; backends never see
//! partial updates. `JsonFileBackend` keeps a JSON array on disk and writes
//! it atomically (temp file + rename) so a crash mid-write leaves the
//! previous file intact.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;

use tracing::{debug, info};

use crate::account::Account;
use crate::error::{Error, Result};

/// Durable storage for account snapshots.
pub trait Backend: Send + Sync {
    /// Read every stored account.
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Account>>> + Send + '_>>;

    /// Replace the stored state with `accounts`.
    fn persist<'a>(
        &'a self,
        accounts: &'a [Account],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// JSON array file with owner-only permissions.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Backend for JsonFileBackend {
    /// A missing file is a cold start: it is created as `[]`.
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Account>>> + Send + '_>> {
        Box::pin(async move {
            if !self.path.exists() {
                info!(path = %self.path.display(), "account file not found, starting with empty store");
                write_atomic(&self.path, &[]).await?;
                return Ok(Vec::new());
            }

            let contents = tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|e| Error::Io(format!("reading account file: {e}")))?;
            let accounts: Vec<Account> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing account file: {e}")))?;
            info!(path = %self.path.display(), accounts = accounts.len(), "loaded accounts");
            Ok(accounts)
        })
    }

    fn persist<'a>(
        &'a self,
        accounts: &'a [Account],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(write_atomic(&self.path, accounts))
    }
}

/// Non-durable backend. Keeps the last persisted snapshot in memory.
#[derive(Default)]
pub struct MemoryBackend {
    snapshot: Mutex<Vec<Account>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the backend, as if a previous run had persisted `accounts`.
    pub fn with_accounts(accounts: Vec<Account>) -> Self {
        Self {
            snapshot: Mutex::new(accounts),
        }
    }

    fn snapshot(&self) -> Vec<Account> {
        match self.snapshot.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Backend for MemoryBackend {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Account>>> + Send + '_>> {
        let accounts = self.snapshot();
        Box::pin(async move { Ok(accounts) })
    }

    fn persist<'a>(
        &'a self,
        accounts: &'a [Account],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        let mut guard = match self.snapshot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = accounts.to_vec();
        drop(guard);
        Box::pin(async { Ok(()) })
    }
}

/// Write the account list atomically with 0600 permissions on unix.
async fn write_atomic(path: &Path, accounts: &[Account]) -> Result<()> {
    let json = serde_json::to_string_pretty(accounts)
        .map_err(|e| Error::Parse(format!("serializing accounts: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("account path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp account file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting account file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp account file: {e}")))?;

    debug!(path = %path.display(), accounts = accounts.len(), "persisted accounts");
    Ok(())
}
