//! Account store with optimistic concurrency
//!
//! A tokio Mutex serializes every mutation, and persistence happens while the
//! lock is held so the on-disk snapshot always matches memory. Reads clone
//! records out under the lock and never wait on network calls.
//!
//! Each record carries a `revision`. `upsert` only succeeds when the caller's
//! revision matches the stored one, then bumps it. Callers that lose a race
//! get `VersionConflict` and re-read.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::account::{Account, AccountFilter};
use crate::backend::{Backend, JsonFileBackend, MemoryBackend};
use crate::error::{Error, Result};

pub struct AccountStore {
    backend: Box<dyn Backend>,
    state: Mutex<BTreeMap<String, Account>>,
}

impl AccountStore {
    /// Open a JSON-file store. A missing file starts an empty store.
    pub async fn load(path: PathBuf) -> Result<Self> {
        Self::open(Box::new(JsonFileBackend::new(path))).await
    }

    /// Open a store over any backend, loading its current contents.
    pub async fn open(backend: Box<dyn Backend>) -> Result<Self> {
        let accounts = backend.load().await?;
        let state = accounts
            .into_iter()
            .map(|account| (account.id.clone(), account))
            .collect();
        Ok(Self {
            backend,
            state: Mutex::new(state),
        })
    }

    /// Empty, non-durable store.
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryBackend::new()),
            state: Mutex::new(BTreeMap::new()),
        }
    }

    /// Get a clone of one account.
    pub async fn get(&self, id: &str) -> Option<Account> {
        let state = self.state.lock().await;
        state.get(id).cloned()
    }

    /// Accounts matching `filter`, sorted by id.
    pub async fn list(&self, filter: &AccountFilter) -> Vec<Account> {
        let state = self.state.lock().await;
        state
            .values()
            .filter(|account| filter.matches(account))
            .cloned()
            .collect()
    }

    /// Insert or replace an account and persist.
    ///
    /// `account.revision` must equal the stored revision (0 for a new id).
    /// Returns the stored copy with its revision bumped. On a persistence
    /// failure the in-memory change is rolled back.
    pub async fn upsert(&self, account: Account) -> Result<Account> {
        let mut state = self.state.lock().await;

        let actual = state.get(&account.id).map(|a| a.revision).unwrap_or(0);
        if account.revision != actual {
            debug!(
                account_id = %account.id,
                expected = account.revision,
                actual,
                "rejecting stale account write"
            );
            return Err(Error::VersionConflict {
                id: account.id,
                expected: account.revision,
                actual,
            });
        }

        self.write(&mut state, account).await
    }

    /// Insert a new account unless one with the same email (compared
    /// case-insensitively) or id already exists. The check and the write
    /// happen under one lock.
    pub async fn insert_unique(&self, account: Account) -> Result<Account> {
        let mut state = self.state.lock().await;

        if state
            .values()
            .any(|existing| existing.email.eq_ignore_ascii_case(&account.email))
        {
            return Err(Error::DuplicateEmail(account.email));
        }
        if let Some(existing) = state.get(&account.id) {
            return Err(Error::VersionConflict {
                id: account.id,
                expected: 0,
                actual: existing.revision,
            });
        }

        self.write(&mut state, Account { revision: 0, ..account }).await
    }

    async fn write(
        &self,
        state: &mut BTreeMap<String, Account>,
        mut account: Account,
    ) -> Result<Account> {
        account.revision += 1;
        let id = account.id.clone();
        let previous = state.insert(id.clone(), account.clone());

        let snapshot: Vec<Account> = state.values().cloned().collect();
        if let Err(e) = self.backend.persist(&snapshot).await {
            warn!(account_id = %id, error = %e, "persist failed, rolling back account write");
            match previous {
                Some(previous) => state.insert(id, previous),
                None => state.remove(&id),
            };
            return Err(e);
        }

        debug!(account_id = %id, revision = account.revision, "stored account");
        Ok(account)
    }

    /// Remove an account and persist. Returns the removed record if it existed.
    pub async fn remove(&self, id: &str) -> Result<Option<Account>> {
        let mut state = self.state.lock().await;
        let Some(removed) = state.remove(id) else {
            return Ok(None);
        };

        let snapshot: Vec<Account> = state.values().cloned().collect();
        if let Err(e) = self.backend.persist(&snapshot).await {
            warn!(account_id = id, error = %e, "persist failed, restoring removed account");
            state.insert(id.to_string(), removed);
            return Err(e);
        }

        debug!(account_id = id, "removed account");
        Ok(Some(removed))
    }

    /// Number of stored accounts.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountStatus;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Backend whose writes fail while `failing` is set.
    struct FlakyBackend {
        failing: Arc<AtomicBool>,
    }

    impl Backend for FlakyBackend {
        fn load(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Account>>> + Send + '_>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn persist<'a>(
            &'a self,
            _accounts: &'a [Account],
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            let failing = self.failing.load(Ordering::SeqCst);
            Box::pin(async move {
                if failing {
                    Err(Error::Io("disk full".into()))
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test]
    async fn upsert_bumps_revision() {
        let store = AccountStore::in_memory();
        let stored = store
            .upsert(Account::new("a@example.com", "cred"))
            .await
            .unwrap();
        assert_eq!(stored.revision, 1);

        let mut next = stored.clone();
        next.status = AccountStatus::Active;
        let stored = store.upsert(next).await.unwrap();
        assert_eq!(stored.revision, 2);
        assert_eq!(
            store.get(&stored.id).await.unwrap().status,
            AccountStatus::Active
        );
    }

    #[tokio::test]
    async fn stale_upsert_is_a_version_conflict() {
        let store = AccountStore::in_memory();
        let stored = store
            .upsert(Account::new("a@example.com", "cred"))
            .await
            .unwrap();

        let stale = stored.clone();
        let mut fresh = stored.clone();
        fresh.consecutive_failures = 1;
        store.upsert(fresh).await.unwrap();

        let err = store.upsert(stale).await.unwrap_err();
        match err {
            Error::VersionConflict {
                id,
                expected,
                actual,
            } => {
                assert_eq!(id, stored.id);
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected VersionConflict, got {other:?}"),
        }
        assert_eq!(
            store.get(&stored.id).await.unwrap().consecutive_failures,
            1
        );
    }

    #[tokio::test]
    async fn new_id_with_nonzero_revision_conflicts() {
        let store = AccountStore::in_memory();
        let mut account = Account::new("a@example.com", "cred");
        account.revision = 3;
        let err = store.upsert(account).await.unwrap_err();
        assert!(
            matches!(err, Error::VersionConflict { expected: 3, actual: 0, .. }),
            "got {err:?}"
        );
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");

        let store = AccountStore::load(path.clone()).await.unwrap();
        let mut account = Account::new("a@example.com", "cred");
        account.status = AccountStatus::Active;
        account.session = Some("sess-1".into());
        account.next_eligible.video = Some(123);
        let stored = store.upsert(account).await.unwrap();

        let reloaded = AccountStore::load(path).await.unwrap();
        let loaded = reloaded.get(&stored.id).await.unwrap();
        assert_eq!(loaded, stored);
        assert_eq!(loaded.revision, 1);
    }

    #[tokio::test]
    async fn list_is_sorted_and_filtered() {
        let store = AccountStore::in_memory();
        let mut ids = Vec::new();
        for (i, status) in [
            AccountStatus::Active,
            AccountStatus::Disabled,
            AccountStatus::Active,
        ]
        .into_iter()
        .enumerate()
        {
            let mut account = Account::new(format!("user{i}@example.com"), "cred");
            account.status = status;
            ids.push(store.upsert(account).await.unwrap().id);
        }
        ids.sort();

        let all: Vec<String> = store
            .list(&AccountFilter::all())
            .await
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(all, ids);

        let active = store.list(&AccountFilter::status(AccountStatus::Active)).await;
        assert_eq!(active.len(), 2);

        let by_email = store.list(&AccountFilter::email("user1@example.com")).await;
        assert_eq!(by_email.len(), 1);
        assert_eq!(by_email[0].status, AccountStatus::Disabled);
    }

    #[tokio::test]
    async fn remove_returns_record_once() {
        let store = AccountStore::in_memory();
        let stored = store
            .upsert(Account::new("a@example.com", "cred"))
            .await
            .unwrap();

        let removed = store.remove(&stored.id).await.unwrap();
        assert_eq!(removed.map(|a| a.id), Some(stored.id.clone()));
        assert!(store.remove(&stored.id).await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn failed_persist_rolls_back() {
        let failing = Arc::new(AtomicBool::new(false));
        let store = AccountStore::open(Box::new(FlakyBackend {
            failing: failing.clone(),
        }))
        .await
        .unwrap();

        let stored = store
            .upsert(Account::new("a@example.com", "cred"))
            .await
            .unwrap();

        failing.store(true, Ordering::SeqCst);

        let mut changed = stored.clone();
        changed.status = AccountStatus::Disabled;
        assert!(matches!(store.upsert(changed).await, Err(Error::Io(_))));
        let current = store.get(&stored.id).await.unwrap();
        assert_eq!(current.status, AccountStatus::AuthExpired);
        assert_eq!(current.revision, 1);

        assert!(store.upsert(Account::new("b@example.com", "cred")).await.is_err());
        assert_eq!(store.len().await, 1);

        assert!(store.remove(&stored.id).await.is_err());
        assert!(store.get(&stored.id).await.is_some());
    }

    #[tokio::test]
    async fn concurrent_writes_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let store = Arc::new(AccountStore::load(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .upsert(Account::new(format!("user{i}@example.com"), "cred"))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.len().await, 10);
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: Vec<Account> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 10);
    }

    #[tokio::test]
    async fn insert_unique_rejects_duplicate_email() {
        let store = AccountStore::in_memory();
        let first = store
            .insert_unique(Account::new("Dup@example.com", "cred"))
            .await
            .unwrap();
        assert_eq!(first.revision, 1);

        let err = store
            .insert_unique(Account::new("dup@EXAMPLE.com", "other"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateEmail(_)), "got {err:?}");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_unique_inserts_admit_one() {
        let store = Arc::new(AccountStore::in_memory());

        let mut handles = vec![];
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert_unique(Account::new("same@example.com", "cred"))
                    .await
                    .is_ok()
            }));
        }
        let mut inserted = 0;
        for h in handles {
            if h.await.unwrap() {
                inserted += 1;
            }
        }

        assert_eq!(inserted, 1);
        assert_eq!(store.len().await, 1);
    }
}
