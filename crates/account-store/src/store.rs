use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::model::{Account, LockoutState, NewAccount};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("account not found")]
    NotFound,
    #[error("username {0} is already taken")]
    Exists(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode account table: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Key-value-by-username account storage.
///
/// Every lockout mutation is one atomic operation scoped to a single account:
/// two callers racing on the same username can never lose an increment or a
/// lock transition. `Ok(None)` from a lockout operation means the account does
/// not exist.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn create(&self, account: NewAccount) -> Result<Account, StoreError>;

    async fn find_by_username(&self, username: &str) -> Result<Option<Account>, StoreError>;

    async fn find_by_id(&self, id: i64) -> Result<Option<Account>, StoreError>;

    async fn set_active(
        &self,
        id: i64,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Read the lockout columns, clearing a lock whose deadline has passed in
    /// the same step.
    async fn read_lockout_clearing_expired(
        &self,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LockoutState>, StoreError>;

    /// Increment the failure counter and, once it reaches `threshold`, set
    /// `locked_until = now + lock_for` in the same update.
    async fn record_failure(
        &self,
        username: &str,
        threshold: u32,
        now: DateTime<Utc>,
        lock_for: Duration,
    ) -> Result<Option<LockoutState>, StoreError>;

    async fn reset_lockout(&self, username: &str) -> Result<Option<LockoutState>, StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AccountTable {
    next_id: i64,
    accounts: BTreeMap<i64, Account>,
    #[serde(skip)]
    by_username: HashMap<String, i64>,
}

impl AccountTable {
    fn reindex(&mut self) {
        self.by_username = self
            .accounts
            .values()
            .map(|account| (account.username.clone(), account.id))
            .collect();
        let max_id = self.accounts.keys().next_back().copied().unwrap_or(0);
        self.next_id = self.next_id.max(max_id);
    }

    fn get(&self, username: &str) -> Option<&Account> {
        self.by_username
            .get(username)
            .and_then(|id| self.accounts.get(id))
    }

    fn get_mut(&mut self, username: &str) -> Option<&mut Account> {
        let id = *self.by_username.get(username)?;
        self.accounts.get_mut(&id)
    }

    fn create(&mut self, new: NewAccount) -> Result<Account, StoreError> {
        if self.by_username.contains_key(&new.username) {
            return Err(StoreError::Exists(new.username));
        }
        self.next_id += 1;
        let account = Account {
            id: self.next_id,
            username: new.username,
            email: new.email,
            password_hash: new.password_hash,
            is_active: true,
            created_at: new.created_at,
            deactivated_at: None,
            failed_attempts: 0,
            locked_until: None,
        };
        self.by_username
            .insert(account.username.clone(), account.id);
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    fn set_active(&mut self, id: i64, active: bool, now: DateTime<Utc>) -> Result<(), StoreError> {
        let account = self.accounts.get_mut(&id).ok_or(StoreError::NotFound)?;
        account.is_active = active;
        account.deactivated_at = if active { None } else { Some(now) };
        Ok(())
    }

    /// Returns the state plus whether anything was written.
    fn read_lockout_clearing_expired(
        &mut self,
        username: &str,
        now: DateTime<Utc>,
    ) -> Option<(LockoutState, bool)> {
        let account = self.get_mut(username)?;
        let expired = matches!(account.locked_until, Some(until) if until <= now);
        if expired {
            account.failed_attempts = 0;
            account.locked_until = None;
        }
        Some((account.lockout(), expired))
    }

    fn record_failure(
        &mut self,
        username: &str,
        threshold: u32,
        now: DateTime<Utc>,
        lock_for: Duration,
    ) -> Option<LockoutState> {
        let account = self.get_mut(username)?;
        if matches!(account.locked_until, Some(until) if until <= now) {
            account.failed_attempts = 0;
            account.locked_until = None;
        }
        account.failed_attempts = account.failed_attempts.saturating_add(1);
        if account.failed_attempts >= threshold && account.locked_until.is_none() {
            account.locked_until = Some(now + lock_for);
        }
        Some(account.lockout())
    }

    fn reset_lockout(&mut self, username: &str) -> Option<LockoutState> {
        let account = self.get_mut(username)?;
        account.failed_attempts = 0;
        account.locked_until = None;
        Some(account.lockout())
    }
}

/// Process-local store. State is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    table: RwLock<AccountTable>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn create(&self, account: NewAccount) -> Result<Account, StoreError> {
        self.table.write().await.create(account)
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.table.read().await.get(username).cloned())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Account>, StoreError> {
        Ok(self.table.read().await.accounts.get(&id).cloned())
    }

    async fn set_active(
        &self,
        id: i64,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.table.write().await.set_active(id, active, now)
    }

    async fn read_lockout_clearing_expired(
        &self,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LockoutState>, StoreError> {
        Ok(self
            .table
            .write()
            .await
            .read_lockout_clearing_expired(username, now)
            .map(|(state, _)| state))
    }

    async fn record_failure(
        &self,
        username: &str,
        threshold: u32,
        now: DateTime<Utc>,
        lock_for: Duration,
    ) -> Result<Option<LockoutState>, StoreError> {
        Ok(self
            .table
            .write()
            .await
            .record_failure(username, threshold, now, lock_for))
    }

    async fn reset_lockout(&self, username: &str) -> Result<Option<LockoutState>, StoreError> {
        Ok(self.table.write().await.reset_lockout(username))
    }
}

/// Account table persisted as a JSON document.
///
/// The file is rewritten after every mutation while the table's write lock is
/// still held, so the snapshot on disk always matches one serialised order of
/// updates. A mutation whose write fails is discarded from memory as well.
#[derive(Debug)]
pub struct JsonFileAccountStore {
    path: PathBuf,
    table: RwLock<AccountTable>,
}

impl JsonFileAccountStore {
    /// Open the store at `path`. A missing file is an empty table.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut table = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<AccountTable>(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => AccountTable::default(),
            Err(err) => return Err(StoreError::Io(err)),
        };
        table.reindex();
        tracing::debug!(path = %path.display(), accounts = table.accounts.len(), "opened account store");
        Ok(Self {
            path,
            table: RwLock::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `table` to a sibling temp file, then rename it over the snapshot.
    async fn persist(&self, table: &AccountTable) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(table)?;
        let staging = self.staging_path();
        let written: std::io::Result<()> = async {
            let mut file = fs::File::create(&staging).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            fs::rename(&staging, &self.path).await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&staging).await;
            tracing::error!(path = %self.path.display(), error = %err, "failed to persist account store");
            return Err(StoreError::Io(err));
        }
        Ok(())
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "accounts.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Apply `change` to a copy of the table and keep it only once the copy
    /// is on disk. `change` reports whether anything needs writing.
    async fn commit<T>(
        &self,
        change: impl FnOnce(&mut AccountTable) -> Result<(T, bool), StoreError>,
    ) -> Result<T, StoreError> {
        let mut table = self.table.write().await;
        let mut staged = table.clone();
        let (value, dirty) = change(&mut staged)?;
        if dirty {
            self.persist(&staged).await?;
            *table = staged;
        }
        Ok(value)
    }
}

#[async_trait]
impl AccountStore for JsonFileAccountStore {
    async fn create(&self, account: NewAccount) -> Result<Account, StoreError> {
        self.commit(|table| Ok((table.create(account)?, true)))
            .await
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.table.read().await.get(username).cloned())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Account>, StoreError> {
        Ok(self.table.read().await.accounts.get(&id).cloned())
    }

    async fn set_active(
        &self,
        id: i64,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.commit(|table| Ok((table.set_active(id, active, now)?, true)))
            .await
    }

    async fn read_lockout_clearing_expired(
        &self,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LockoutState>, StoreError> {
        self.commit(|table| {
            Ok(match table.read_lockout_clearing_expired(username, now) {
                Some((state, cleared)) => (Some(state), cleared),
                None => (None, false),
            })
        })
        .await
    }

    async fn record_failure(
        &self,
        username: &str,
        threshold: u32,
        now: DateTime<Utc>,
        lock_for: Duration,
    ) -> Result<Option<LockoutState>, StoreError> {
        self.commit(|table| {
            let state = table.record_failure(username, threshold, now, lock_for);
            let dirty = state.is_some();
            Ok((state, dirty))
        })
        .await
    }

    async fn reset_lockout(&self, username: &str) -> Result<Option<LockoutState>, StoreError> {
        self.commit(|table| {
            let state = table.reset_lockout(username);
            let dirty = state.is_some();
            Ok((state, dirty))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_account(username: &str) -> NewAccount {
        NewAccount {
            username: username.to_string(),
            email: format!("{username}@example.com"),
            password_hash: "hash".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let store = MemoryAccountStore::new();
        store.create(new_account("alice")).await.unwrap();
        assert!(matches!(
            store.create(new_account("alice")).await,
            Err(StoreError::Exists(name)) if name == "alice"
        ));
    }

    #[tokio::test]
    async fn failure_sets_lock_exactly_at_threshold() {
        let store = MemoryAccountStore::new();
        store.create(new_account("alice")).await.unwrap();
        let now = Utc::now();

        for expected in 1..3 {
            let state = store
                .record_failure("alice", 3, now, Duration::minutes(15))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(state.failed_attempts, expected);
            assert!(state.locked_until.is_none());
        }

        let state = store
            .record_failure("alice", 3, now, Duration::minutes(15))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.failed_attempts, 3);
        assert_eq!(state.locked_until, Some(now + Duration::minutes(15)));

        // a later failure does not push the deadline out
        let state = store
            .record_failure("alice", 3, now + Duration::minutes(1), Duration::minutes(15))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.locked_until, Some(now + Duration::minutes(15)));
    }

    #[tokio::test]
    async fn expired_lock_is_cleared_on_read() {
        let store = MemoryAccountStore::new();
        store.create(new_account("alice")).await.unwrap();
        let now = Utc::now();
        store
            .record_failure("alice", 1, now, Duration::minutes(15))
            .await
            .unwrap();

        let state = store
            .read_lockout_clearing_expired("alice", now + Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();
        assert!(state.locked_until.is_some());

        let state = store
            .read_lockout_clearing_expired("alice", now + Duration::minutes(15))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            state,
            LockoutState {
                failed_attempts: 0,
                locked_until: None
            }
        );
    }

    #[tokio::test]
    async fn unknown_account_is_none() {
        let store = MemoryAccountStore::new();
        let now = Utc::now();
        assert!(store
            .record_failure("ghost", 5, now, Duration::minutes(15))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .read_lockout_clearing_expired("ghost", now)
            .await
            .unwrap()
            .is_none());
        assert!(store.reset_lockout("ghost").await.unwrap().is_none());
        assert!(matches!(
            store.set_active(99, false, now).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn concurrent_failures_are_not_lost() {
        let store = std::sync::Arc::new(MemoryAccountStore::new());
        store.create(new_account("alice")).await.unwrap();
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .record_failure("alice", 1000, now, Duration::minutes(15))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let account = store.find_by_username("alice").await.unwrap().unwrap();
        assert_eq!(account.failed_attempts, 50);
    }
}
