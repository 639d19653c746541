// Snapshot persistence, one record per account.
//
// Freshness is the caller's decision; the store only records `stored_at`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::account::Account;
use crate::error::{Result, ScoutError};
use crate::persist::write_atomic;
use crate::types::{CacheEntry, Snapshot};

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, account: &Account) -> Result<Option<CacheEntry>>;

    /// Replace the entry for `account`. Storing a snapshot equal to the
    /// current one leaves the entry untouched.
    async fn put(&self, account: &Account, snapshot: Snapshot) -> Result<()>;

    /// Record the archived image path, but only while the stored snapshot is
    /// still the one fetched at `fetched_at`. Returns whether it was recorded.
    /// `stored_at` is left as it was.
    async fn attach_image_path(
        &self,
        account: &Account,
        fetched_at: DateTime<Utc>,
        path: String,
    ) -> Result<bool>;
}

/// JSON file per account under a directory: `<dir>/<account>.json`.
pub struct FileCacheStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles against this directory.
    writes: Mutex<()>,
}

impl FileCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writes: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, account: &Account) -> PathBuf {
        self.dir.join(format!("{account}.json"))
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, account: &Account) -> Result<Option<CacheEntry>> {
        let path = self.path_for(account);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry: CacheEntry = serde_json::from_slice(&bytes).map_err(|e| {
            ScoutError::CacheUnavailable(format!("corrupt record {}: {e}", path.display()))
        })?;
        Ok(Some(entry))
    }

    async fn put(&self, account: &Account, snapshot: Snapshot) -> Result<()> {
        let _guard = self.writes.lock().await;
        if let Ok(Some(existing)) = self.get(account).await {
            if existing.snapshot == snapshot {
                debug!(%account, "Snapshot unchanged, skipping cache write");
                return Ok(());
            }
        }

        let entry = CacheEntry {
            snapshot,
            stored_at: Utc::now(),
        };
        self.write(account, &entry).await?;
        debug!(%account, "Cache entry written");
        Ok(())
    }

    async fn attach_image_path(
        &self,
        account: &Account,
        fetched_at: DateTime<Utc>,
        path: String,
    ) -> Result<bool> {
        let _guard = self.writes.lock().await;
        let Some(entry) = self.get(account).await? else {
            return Ok(false);
        };
        if entry.snapshot.fetched_at != fetched_at {
            return Ok(false);
        }

        let entry = CacheEntry {
            snapshot: entry.snapshot.with_local_path(Some(path)),
            stored_at: entry.stored_at,
        };
        self.write(account, &entry).await?;
        debug!(%account, "Image path recorded");
        Ok(true)
    }
}

impl FileCacheStore {
    async fn write(&self, account: &Account, entry: &CacheEntry) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(entry)?;
        write_atomic(&self.path_for(account), &bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawProfile;

    fn snapshot(account: &Account, followers: u64) -> Snapshot {
        Snapshot::from_raw(
            account.clone(),
            RawProfile {
                followers: Some(followers),
                profile_pic_url: Some("https://x.example/p.jpg".into()),
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn put_then_get_returns_equal_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path());
        let account = Account::parse("nasa").unwrap();
        let snap = snapshot(&account, 100);

        store.put(&account, snap.clone()).await.unwrap();
        let entry = store.get(&account).await.unwrap().unwrap();
        assert_eq!(entry.snapshot, snap);
    }

    #[tokio::test]
    async fn missing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path().join("not-yet-created"));
        assert!(store.get(&Account::parse("nasa").unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn repeated_put_keeps_original_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path());
        let account = Account::parse("nasa").unwrap();
        let snap = snapshot(&account, 100);

        store.put(&account, snap.clone()).await.unwrap();
        let first = store.get(&account).await.unwrap().unwrap();
        store.put(&account, snap).await.unwrap();
        let second = store.get(&account).await.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn newer_snapshot_replaces_older() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path());
        let account = Account::parse("nasa").unwrap();

        store.put(&account, snapshot(&account, 1)).await.unwrap();
        store.put(&account, snapshot(&account, 2)).await.unwrap();
        let entry = store.get(&account).await.unwrap().unwrap();
        assert_eq!(entry.snapshot.follower_count, Some(2));
    }

    #[tokio::test]
    async fn image_path_attaches_only_to_matching_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path());
        let account = Account::parse("nasa").unwrap();

        let older = snapshot(&account, 1);
        store.put(&account, older.clone()).await.unwrap();
        let before = store.get(&account).await.unwrap().unwrap();

        assert!(store
            .attach_image_path(&account, older.fetched_at, "/img/a.jpg".into())
            .await
            .unwrap());
        let entry = store.get(&account).await.unwrap().unwrap();
        assert_eq!(entry.snapshot.profile_image_local_path.as_deref(), Some("/img/a.jpg"));
        assert_eq!(entry.stored_at, before.stored_at);

        let newer = Snapshot::from_raw(
            account.clone(),
            RawProfile {
                followers: Some(2),
                ..Default::default()
            },
            older.fetched_at + chrono::TimeDelta::seconds(5),
        );
        store.put(&account, newer.clone()).await.unwrap();
        assert!(!store
            .attach_image_path(&account, older.fetched_at, "/img/a.jpg".into())
            .await
            .unwrap());
        let entry = store.get(&account).await.unwrap().unwrap();
        assert_eq!(entry.snapshot, newer);
    }

    #[tokio::test]
    async fn corrupt_record_is_cache_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path());
        let account = Account::parse("nasa").unwrap();
        tokio::fs::write(dir.path().join("nasa.json"), b"{not json").await.unwrap();

        assert!(matches!(
            store.get(&account).await,
            Err(ScoutError::CacheUnavailable(_))
        ));
    }
}
