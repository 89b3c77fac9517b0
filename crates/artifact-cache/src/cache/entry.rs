use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::download::Fetcher;
use crate::error::{FetchError, ReadError};
use crate::key::CacheKey;
use crate::reader::Reader;
use crate::storage::Storage;

/// The lifecycle of an [`Entry`], protected by its per-entry lock.
///
/// `Pending` moves to `Materialized` or `Failed` exactly once, and every state moves to
/// `Destroyed` exactly once. `Destroyed` is final.
#[derive(Debug, Clone)]
pub(crate) enum EntryState {
    /// Published in the index, the fetch has not completed yet.
    Pending,
    /// The bytes are fully present at the entry's local path.
    Materialized,
    /// The fetch failed. Callers queued behind the fetch observe the same error.
    Failed(Arc<FetchError>),
    /// The on-disk bytes are gone and the entry is no longer in the index.
    Destroyed,
}

pub(crate) type EntryWriteGuard = OwnedRwLockWriteGuard<EntryState>;
pub(crate) type EntryReadGuard = OwnedRwLockReadGuard<EntryState>;

/// One cached artifact.
///
/// The key, size and paths are immutable after creation. All I/O on the entry's bytes happens
/// while holding its lock: exclusively for fetch and destroy, shared for reads.
pub(crate) struct Entry {
    key: CacheKey,
    size: u64,
    local_path: PathBuf,
    remote_path: String,
    state: Arc<RwLock<EntryState>>,
}

impl Entry {
    pub fn new(key: CacheKey, size: u64, local_path: PathBuf, remote_path: String) -> Arc<Self> {
        Arc::new(Self {
            key,
            size,
            local_path,
            remote_path,
            state: Arc::new(RwLock::new(EntryState::Pending)),
        })
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    /// Acquires the entry lock exclusively.
    pub async fn lock(&self) -> EntryWriteGuard {
        self.state.clone().write_owned().await
    }

    /// Acquires the entry lock shared.
    pub async fn lock_shared(&self) -> EntryReadGuard {
        self.state.clone().read_owned().await
    }

    /// Acquires the entry lock shared, unless someone holds or waits for it exclusively.
    pub fn try_lock_shared(&self) -> Option<EntryReadGuard> {
        self.state.clone().try_read_owned().ok()
    }

    /// Materializes the entry through `fetcher`.
    ///
    /// On success the entry becomes `Materialized`, otherwise `Failed` with the returned error.
    pub async fn fetch(
        &self,
        guard: &mut EntryWriteGuard,
        fetcher: &dyn Fetcher,
    ) -> Result<(), Arc<FetchError>> {
        debug_assert!(self.owns_write(guard));
        debug_assert!(matches!(**guard, EntryState::Pending));

        tracing::debug!(remote_path = %self.remote_path, "Fetching artifact");
        match fetcher
            .fetch(&self.remote_path, &self.local_path, self.size)
            .await
        {
            Ok(()) => {
                tracing::debug!(remote_path = %self.remote_path, "Artifact materialized");
                self.check_size().await;
                **guard = EntryState::Materialized;
                Ok(())
            }
            Err(err) => {
                let err = Arc::new(err);
                **guard = EntryState::Failed(err.clone());
                Err(err)
            }
        }
    }

    /// Reads `member` from the materialized bytes through `reader`.
    pub async fn read(
        &self,
        guard: &EntryReadGuard,
        reader: &dyn Reader,
        member: &str,
    ) -> Result<Bytes, ReadError> {
        debug_assert!(self.owns_read(guard));

        match **guard {
            EntryState::Materialized => reader.read(&self.local_path, member).await,
            _ => Err(ReadError::NotMaterialized),
        }
    }

    /// Deletes the on-disk bytes and marks the entry as `Destroyed`.
    ///
    /// Only the first call touches the filesystem. The entry is `Destroyed` afterwards even if
    /// the deletion failed.
    pub async fn destroy(
        &self,
        guard: &mut EntryWriteGuard,
        storage: &dyn Storage,
    ) -> std::io::Result<()> {
        debug_assert!(self.owns_write(guard));

        if matches!(**guard, EntryState::Destroyed) {
            return Ok(());
        }
        **guard = EntryState::Destroyed;
        storage.delete(&self.local_path).await
    }

    /// Warns when the materialized file disagrees with the size the caller declared.
    ///
    /// The declared size is what the index accounts for, so it is never adjusted.
    async fn check_size(&self) {
        let Ok(metadata) = tokio::fs::metadata(&self.local_path).await else {
            return;
        };
        if metadata.is_file() && metadata.len() != self.size {
            tracing::warn!(
                key = %self.key,
                declared = self.size,
                actual = metadata.len(),
                "Materialized artifact size differs from the declared size"
            );
        }
    }

    fn owns_write(&self, guard: &EntryWriteGuard) -> bool {
        Arc::ptr_eq(OwnedRwLockWriteGuard::rwlock(guard), &self.state)
    }

    fn owns_read(&self, guard: &EntryReadGuard) -> bool {
        Arc::ptr_eq(OwnedRwLockReadGuard::rwlock(guard), &self.state)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("local_path", &self.local_path)
            .field("remote_path", &self.remote_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test::{MockFetcher, MockReader, MockStorage};

    fn entry(dir: &Path, key: &str) -> Arc<Entry> {
        Entry::new(
            key.into(),
            10,
            dir.join(key),
            format!("mem://{key}"),
        )
    }

    #[tokio::test]
    async fn test_fetch_then_read() {
        artifact_cache_test::setup();
        let dir = artifact_cache_test::tempdir();
        let entry = entry(dir.path(), "a");
        let fetcher = MockFetcher::new();
        let reader = MockReader::new();

        let mut guard = entry.lock().await;
        entry.fetch(&mut guard, &fetcher).await.unwrap();
        assert!(matches!(*guard, EntryState::Materialized));

        let guard = guard.downgrade();
        let content = entry.read(&guard, &reader, "f").await.unwrap();
        assert_eq!(&content[..], b"mem://a");
        assert_eq!(fetcher.calls("mem://a"), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch() {
        artifact_cache_test::setup();
        let dir = artifact_cache_test::tempdir();
        let entry = entry(dir.path(), "a");
        let fetcher = MockFetcher::new().failing("mem://a");

        let mut guard = entry.lock().await;
        let err = entry.fetch(&mut guard, &fetcher).await.unwrap_err();
        assert!(matches!(*err, FetchError::NotFound));
        assert!(matches!(&*guard, EntryState::Failed(e) if Arc::ptr_eq(e, &err)));
    }

    #[tokio::test]
    async fn test_read_requires_materialized() {
        let dir = artifact_cache_test::tempdir();
        let entry = entry(dir.path(), "a");
        let reader = MockReader::new();

        let guard = entry.lock_shared().await;
        let result = entry.read(&guard, &reader, "f").await;
        assert!(matches!(result, Err(ReadError::NotMaterialized)));
        assert_eq!(reader.reads(), 0);
    }

    #[tokio::test]
    async fn test_destroy_at_most_once() {
        let dir = artifact_cache_test::tempdir();
        let entry = entry(dir.path(), "a");
        let fetcher = MockFetcher::new();
        let storage = MockStorage::new();

        let mut guard = entry.lock().await;
        entry.fetch(&mut guard, &fetcher).await.unwrap();
        assert!(entry.local_path().exists());

        entry.destroy(&mut guard, &storage).await.unwrap();
        entry.destroy(&mut guard, &storage).await.unwrap();

        assert!(matches!(*guard, EntryState::Destroyed));
        assert!(!entry.local_path().exists());
        assert_eq!(storage.deletes(), 1);
    }

    #[tokio::test]
    async fn test_shared_lock_blocked_by_writer() {
        let dir = artifact_cache_test::tempdir();
        let entry = entry(dir.path(), "a");

        let guard = entry.lock().await;
        assert!(entry.try_lock_shared().is_none());
        drop(guard);

        let first = entry.try_lock_shared();
        assert!(first.is_some());
        assert!(entry.try_lock_shared().is_some());
    }
}
