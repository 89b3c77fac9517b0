//! The fixed-capacity artifact cache.
//!
//! # Locking
//!
//! There are two kinds of locks:
//!
//! - The global lock, a [`Mutex`] around the [`Index`]. It is held while the index is consulted
//!   or mutated, while evicting, and while handing off to an entry lock. It is never held
//!   while fetching or reading.
//! - One [`RwLock`](tokio::sync::RwLock) per entry. Fetching and destroying the on-disk bytes
//!   take it exclusively, serving a member takes it shared.
//!
//! Locks are always acquired in the order global → entry.
//!
//! A new entry is locked exclusively *before* it is published in the index, so every other
//! caller that finds it queues on the entry lock until the fetch is done. An evictor that
//! finds it at the head of the eviction order waits the same way.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::{Config, EvictionPolicy};
use crate::download::{DownloadService, Fetcher};
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::reader::{ArtifactReader, Reader};
use crate::storage::{LocalStorage, Storage};

use self::entry::{Entry, EntryReadGuard, EntryState};
use self::index::Index;

mod entry;
mod index;

/// A point-in-time snapshot of the cache's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of entries in the index.
    pub entries: usize,
    /// Sum of the declared sizes of all entries.
    pub current_size: u64,
    pub capacity: u64,
    /// Calls served from an entry that was already materialized, or waited for its fetch.
    pub hits: u64,
    /// Calls that inserted a new entry and fetched it.
    pub misses: u64,
    pub evictions: u64,
    pub fetch_failures: u64,
}

/// A fixed-capacity local cache of remote artifacts.
///
/// See the [module docs](self) for the locking discipline.
pub struct ArtifactCache {
    index: Mutex<Index>,
    capacity: u64,
    policy: EvictionPolicy,
    fetcher: Arc<dyn Fetcher>,
    reader: Arc<dyn Reader>,
    storage: Arc<dyn Storage>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    fetch_failures: AtomicU64,
    /// Holds hit callers after they released the global lock, before they wait for the entry.
    #[cfg(test)]
    hand_off_gate: Option<Arc<crate::test::Gate>>,
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ArtifactCache {
    /// Creates an empty cache holding at most `capacity` bytes.
    ///
    /// Evicted bytes are removed with [`LocalStorage`], and entries are evicted in insertion
    /// order.
    pub fn new(capacity: u64, fetcher: Arc<dyn Fetcher>, reader: Arc<dyn Reader>) -> Self {
        Self {
            index: Mutex::new(Index::new(capacity)),
            capacity,
            policy: EvictionPolicy::Fifo,
            fetcher,
            reader,
            storage: Arc::new(LocalStorage::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            #[cfg(test)]
            hand_off_gate: None,
        }
    }

    /// Replaces the [`Storage`] used to delete evicted bytes.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_policy(mut self, policy: EvictionPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[cfg(test)]
    fn with_hand_off_gate(mut self, gate: Arc<crate::test::Gate>) -> Self {
        self.hand_off_gate = Some(gate);
        self
    }

    /// Creates a cache with a [`DownloadService`] and an [`ArtifactReader`].
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        if config.cache.capacity == 0 {
            anyhow::bail!("cache capacity must be positive");
        }
        let fetcher = DownloadService::new(config)?;
        let cache = Self::new(
            config.cache.capacity,
            Arc::new(fetcher),
            Arc::new(ArtifactReader::new()),
        );
        Ok(cache.with_policy(config.cache.policy))
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns `member` of the artifact identified by `key`.
    ///
    /// On a miss, the artifact is fetched from `remote_path` into `local_path` first, evicting
    /// the oldest entries until `size` bytes fit. Concurrent calls for the same key fetch it
    /// only once.
    ///
    /// `size` is trusted: it is what the cache accounts for, regardless of the number of bytes
    /// the fetch actually produces.
    pub async fn get(
        &self,
        key: impl Into<CacheKey>,
        size: u64,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        member: &str,
    ) -> Result<Bytes, CacheError> {
        self.get_member(key.into(), size, local_path.into(), remote_path.into(), member)
            .await
    }

    #[tracing::instrument(skip_all, fields(key = %key, size = size))]
    async fn get_member(
        &self,
        key: CacheKey,
        size: u64,
        local_path: PathBuf,
        remote_path: String,
        member: &str,
    ) -> Result<Bytes, CacheError> {
        if size == 0 {
            return Err(CacheError::InvalidSize);
        }
        if size > self.capacity {
            return Err(CacheError::Oversize {
                size,
                capacity: self.capacity,
            });
        }

        loop {
            let mut index = self.index.lock().await;

            let reserve = match index.lookup(&key) {
                Some(_) => 0,
                None => size,
            };
            self.evict(&mut index, reserve).await;

            if let Some(entry) = index.lookup(&key).cloned() {
                if self.policy == EvictionPolicy::Lru {
                    index.touch(&key);
                }

                let guard = match entry.try_lock_shared() {
                    Some(guard) => {
                        drop(index);
                        tracing::trace!("Handed off to entry lock");
                        guard
                    }
                    None => {
                        // The entry is still being fetched. Do not wait for that under the
                        // global lock, the state is checked again below.
                        drop(index);
                        #[cfg(test)]
                        {
                            if let Some(gate) = &self.hand_off_gate {
                                gate.pass().await;
                            }
                        }
                        tracing::trace!("Waiting for in-flight fetch");
                        entry.lock_shared().await
                    }
                };

                let state = (*guard).clone();
                match state {
                    EntryState::Materialized => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return self.read(&entry, &guard, member).await;
                    }
                    EntryState::Failed(source) => {
                        return Err(CacheError::Fetch {
                            remote_path: entry.remote_path().to_owned(),
                            source,
                        });
                    }
                    EntryState::Destroyed => {
                        tracing::trace!("Entry was destroyed while waiting, retrying");
                        continue;
                    }
                    EntryState::Pending => {
                        // The caller that was fetching the entry went away.
                        tracing::debug!("Discarding abandoned entry");
                        drop(guard);
                        self.discard(&entry).await;
                        continue;
                    }
                }
            }

            let entry = Entry::new(key, size, local_path, remote_path);
            let mut guard = entry.lock().await;
            index.insert(entry.clone());
            drop(index);
            self.misses.fetch_add(1, Ordering::Relaxed);

            return match entry.fetch(&mut guard, &*self.fetcher).await {
                Ok(()) => {
                    let guard = guard.downgrade();
                    self.read(&entry, &guard, member).await
                }
                Err(source) => {
                    self.fetch_failures.fetch_add(1, Ordering::Relaxed);
                    drop(guard);
                    self.discard(&entry).await;
                    Err(CacheError::Fetch {
                        remote_path: entry.remote_path().to_owned(),
                        source,
                    })
                }
            };
        }
    }

    /// Evicts from the head of the index until `reserve` more bytes fit.
    ///
    /// Waits for the entry lock of each victim, so readers of a victim finish first.
    async fn evict(&self, index: &mut Index, reserve: u64) {
        while !index.fits(reserve) {
            let Some(victim) = index.head().cloned() else {
                break;
            };
            tracing::debug!(victim = %victim.key(), size = victim.size(), "Evicting artifact");

            let mut guard = victim.lock().await;
            if let Err(source) = victim.destroy(&mut guard, &*self.storage).await {
                log_evict_error(&victim, source);
            }
            drop(guard);

            index.remove_oldest();
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Removes exactly this entry from the index and deletes whatever bytes it left behind.
    async fn discard(&self, entry: &Arc<Entry>) {
        let mut index = self.index.lock().await;
        if index.remove(entry) {
            tracing::debug!(key = %entry.key(), "Removed entry from the index");
        }

        let mut guard = entry.lock().await;
        if let Err(source) = entry.destroy(&mut guard, &*self.storage).await {
            log_evict_error(entry, source);
        }
    }

    async fn read(
        &self,
        entry: &Entry,
        guard: &EntryReadGuard,
        member: &str,
    ) -> Result<Bytes, CacheError> {
        entry
            .read(guard, &*self.reader, member)
            .await
            .map_err(|source| CacheError::Read {
                member: member.to_owned(),
                source,
            })
    }

    pub async fn stats(&self) -> CacheStats {
        let index = self.index.lock().await;
        CacheStats {
            entries: index.len(),
            current_size: index.current_size(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
        }
    }

    /// All keys in eviction order, the next victim first.
    pub async fn keys(&self) -> Vec<CacheKey> {
        self.index.lock().await.keys()
    }

    pub async fn contains(&self, key: impl Into<CacheKey>) -> bool {
        self.index.lock().await.lookup(&key.into()).is_some()
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.lock().await.is_empty()
    }

    pub async fn current_size(&self) -> u64 {
        self.index.lock().await.current_size()
    }

    #[cfg(test)]
    async fn assert_invariants(&self) {
        self.index.lock().await.assert_invariants();
    }
}

fn log_evict_error(entry: &Entry, source: std::io::Error) {
    let error = CacheError::Evict {
        path: entry.local_path().to_owned(),
        source,
    };
    tracing::error!(
        error = &error as &dyn std::error::Error,
        key = %entry.key(),
        "Failed to delete artifact bytes",
    );
}
