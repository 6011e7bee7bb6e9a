//! Keyed state shared by every request: rate-limit windows and CSRF tokens.
//!
//! Handlers talk to a [`KvStore`] rather than a concrete map so an external store can be
//! plugged in later without touching call sites. [`MemoryStore`] is the single-process
//! implementation: one instance per store is created at startup and shared through `AppState`.
//!
//! State is per process. Running N instances behind a load balancer multiplies every
//! effective limit by N.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Faults raised by a store backend.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt store entry for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Values that lapse at a known instant and may be swept afterwards.
pub trait Expiring {
    fn expires_at(&self) -> DateTime<Utc>;

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

pub type UpdateFn<V> = Box<dyn FnOnce(Option<V>) -> V + Send>;

#[async_trait]
pub trait KvStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> StoreResult<Option<V>>;

    async fn set(&self, key: &str, value: V) -> StoreResult<()>;

    /// Returns whether an entry was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Drops every entry that has expired at `now` and returns how many were removed.
    async fn sweep(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    async fn len(&self) -> StoreResult<usize>;

    /// Read-modify-write of one entry, returning the stored value.
    ///
    /// The default is a plain `get` followed by `set`. Two callers interleaving between those
    /// steps both see the old value, so a counter built on it can admit one extra request per
    /// concurrent interleaving. Backends that can do better override it.
    async fn update(&self, key: &str, f: UpdateFn<V>) -> StoreResult<V> {
        let current = self.get(key).await?;
        let next = f(current);
        self.set(key, next.clone()).await?;
        Ok(next)
    }
}

/// In-memory store bounded by an LRU capacity.
///
/// Entries are otherwise only replaced when touched, so [`KvStore::sweep`] must run
/// periodically (see `main`) to shed single-shot identifiers left by scanning traffic.
pub struct MemoryStore<V> {
    entries: Arc<Mutex<LruCache<String, V>>>,
    evicted: Arc<AtomicU64>,
}

impl<V> Clone for MemoryStore<V> {
    fn clone(&self) -> Self {
        Self { entries: self.entries.clone(), evicted: self.evicted.clone() }
    }
}

impl<V> MemoryStore<V> {
    /// Creates a store holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { entries: Arc::new(Mutex::new(LruCache::new(cap))), evicted: Arc::new(AtomicU64::new(0)) }
    }

    /// Number of live entries pushed out because the store was full.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn insert(&self, cache: &mut LruCache<String, V>, key: &str, value: V) {
        if let Some((old_key, _)) = cache.push(key.to_string(), value) {
            if old_key != key {
                self.evicted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("store full, evicted least recently used entry");
            }
        }
    }
}

#[async_trait]
impl<V> KvStore<V> for MemoryStore<V>
where
    V: Expiring + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> StoreResult<Option<V>> {
        let mut cache = self.entries.lock().await;
        Ok(cache.get(key).cloned())
    }

    async fn set(&self, key: &str, value: V) -> StoreResult<()> {
        let mut cache = self.entries.lock().await;
        self.insert(&mut cache, key, value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut cache = self.entries.lock().await;
        Ok(cache.pop(key).is_some())
    }

    async fn sweep(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut cache = self.entries.lock().await;
        let expired: Vec<String> =
            cache.iter().filter(|(_, v)| v.is_expired(now)).map(|(k, _)| k.clone()).collect();
        for key in &expired {
            cache.pop(key);
        }
        Ok(expired.len())
    }

    async fn len(&self) -> StoreResult<usize> {
        Ok(self.entries.lock().await.len())
    }

    // Atomic: the whole read-modify-write happens under one lock.
    async fn update(&self, key: &str, f: UpdateFn<V>) -> StoreResult<V> {
        let mut cache = self.entries.lock().await;
        let current = cache.get(key).cloned();
        let next = f(current);
        self.insert(&mut cache, key, next.clone());
        Ok(next)
    }
}
