//! Cache-aside storage for pipeline results

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Per-call cache settings for [`Pipeline::execute`](super::Pipeline::execute)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Cache key; callers own the key namespace
    pub key: String,

    /// Entry lifetime; the pipeline default applies when unset
    pub ttl: Option<Duration>,
}

impl CacheOptions {
    /// Cache under `key` with the pipeline's default TTL
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ttl: None,
        }
    }

    /// Override the TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug)]
struct CacheEntry<T> {
    value: T,
    /// `None` when the TTL reaches past the clock's range
    expires_at: Option<Instant>,
}

impl<T> CacheEntry<T> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Expired entries are never returned but stay resident until overwritten,
/// invalidated or purged.
#[derive(Debug)]
pub(crate) struct ResultCache<T> {
    entries: DashMap<String, CacheEntry<T>>,
}

impl<T: Clone> ResultCache<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Upsert; last writer wins
    pub(crate) fn insert(&self, key: String, value: T, ttl: Duration) {
        let expires_at = Instant::now().checked_add(ttl);
        self.entries.insert(key, CacheEntry { value, expires_at });
    }

    pub(crate) fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub(crate) fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }
}
