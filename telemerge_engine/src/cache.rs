//! The external key-value cache contract.
//!
//! The cache-publishing strategy writes through [`Cache`] and the companion
//! [`crate::publisher::Publisher`] reads back through it. Real deployments
//! plug in a networked store; [`MemoryCache`] serves the daemon and tests.

use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use rustc_hash::FxHashMap;

/// Errors produced by [`Cache`] implementations
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A write was refused or failed.
    #[error("failed to write cache key {key}: {reason}")]
    Write {
        /// The key being written
        key: String,
        /// Implementation specific reason
        reason: String,
    },
    /// A read failed. A missing key is not a failure.
    #[error("failed to read cache key {key}: {reason}")]
    Read {
        /// The key being read
        key: String,
        /// Implementation specific reason
        reason: String,
    },
}

/// A key-value store with optional per-entry expiry.
pub trait Cache: Send + Sync + fmt::Debug {
    /// Store `value` under `key`, replacing any prior value. With `ttl` set the
    /// entry is no longer readable once that much time has passed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write did not take effect.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), Error>;

    /// Fetch the value stored under `key`, `None` if absent or expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache could not be read.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

#[derive(Debug, Default)]
/// An in-process [`Cache`].
pub struct MemoryCache {
    entries: Mutex<FxHashMap<String, Entry>>,
}

impl MemoryCache {
    /// Create an empty [`MemoryCache`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live entries. Expired entries are dropped as a side effect.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, entry| entry.is_live(now));
        entries.len()
    }

    /// Whether no live entries remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for MemoryCache {
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), Error> {
        let now = Instant::now();
        // A TTL too large to represent never expires.
        let expires_at = ttl.and_then(|ttl| now.checked_add(ttl));
        let entry = Entry { value, expires_at };
        self.lock().insert(key.to_string(), entry);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get() {
        let cache = MemoryCache::new();
        cache.set("k", b"v".to_vec(), None).expect("set");
        assert_eq!(cache.get("k").expect("get"), Some(b"v".to_vec()));
        assert_eq!(cache.get("missing").expect("get"), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn set_replaces() {
        let cache = MemoryCache::new();
        cache.set("k", b"1".to_vec(), None).expect("set");
        cache.set("k", b"2".to_vec(), None).expect("set");
        assert_eq!(cache.get("k").expect("get"), Some(b"2".to_vec()));
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let cache = MemoryCache::new();
        cache.set("k", b"v".to_vec(), Some(Duration::ZERO)).expect("set");
        assert_eq!(cache.get("k").expect("get"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn long_ttl_is_readable() {
        let cache = MemoryCache::new();
        cache
            .set("k", b"v".to_vec(), Some(Duration::from_secs(300)))
            .expect("set");
        assert_eq!(cache.get("k").expect("get"), Some(b"v".to_vec()));
    }
}
