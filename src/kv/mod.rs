//! Key-value storage with expiring entries.
//!
//! The cluster lock and the status snapshots live in a store shared by every
//! provisioner instance. [`KvStore`] is the contract; [`MemoryKvStore`]
//! serves a single process and tests, [`DirKvStore`] shares entries through
//! a directory every instance can reach.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use parking_lot::Mutex;
use thiserror::Error;

mod dir;

pub use dir::DirKvStore;

/// Errors raised by key-value stores.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum KvError {
    /// Raised when the backing storage cannot be read or written.
    #[error("key-value store I/O failed for {path}: {message}")]
    Io {
        /// Path that failed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a stored entry cannot be decoded.
    #[error("corrupt key-value entry {key}: {message}")]
    Corrupt {
        /// Key of the unreadable entry.
        key: String,
        /// Decoder error string.
        message: String,
    },
}

/// Contract for a shared store with atomic set-if-absent.
///
/// Expired entries behave exactly like absent ones.
pub trait KvStore: Send + Sync {
    /// Stores `value` under `key` only when no live entry exists.
    ///
    /// Returns `true` when this call created the entry.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] when the store is unreachable.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Stores `value` under `key`, replacing any existing entry.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] when the store is unreachable.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Returns the live value under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] when the store is unreachable or the entry is
    /// corrupt.
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Removes `key`, returning `true` when an entry existed.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] when the store is unreachable.
    fn delete(&self, key: &str) -> Result<bool, KvError>;
}

#[derive(Clone, Debug)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// In-process store guarded by a mutex. Clones share the same entries.
#[derive(Clone, Debug, Default)]
pub struct MemoryKvStore {
    entries: Arc<Mutex<HashMap<String, MemoryEntry>>>,
}

impl MemoryKvStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Returns `true` when no live entries remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryKvStore {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            MemoryEntry {
                value: value.to_owned(),
                expires_at: now.checked_add(ttl),
            },
        );
        Ok(true)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let now = Instant::now();
        self.entries.lock().insert(
            key.to_owned(),
            MemoryEntry {
                value: value.to_owned(),
                expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    fn delete(&self, key: &str) -> Result<bool, KvError> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }
}
