//! Directory-backed store shared through a common filesystem.
//!
//! Each key maps to one JSON file. Entries are written to a private
//! temporary file and then moved into place, so readers never see a partial
//! entry. Every mutation holds an exclusive lock on `.store.lock`, which makes
//! the check-then-replace of an expired entry atomic across processes
//! sharing the directory. Expiry uses wall-clock time because readers may
//! run on different machines.

use std::fs::File;
use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::OpenOptions;
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{KvError, KvStore};

/// Lock file serialising writers. Key files never start with a dot.
const STORE_LOCK_FILE: &str = ".store.lock";

#[derive(Debug, Deserialize, Serialize)]
struct DirEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl DirEntry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        Self {
            value: value.to_owned(),
            expires_at,
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > Utc::now())
    }
}

/// Store keeping one file per key inside a shared directory.
#[derive(Clone, Debug)]
pub struct DirKvStore {
    root: Utf8PathBuf,
}

impl DirKvStore {
    /// Opens the store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::Io`] when the directory cannot be created.
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, KvError> {
        let store = Self { root: root.into() };
        Dir::create_ambient_dir_all(&store.root, ambient_authority())
            .map_err(|err| store.io_error(Utf8Path::new("."), &err))?;
        Ok(store)
    }

    /// Directory holding the entries.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn dir(&self) -> Result<Dir, KvError> {
        Dir::open_ambient_dir(&self.root, ambient_authority())
            .map_err(|err| self.io_error(Utf8Path::new("."), &err))
    }

    fn io_error(&self, name: &Utf8Path, err: &io::Error) -> KvError {
        KvError::Io {
            path: self.root.join(name),
            message: err.to_string(),
        }
    }

    /// Blocks until this handle holds the store-wide writer lock.
    fn lock_writers(&self, dir: &Dir) -> Result<WriterLock, KvError> {
        let lock_error = |err: &io::Error| self.io_error(Utf8Path::new(STORE_LOCK_FILE), err);
        let mut options = OpenOptions::new();
        options.create(true).write(true);
        let file = dir
            .open_with(STORE_LOCK_FILE, &options)
            .map_err(|err| lock_error(&err))?
            .into_std();
        file.lock_exclusive().map_err(|err| lock_error(&err))?;
        Ok(WriterLock { file })
    }

    fn read_entry(&self, dir: &Dir, key: &str) -> Result<Option<DirEntry>, KvError> {
        let name = file_name_for(key);
        let raw = match dir.read_to_string(&name) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(Utf8Path::new(&name), &err)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| KvError::Corrupt {
                key: key.to_owned(),
                message: err.to_string(),
            })
    }

    fn write_temp(&self, dir: &Dir, key: &str, entry: &DirEntry) -> Result<String, KvError> {
        let tmp_name = format!(".{}.{}.tmp", file_name_for(key), Uuid::new_v4().simple());
        let rendered = serde_json::to_string(entry).map_err(|err| KvError::Corrupt {
            key: key.to_owned(),
            message: err.to_string(),
        })?;
        dir.write(&tmp_name, rendered)
            .map_err(|err| self.io_error(Utf8Path::new(&tmp_name), &err))?;
        Ok(tmp_name)
    }

    fn remove_quietly(dir: &Dir, name: &str) {
        if let Err(err) = dir.remove_file(name)
            && err.kind() != io::ErrorKind::NotFound
        {
            debug!(file = name, error = %err, "failed to remove key-value file");
        }
    }

    fn try_publish(&self, dir: &Dir, tmp_name: &str, key: &str) -> Result<bool, KvError> {
        let name = file_name_for(key);
        match dir.hard_link(tmp_name, dir, &name) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(self.io_error(Utf8Path::new(&name), &err)),
        }
    }
}

impl KvStore for DirKvStore {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let dir = self.dir()?;
        let _writers = self.lock_writers(&dir)?;
        match self.read_entry(&dir, key) {
            Ok(Some(entry)) if entry.is_live() => return Ok(false),
            Ok(Some(_)) => {
                debug!(key, "replacing expired key-value entry");
                Self::remove_quietly(&dir, &file_name_for(key));
            }
            Ok(None) => {}
            // A corrupt entry counts as live and is never replaced.
            Err(KvError::Corrupt { .. }) => return Ok(false),
            Err(err) => return Err(err),
        }
        let tmp_name = self.write_temp(&dir, key, &DirEntry::new(value, Some(ttl)))?;
        let published = self.try_publish(&dir, &tmp_name, key);
        Self::remove_quietly(&dir, &tmp_name);
        published
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let dir = self.dir()?;
        let _writers = self.lock_writers(&dir)?;
        let tmp_name = self.write_temp(&dir, key, &DirEntry::new(value, ttl))?;
        let name = file_name_for(key);
        dir.rename(&tmp_name, &dir, &name).map_err(|err| {
            Self::remove_quietly(&dir, &tmp_name);
            self.io_error(Utf8Path::new(&name), &err)
        })
    }

    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let dir = self.dir()?;
        Ok(self
            .read_entry(&dir, key)?
            .filter(DirEntry::is_live)
            .map(|entry| entry.value))
    }

    fn delete(&self, key: &str) -> Result<bool, KvError> {
        let dir = self.dir()?;
        let _writers = self.lock_writers(&dir)?;
        let live = self
            .read_entry(&dir, key)
            .map(|entry| entry.is_some_and(|found| found.is_live()))
            .unwrap_or(true);
        let name = file_name_for(key);
        match dir.remove_file(&name) {
            Ok(()) => Ok(live),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(self.io_error(Utf8Path::new(&name), &err)),
        }
    }
}

/// Exclusive hold on the writer lock, released on drop.
struct WriterLock {
    file: File,
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(error = %err, "failed to unlock key-value store");
        }
    }
}

/// Maps `key` to a safe file name, percent-encoding anything outside
/// `[A-Za-z0-9_-]`.
fn file_name_for(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') {
            name.push(char::from(byte));
        } else {
            name.push('%');
            for nibble in [byte >> 4, byte & 0x0F] {
                if let Some(digit) = char::from_digit(u32::from(nibble), 16) {
                    name.push(digit.to_ascii_uppercase());
                }
            }
        }
    }
    name
}
