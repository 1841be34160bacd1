//! Table implementation
//!
//! A directory acting as one keyspace: one `.kv` file per record.

use std::fs::{self, DirEntry, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FlockdError, Result};
use crate::lock::{FileLock, LockMode};

use super::atomic::{write_atomic, WriteMode};
use super::{key_from_file_name, record_file_name, validate_key, LIST_BATCH_SIZE};

/// A directory into which keys and values can be written
///
/// ## Concurrency:
/// - Readers take a shared lock on the record file
/// - Writers take exclusive locks on a temp file and on the record path
/// - No in-process locking: all contention goes through file locks, so the
///   same guarantees hold between threads and between processes
#[derive(Debug, Clone)]
pub struct Table {
    /// Logical name ("" for the root table)
    name: String,

    /// Directory holding the record files
    path: PathBuf,

    /// Lock wait budget, fixed when the table was created
    lock_timeout: Duration,
}

impl Table {
    /// Open a table at `path`, creating the directory if it does not exist.
    pub(crate) fn open(name: impl Into<String>, path: PathBuf, lock_timeout: Duration) -> Result<Self> {
        fs::create_dir_all(&path).map_err(|e| FlockdError::io("mkdir", &path, e))?;
        let table = Self::at(name, path, lock_timeout);
        tracing::debug!(name = %table.name, path = %table.path.display(), "table opened");
        Ok(table)
    }

    /// Describe a table whose directory is already known to exist.
    pub(crate) fn at(name: impl Into<String>, path: PathBuf, lock_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            path,
            lock_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Path of the file that stores `key`.
    pub fn record_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.path.join(record_file_name(key)))
    }

    // =========================================================================
    // Record Operations
    // =========================================================================

    /// Read the value stored under `key`.
    ///
    /// Waits up to the table's lock timeout for a shared lock on the record.
    /// If a writer replaces or removes the record during the wait, the read
    /// follows it, so the value returned is always one that was written.
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.record_path(key)?;

        let Some(lock) = FileLock::acquire_existing(&path, LockMode::Shared, self.lock_timeout)? else {
            return Err(FlockdError::NotFound { key: key.to_string() });
        };
        ensure_not_directory(lock.file(), &path, key)?;

        let mut value = Vec::new();
        let mut reader = lock.file();
        reader
            .read_to_end(&mut value)
            .map_err(|e| FlockdError::io("read", &path, e))?;

        tracing::trace!(table = %self.name, key, bytes = value.len(), "record read");
        Ok(value)
    }

    /// Write `value` under `key`, whether or not the key exists.
    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.record_path(key)?;
        if path.is_dir() {
            return Err(FlockdError::invalid_key(key, "key names a directory"));
        }
        write_atomic(&self.path, &path, key, value, self.lock_timeout, WriteMode::Upsert)
    }

    /// Write `value` under `key`, failing with `AlreadyExists` if the key is
    /// already present.
    ///
    /// Never waits on the record: if it exists, even locked by another
    /// holder, the call fails immediately.
    pub fn create(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.record_path(key)?;
        match fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.is_dir() => {
                return Err(FlockdError::invalid_key(key, "key names a directory"))
            }
            Ok(_) => return Err(FlockdError::AlreadyExists { key: key.to_string() }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(FlockdError::io("stat", &path, e)),
        }

        write_atomic(&self.path, &path, key, value, self.lock_timeout, WriteMode::CreateNew)
    }

    /// Write `value` under `key`, failing with `NotFound` if the key is absent.
    pub fn update(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.record_path(key)?;
        match fs::metadata(&path) {
            Ok(metadata) if metadata.is_dir() => {
                return Err(FlockdError::invalid_key(key, "key names a directory"))
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FlockdError::NotFound { key: key.to_string() })
            }
            Err(e) => return Err(FlockdError::io("stat", &path, e)),
        }

        write_atomic(&self.path, &path, key, value, self.lock_timeout, WriteMode::ReplaceExisting)
    }

    /// Remove `key`. Removing a missing key succeeds.
    pub fn delete(&self, key: &str) -> Result<()> {
        let path = self.record_path(key)?;

        // The lock is on whatever is at `path` once granted, so a record a
        // writer renamed in during the wait is the one removed.
        let Some(lock) = FileLock::acquire_existing(&path, LockMode::Exclusive, self.lock_timeout)?
        else {
            return Ok(());
        };
        ensure_not_directory(lock.file(), &path, key)?;

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(FlockdError::io("remove", &path, e)),
        }

        drop(lock);
        tracing::trace!(table = %self.name, key, "record deleted");
        Ok(())
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Call `f` with every key and value in the table.
    ///
    /// The directory is read in batches of [`LIST_BATCH_SIZE`] entries. Only
    /// regular `.kv` files count as records. Iteration stops at the first
    /// error, whether from listing, reading a record, or `f` itself.
    ///
    /// `f` must not modify the table; what happens if it does is unspecified.
    pub fn for_each<F, E>(&self, mut f: F) -> std::result::Result<(), E>
    where
        F: FnMut(&str, &[u8]) -> std::result::Result<(), E>,
        E: From<FlockdError>,
    {
        let mut entries =
            fs::read_dir(&self.path).map_err(|e| FlockdError::io("read dir", &self.path, e))?;
        let mut batch = Vec::with_capacity(LIST_BATCH_SIZE);

        loop {
            let exhausted = self.next_batch(&mut entries, &mut batch)?;
            for key in batch.drain(..) {
                let value = self.get(&key)?;
                f(&key, &value)?;
            }
            if exhausted {
                return Ok(());
            }
        }
    }

    /// All record keys in the table, in directory order.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut entries =
            fs::read_dir(&self.path).map_err(|e| FlockdError::io("read dir", &self.path, e))?;
        let mut keys = Vec::new();
        let mut batch = Vec::with_capacity(LIST_BATCH_SIZE);

        loop {
            let exhausted = self.next_batch(&mut entries, &mut batch)?;
            keys.append(&mut batch);
            if exhausted {
                return Ok(keys);
            }
        }
    }

    /// Fill `batch` with up to `LIST_BATCH_SIZE` record keys. Returns true once
    /// the listing has no more entries.
    fn next_batch(&self, entries: &mut fs::ReadDir, batch: &mut Vec<String>) -> Result<bool> {
        while batch.len() < LIST_BATCH_SIZE {
            let Some(entry) = entries.next() else {
                return Ok(true);
            };
            let entry = entry.map_err(|e| FlockdError::io("read dir", &self.path, e))?;
            if let Some(key) = self.record_key(&entry)? {
                batch.push(key);
            }
        }
        Ok(false)
    }

    /// Key for a directory entry, or None if the entry is not a record.
    fn record_key(&self, entry: &DirEntry) -> Result<Option<String>> {
        let file_type = entry
            .file_type()
            .map_err(|e| FlockdError::io("stat", entry.path(), e))?;
        if file_type.is_dir() {
            return Ok(None);
        }

        let name = entry.file_name();
        Ok(name.to_str().and_then(key_from_file_name).map(str::to_string))
    }
}

fn ensure_not_directory(file: &File, path: &Path, key: &str) -> Result<()> {
    let metadata = file.metadata().map_err(|e| FlockdError::io("stat", path, e))?;
    if metadata.is_dir() {
        return Err(FlockdError::invalid_key(key, "key names a directory"));
    }
    Ok(())
}
