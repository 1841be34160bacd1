//! Database Module
//!
//! The entry point that owns the root table and the table registry.
//!
//! ## Responsibilities
//! - Create the root directory on open
//! - Hand out named tables, creating their directories on first use
//! - Cache tables so repeated lookups never touch the filesystem
//! - Discover every table on disk by walking the root

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::Config;
use crate::error::{FlockdError, Result};
use crate::storage::{Table, TABLE_EXT};

/// A file system directory used as a key/value database
///
/// ## Concurrency Model
///
/// - `tables`: RwLock over the name → table cache. Lookups take the read
///   lock; a miss creates the directory without holding any lock, then
///   inserts under the write lock. Racing callers converge on whichever
///   table was inserted first.
/// - Record access is not serialized here at all; see [`Table`].
#[derive(Debug)]
pub struct Database {
    /// Table stored directly in the root directory
    root: Table,

    /// Lock timeout handed to tables created from now on
    lock_timeout: Duration,

    /// Named tables created through [`Database::table`]. Never shrinks.
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl Database {
    /// Open or create a database with the given config
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let root = Table::open("", config.root, config.lock_timeout)?;
        tracing::info!(
            path = %root.path().display(),
            timeout = ?config.lock_timeout,
            "database opened"
        );

        Ok(Self {
            root,
            lock_timeout: config.lock_timeout,
            tables: RwLock::new(HashMap::new()),
        })
    }

    /// Open with a path and lock timeout (convenience method)
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self> {
        Self::open(Config::builder().root(path).lock_timeout(lock_timeout).build())
    }

    // =========================================================================
    // Tables
    // =========================================================================

    /// Return the table called `name`, creating its directory if needed.
    ///
    /// The directory is `{root}/{name}.tbl`. A name containing separators
    /// addresses a nested table: `a/b/c` lives at `{root}/a/b/c.tbl`, with `a`
    /// and `b` as plain directories. Once a name has been seen it is served
    /// from the cache without checking the filesystem again.
    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        if let Some(table) = self.tables.read().get(name) {
            return Ok(Arc::clone(table));
        }

        validate_table_name(name)?;
        let path = self.root.path().join(format!("{}{}", name, TABLE_EXT));
        let table = Table::open(name, path, self.lock_timeout)?;

        let mut tables = self.tables.write();
        let cached = tables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(table));
        Ok(Arc::clone(cached))
    }

    /// Walk the root directory and return every table on disk.
    ///
    /// The root table comes first, followed by every directory whose name ends
    /// in `.tbl`, sorted by name. This neither reads nor fills the cache, so it
    /// also finds tables created by other processes. Any listing error aborts
    /// the walk.
    pub fn tables(&self) -> Result<Vec<Table>> {
        let root_path = self.root.path();
        let mut found = Vec::new();
        let mut pending = vec![root_path.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let entries = fs::read_dir(&dir).map_err(|e| FlockdError::io("read dir", &dir, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| FlockdError::io("read dir", &dir, e))?;
                let file_type = entry
                    .file_type()
                    .map_err(|e| FlockdError::io("stat", entry.path(), e))?;
                if !file_type.is_dir() {
                    continue;
                }

                let path = entry.path();
                if let Some(name) = discovered_table_name(root_path, &path) {
                    found.push(Table::at(name, path.clone(), self.lock_timeout));
                }
                pending.push(path);
            }
        }

        found.sort_by(|a, b| a.name().cmp(b.name()));
        found.insert(0, Table::at("", root_path.to_path_buf(), self.lock_timeout));

        tracing::debug!(count = found.len(), "tables discovered");
        Ok(found)
    }

    // =========================================================================
    // Root Table Operations
    // =========================================================================

    /// Read `key` from the root table
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.root.get(key)
    }

    /// Upsert `key` in the root table
    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.root.set(key, value)
    }

    /// Insert `key` into the root table, failing if it exists
    pub fn create(&self, key: &str, value: &[u8]) -> Result<()> {
        self.root.create(key, value)
    }

    /// Replace `key` in the root table, failing if it is absent
    pub fn update(&self, key: &str, value: &[u8]) -> Result<()> {
        self.root.update(key, value)
    }

    /// Remove `key` from the root table
    pub fn delete(&self, key: &str) -> Result<()> {
        self.root.delete(key)
    }

    /// Iterate over the root table's records
    pub fn for_each<F, E>(&self, f: F) -> std::result::Result<(), E>
    where
        F: FnMut(&str, &[u8]) -> std::result::Result<(), E>,
        E: From<FlockdError>,
    {
        self.root.for_each(f)
    }

    /// Keys of the root table
    pub fn keys(&self) -> Result<Vec<String>> {
        self.root.keys()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The root table
    pub fn root(&self) -> &Table {
        &self.root
    }

    /// The root directory
    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Lock timeout given to tables created from now on
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Change the lock timeout of the root table and of tables created later.
    /// Tables already cached keep their timeout.
    pub fn set_lock_timeout(&mut self, lock_timeout: Duration) -> Result<()> {
        if lock_timeout.is_zero() {
            return Err(FlockdError::InvalidTimeout(lock_timeout));
        }
        self.lock_timeout = lock_timeout;
        self.root = Table::at("", self.root.path().to_path_buf(), lock_timeout);
        Ok(())
    }

    /// Number of tables in the cache
    pub fn cached_table_count(&self) -> usize {
        self.tables.read().len()
    }
}

/// Reject names that would escape the root or collapse onto it.
fn validate_table_name(name: &str) -> Result<()> {
    let invalid = |reason| FlockdError::InvalidTableName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("table name is empty"));
    }
    if name.ends_with(std::path::MAIN_SEPARATOR) || name.ends_with('/') {
        return Err(invalid("table name ends with a path separator"));
    }
    for component in Path::new(name).components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("table name contains '..'")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("table name is absolute"))
            }
        }
    }
    Ok(())
}

/// "{root}/a/b/c.tbl" → Some("a/b/c"); non-table directories → None
fn discovered_table_name(root: &Path, dir: &Path) -> Option<String> {
    let relative = dir.strip_prefix(root).ok()?.to_str()?;
    relative
        .strip_suffix(TABLE_EXT)
        .filter(|name| !name.is_empty() && !name.ends_with(std::path::MAIN_SEPARATOR))
        .map(str::to_string)
}
