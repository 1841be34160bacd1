//! Storage Module
//!
//! Directory-backed tables whose records are plain files.
//!
//! ## Responsibilities
//! - Map keys to record files and table names to directories
//! - Read records under a shared lock
//! - Replace records atomically (temp file + fsync + rename)
//! - List records without loading a whole directory at once
//!
//! ## On-Disk Layout
//! ```text
//! {root}/                         root table (name "")
//! ├── greeting.kv                 record "greeting"
//! ├── greeting.kv.tmp4242.Xa81Qz  in-flight write (same dir as its record)
//! ├── users.tbl/                  table "users"
//! │   └── alice.kv
//! └── a/
//!     └── b/
//!         └── c.tbl/              table "a/b/c" (only the last segment is suffixed)
//! ```

mod atomic;
mod table;

pub use table::Table;

use std::path::MAIN_SEPARATOR;

use crate::error::{FlockdError, Result};

/// Suffix appended to a key to form its record file name
pub const RECORD_EXT: &str = ".kv";

/// Suffix appended to a table name to form its directory name
pub const TABLE_EXT: &str = ".tbl";

/// Marker between a record file name and the writer-unique part of a temp file
pub const TEMP_MARKER: &str = ".tmp";

/// Number of directory entries pulled per listing batch
pub const LIST_BATCH_SIZE: usize = 256;

/// Reject keys that cannot name a single file inside a table directory.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(FlockdError::invalid_key(key, "key is empty"));
    }
    if key.contains(MAIN_SEPARATOR) || key.contains('/') {
        return Err(FlockdError::invalid_key(key, "key contains a path separator"));
    }
    if key.contains('\0') {
        return Err(FlockdError::invalid_key(key, "key contains a NUL byte"));
    }
    Ok(())
}

/// "greeting" → "greeting.kv"
pub(crate) fn record_file_name(key: &str) -> String {
    format!("{}{}", key, RECORD_EXT)
}

/// "greeting.kv" → Some("greeting"); anything else → None
pub(crate) fn key_from_file_name(name: &str) -> Option<&str> {
    name.strip_suffix(RECORD_EXT).filter(|key| !key.is_empty())
}
