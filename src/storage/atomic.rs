//! Atomic record writes
//!
//! Every record write goes through [`write_atomic`]:
//!
//! 1. Create a uniquely named temp file in the record's directory
//! 2. Lock the temp file exclusively
//! 3. Write the value and fsync
//! 4. Lock the existing record exclusively
//! 5. Rename the temp file over the record
//! 6. Release both locks
//!
//! When there is no record yet, steps 4 and 5 become a hard link of the temp
//! file onto the record name. The link fails if the name is taken, and the
//! record appears already complete and already locked, so nothing ever sees a
//! half-made record. The temp file lives in the same directory as the record
//! so neither rename nor link crosses a filesystem boundary. The temp file is
//! removed on every failure path.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use tempfile::{Builder, NamedTempFile, PersistError};

use crate::error::{FlockdError, Result};
use crate::lock::{FileLock, LockMode};

use super::TEMP_MARKER;

/// Random characters appended after the pid in temp file names
const TEMP_RAND_LEN: usize = 6;

/// How a write treats the record it targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    /// Replace the record, or create it if absent
    Upsert,

    /// Fail with `AlreadyExists` if the record is present
    CreateNew,

    /// Fail with `NotFound` if the record is absent
    ReplaceExisting,
}

/// Atomically store `value` as the record `dest` (inside `dir`) for `key`.
pub(crate) fn write_atomic(
    dir: &Path,
    dest: &Path,
    key: &str,
    value: &[u8],
    timeout: Duration,
    mode: WriteMode,
) -> Result<()> {
    let start = Instant::now();
    let (tmp, tmp_lock) = stage(dir, dest, value, timeout)?;

    loop {
        if mode != WriteMode::CreateNew {
            // Step 4: Serialize with other writers and readers of the record.
            if let Some(dest_lock) =
                FileLock::acquire_existing_since(dest, LockMode::Exclusive, timeout, start)?
            {
                // Step 5: Swap. On failure the temp file comes back and is
                // removed on drop.
                tmp.persist(dest).map_err(|PersistError { error, file }| {
                    drop(file);
                    FlockdError::io("rename onto", dest, error)
                })?;
                tracing::trace!(path = %dest.display(), bytes = value.len(), "record written");

                // Step 6: Committed. The temp lock now sits on the new record;
                // release it first so readers that open it do not wait on it.
                drop(tmp_lock);
                drop(dest_lock);
                return Ok(());
            }

            if mode == WriteMode::ReplaceExisting {
                return Err(FlockdError::NotFound { key: key.to_string() });
            }
        }

        match fs::hard_link(tmp.path(), dest) {
            Ok(()) => {
                tracing::trace!(path = %dest.display(), bytes = value.len(), "record created");
                if let Err(e) = tmp.close() {
                    tracing::warn!(path = %dest.display(), "Failed to remove temp file: {}", e);
                }
                drop(tmp_lock);
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if mode == WriteMode::CreateNew {
                    return Err(FlockdError::AlreadyExists { key: key.to_string() });
                }
                // Created by someone else since step 4 looked; lock it instead.
                if start.elapsed() >= timeout {
                    return Err(FlockdError::LockTimeout {
                        path: dest.to_path_buf(),
                        timeout,
                    });
                }
            }
            Err(e) => return Err(FlockdError::io("link onto", dest, e)),
        }
    }
}

/// Steps 1 to 3: a locked temp file next to `dest` holding `value` on disk.
fn stage(
    dir: &Path,
    dest: &Path,
    value: &[u8],
    timeout: Duration,
) -> Result<(NamedTempFile, FileLock)> {
    let file_name = dest.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
        FlockdError::io("name temp file for", dest, io::ErrorKind::InvalidInput.into())
    })?;
    let prefix = format!("{}{}{}.", file_name, TEMP_MARKER, std::process::id());

    // Step 1: Temp file next to the destination. Dropping it removes it.
    let mut tmp = Builder::new()
        .prefix(&prefix)
        .rand_bytes(TEMP_RAND_LEN)
        .tempfile_in(dir)
        .map_err(|e| FlockdError::io("create temp file in", dir, e))?;

    // Step 2: Exclusive lock on the temp file. The cloned handle shares the
    // open file description, so the lock covers `tmp` itself.
    let handle = tmp
        .as_file()
        .try_clone()
        .map_err(|e| FlockdError::io("clone handle", tmp.path(), e))?;
    let tmp_lock = FileLock::lock_file(handle, tmp.path(), LockMode::Exclusive, timeout)?;

    // Step 3: Full value on disk before anything points at it.
    tmp.as_file_mut()
        .write_all(value)
        .map_err(|e| FlockdError::io("write", tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FlockdError::io("sync", tmp.path(), e))?;

    Ok((tmp, tmp_lock))
}
