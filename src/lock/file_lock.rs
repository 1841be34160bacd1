//! File lock implementation
//!
//! `flock(2)` guard with polled acquisition.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{FlockdError, Result};

use super::{LockMode, POLL_DIVISOR};

/// Shared flag that aborts an in-progress lock wait.
///
/// Clones observe the same flag. Cancellation is checked between polls, so a
/// waiter notices it within one poll interval.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// An advisory lock held on a file.
///
/// The lock is released by [`FileLock::release`] or when the guard is
/// dropped, whichever happens first.
#[derive(Debug)]
pub struct FileLock {
    /// Handle the lock is attached to
    file: File,

    /// Path the handle was opened from (for errors and logging)
    path: PathBuf,

    mode: LockMode,

    /// False once released
    held: bool,
}

impl FileLock {
    /// Open `path` and lock it, polling for up to `timeout`.
    ///
    /// The path does not have to exist: a missing file is created empty so
    /// that a lock can be taken on the name before anything is written to it.
    pub fn acquire(path: &Path, mode: LockMode, timeout: Duration) -> Result<Self> {
        let file = open_lock_target(path)?;
        Self::lock_file(file, path, mode, timeout)
    }

    /// Like [`FileLock::acquire`], but gives up with `LockCancelled` as soon as
    /// `cancel` is set.
    pub fn acquire_cancellable(
        path: &Path,
        mode: LockMode,
        timeout: Duration,
        cancel: &CancelFlag,
    ) -> Result<Self> {
        let file = open_lock_target(path)?;
        poll_lock(&file, path, mode, timeout, Instant::now(), Some(cancel))?;
        Ok(Self::held(file, path, mode))
    }

    /// Lock the file that is at `path` when the lock is granted.
    ///
    /// Never creates anything; returns `Ok(None)` if `path` does not exist.
    /// A writer may rename a new file over `path` while we wait, leaving the
    /// lock on a file nobody can open by name any more. In that case the lock
    /// is dropped and the current file is locked instead, all within one
    /// `timeout`.
    pub fn acquire_existing(path: &Path, mode: LockMode, timeout: Duration) -> Result<Option<Self>> {
        Self::acquire_existing_since(path, mode, timeout, Instant::now())
    }

    /// [`FileLock::acquire_existing`] with a wait budget that started at `start`.
    pub(crate) fn acquire_existing_since(
        path: &Path,
        mode: LockMode,
        timeout: Duration,
        start: Instant,
    ) -> Result<Option<Self>> {
        loop {
            let file = match File::open(path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(FlockdError::io("open", path, e)),
            };
            poll_lock(&file, path, mode, timeout, start, None)?;

            let current = match fs::metadata(path) {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(FlockdError::io("stat", path, e)),
            };
            if same_file(&file, path, &current)? {
                return Ok(Some(Self::held(file, path, mode)));
            }

            // Dropping `file` releases the lock on the replaced file.
            tracing::debug!(path = %path.display(), ?mode, "file replaced while waiting, retrying");
            if start.elapsed() >= timeout {
                return Err(timed_out(path, mode, timeout));
            }
        }
    }

    /// Lock an already open file, polling for up to `timeout`.
    pub fn lock_file(file: File, path: &Path, mode: LockMode, timeout: Duration) -> Result<Self> {
        poll_lock(&file, path, mode, timeout, Instant::now(), None)?;
        Ok(Self::held(file, path, mode))
    }

    /// Make a single non-blocking attempt to lock `file`.
    ///
    /// Returns `Ok(None)` if another holder has a conflicting lock.
    pub fn try_lock_file(file: File, path: &Path, mode: LockMode) -> Result<Option<Self>> {
        if try_flock(&file, mode).map_err(|e| FlockdError::io("lock", path, e))? {
            Ok(Some(Self::held(file, path, mode)))
        } else {
            Ok(None)
        }
    }

    fn held(file: File, path: &Path, mode: LockMode) -> Self {
        tracing::debug!(path = %path.display(), ?mode, "lock acquired");
        Self {
            file,
            path: path.to_path_buf(),
            mode,
            held: true,
        }
    }

    /// The locked handle.
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Release the lock. Calling this more than once is a no-op.
    pub fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;

        // SAFETY: the descriptor belongs to `self.file`, which is open for the
        // lifetime of `self`.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            return Err(FlockdError::io("unlock", &self.path, io::Error::last_os_error()));
        }

        tracing::debug!(path = %self.path.display(), mode = ?self.mode, "lock released");
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("Failed to release lock: {}", e);
        }
    }
}

/// Open a path for locking, creating it if it does not exist yet.
fn open_lock_target(path: &Path) -> Result<File> {
    match File::open(path) {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::NotFound => OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| FlockdError::io("open", path, e)),
        Err(e) => Err(FlockdError::io("open", path, e)),
    }
}

/// True if `file` is the file `current` was read from.
fn same_file(file: &File, path: &Path, current: &fs::Metadata) -> Result<bool> {
    let held = file.metadata().map_err(|e| FlockdError::io("stat", path, e))?;
    Ok(held.dev() == current.dev() && held.ino() == current.ino())
}

fn timed_out(path: &Path, mode: LockMode, timeout: Duration) -> FlockdError {
    tracing::warn!(path = %path.display(), ?mode, ?timeout, "lock wait timed out");
    FlockdError::LockTimeout {
        path: path.to_path_buf(),
        timeout,
    }
}

/// Poll for a lock every `timeout / POLL_DIVISOR` until it is granted, the
/// budget that began at `start` runs out, or `cancel` is set.
fn poll_lock(
    file: &File,
    path: &Path,
    mode: LockMode,
    timeout: Duration,
    start: Instant,
    cancel: Option<&CancelFlag>,
) -> Result<()> {
    let interval = timeout / POLL_DIVISOR;

    loop {
        if try_flock(file, mode).map_err(|e| FlockdError::io("lock", path, e))? {
            return Ok(());
        }

        if cancel.is_some_and(CancelFlag::is_cancelled) {
            tracing::debug!(path = %path.display(), ?mode, "lock wait cancelled");
            return Err(FlockdError::LockCancelled {
                path: path.to_path_buf(),
            });
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(timed_out(path, mode, timeout));
        }

        thread::sleep(interval.min(timeout - elapsed));
    }
}

/// One non-blocking `flock` call. `Ok(false)` means the lock is contended.
fn try_flock(file: &File, mode: LockMode) -> io::Result<bool> {
    // SAFETY: flock only reads the descriptor, which stays open for the
    // duration of the borrow.
    let rc = unsafe { libc::flock(file.as_raw_fd(), mode.flock_op() | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => Ok(false),
        _ => Err(err),
    }
}
