//! # flockd
//!
//! A file system-based key/value store:
//! - Tables are directories, records are files, values are file contents
//! - Advisory `flock(2)` locks for concurrency safety between threads and
//!   processes
//! - Crash-consistent writes via temp file + fsync + atomic rename
//! - Bounded, polled lock waits that fail with a timeout instead of hanging
//!
//! Suited to small, rarely written datasets that should stay inspectable as
//! plain files, for example on a replicated filesystem.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Database                             │
//! │          (root table + cached named tables)                 │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Table                               │
//! │        get / set / create / update / delete / for_each      │
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │                                  │
//!            ▼                                  ▼
//!   ┌─────────────────┐                ┌─────────────────┐
//!   │  Atomic Write   │───────────────▶│  Lock Manager   │
//!   │ (tmp + rename)  │                │ (flock, polled) │
//!   └─────────────────┘                └─────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let db = flockd::Database::new("my.db", Duration::from_millis(10))?;
//! let users = db.table("users")?;
//!
//! users.create("greeting", b"Hello world!")?;
//! assert_eq!(users.get("greeting")?, b"Hello world!");
//!
//! users.set("greeting", b"Goodbye world!")?;
//! users.delete("greeting")?;
//! assert!(users.get("greeting").unwrap_err().is_not_found());
//! # Ok::<(), flockd::FlockdError>(())
//! ```

#[cfg(not(unix))]
compile_error!("flockd relies on flock(2) and only supports Unix platforms");

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod lock;
pub mod storage;
pub mod database;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{FlockdError, Result};
pub use config::Config;
pub use database::Database;
pub use lock::{CancelFlag, FileLock, LockMode};
pub use storage::Table;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of flockd
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
