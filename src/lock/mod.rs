//! Lock Module
//!
//! Advisory file locks with a bounded, polled wait.
//!
//! ## Responsibilities
//! - Acquire shared or exclusive `flock(2)` locks on a named path or open file
//! - Poll at `timeout / 100` until the lock is held or the timeout elapses
//! - Release on every exit path (explicitly or on drop)
//!
//! ## Compatibility Matrix
//! ```text
//!               │ held: Shared │ held: Exclusive
//! ──────────────┼──────────────┼────────────────
//! want Shared   │   granted    │     waits
//! want Exclusive│    waits     │     waits
//! ```
//!
//! Locks are advisory: they only constrain processes and threads that go
//! through this module (or call `flock(2)` themselves). `flock` locks belong
//! to the open file description, so two handles opened separately in the
//! same process contend with each other just like two processes do.

mod file_lock;

pub use file_lock::{CancelFlag, FileLock};

/// Number of polls made within one timeout window.
pub const POLL_DIVISOR: u32 = 100;

/// Lock mode requested from the Lock Manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many shared holders may coexist; excludes exclusive holders
    Shared,

    /// Excludes all other holders
    Exclusive,
}

impl LockMode {
    pub(crate) fn flock_op(self) -> libc::c_int {
        match self {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        }
    }
}
