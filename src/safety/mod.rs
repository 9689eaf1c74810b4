//! Safety and cleanup
//!
//! Per-root mutual exclusion and the guaranteed teardown path.

pub mod cleanup;
pub mod lock_manager;

pub use cleanup::{Applied, Outcome, TeardownGuard, TeardownReport, UnwindStack};
pub use lock_manager::{SessionLock, SessionLockGuard};
