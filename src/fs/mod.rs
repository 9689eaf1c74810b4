//! Filesystem helpers
//!
//! Root-relative path resolution and file substitution with backup.

pub mod paths;
pub mod substitute;
