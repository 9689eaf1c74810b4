//! Thin wrappers around Linux kernel facilities.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Host-global state (mount table, process table, binfmt_misc) is reached
//! through narrow traits so it can be queried live and faked in tests.

pub mod binfmt;
pub mod launch;
pub mod mount;
pub mod process;
pub mod signal;
