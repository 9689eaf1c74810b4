//! Session configuration
//!
//! Shared types, error taxonomy and JSON loading.

pub mod loader;
pub mod types;
