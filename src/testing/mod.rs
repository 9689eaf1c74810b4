//! Testing infrastructure
//!
//! Fakes for the host-facing traits and filesystem fixtures. Public so the
//! integration tests under `tests/` can drive whole sessions without root.

pub mod fakes;
pub mod fixtures;
