//! Foreign-architecture support
//!
//! A root built for another instruction set gets a static qemu user-mode
//! emulator copied into it and registered with binfmt_misc for the length
//! of the session.

pub mod fetch;
pub mod provisioner;

pub use fetch::{Fetcher, NoFetch, ScriptFetcher};
pub use provisioner::{EmulatorBinding, EmulatorProvisioner, EmulatorState, Interpreter};
