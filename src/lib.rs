//! echroot: chroot sessions with bind mounts, file substitution and
//! foreign-architecture emulation
//!
//! A session locks its root, binds host directories into it, swaps in
//! configuration files, registers a static qemu emulator with binfmt_misc
//! when the root was built for another instruction set, runs a command
//! chrooted into it, and then undoes all of that in reverse order.
//!
//! # Architecture
//!
//! ## Kernel Facilities ([`kernel`])
//! - [`kernel::mount`]: Bind mount lifecycle and the live mount table
//! - [`kernel::binfmt`]: binfmt_misc registration records
//! - [`kernel::process`]: Finding and killing processes rooted in a directory
//! - [`kernel::signal`]: Shutdown requests during the interactive wait
//! - [`kernel::launch`]: chroot(2) and the session command
//!
//! ## Root Inspection ([`probe`], [`fs`])
//! - [`probe`]: ELF header parsing and architecture detection
//! - [`fs::paths`]: Symlink resolution confined to the root
//! - [`fs::substitute`]: File substitution with on-disk backups
//!
//! ## Emulation ([`emulator`])
//! - [`emulator::provisioner`]: Install, register and remove qemu-*-static
//! - [`emulator::fetch`]: Collaborator for emulators missing on the host
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::lock_manager`]: Per-root session lock
//! - [`safety::cleanup`]: Unwind stack and teardown report
//!
//! ## Sessions ([`session`])
//! - [`session::orchestrator`]: The session state machine
//! - [`session::recovery`]: Cleanup after a session that was killed
//!
//! # Design Principles
//!
//! 1. **Kernel as truth** - Mount state, backups and registrations are read
//!    live, never cached
//! 2. **Teardown always runs** - Guards own the lock and the unwind stack
//! 3. **Best effort is explicit** - Teardown steps return an [`safety::Outcome`]
//! 4. **Minimal unsafe** - Confined to the chroot pre-exec hook and signal
//!    handlers

// Kernel Facilities
pub mod kernel;

// Root Inspection
pub mod fs;
pub mod probe;

// Emulation
pub mod emulator;

// Safety & Cleanup
pub mod safety;

// Sessions
pub mod session;

// Configuration
pub mod config;

// Testing Infrastructure
pub mod testing;

// CLI entrypoint wiring shared by the echroot binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
