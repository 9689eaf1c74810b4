//! Chroot session lifecycle
//!
//! [`ChrootSession`] sequences lock, validation, setup, launch and teardown
//! for one root. [`recover`] unwinds what a killed session left behind.

pub mod orchestrator;
pub mod recovery;
pub mod report;

pub use orchestrator::{ChrootSession, SessionState};
pub use recovery::recover;
pub use report::{InterpreterReport, SessionReport};

use crate::config::types::SessionConfig;
use crate::emulator::{Fetcher, NoFetch, ScriptFetcher};
use crate::kernel::launch::{ChrootLauncher, Launcher};
use crate::kernel::mount::{MountOps, SystemMounts};
use crate::kernel::process::{ProcFs, ProcessTable};
use std::sync::Arc;

/// Host facilities a session acts on
#[derive(Clone)]
pub struct Host {
    pub mounts: Arc<dyn MountOps>,
    pub processes: Arc<dyn ProcessTable>,
    pub launcher: Arc<dyn Launcher>,
    pub fetcher: Arc<dyn Fetcher>,
}

impl Host {
    /// The real machine: nix mounts, procfs, chroot(2), and the configured
    /// fetch script if there is one
    pub fn system(config: &SessionConfig) -> Self {
        let fetcher: Arc<dyn Fetcher> = match &config.emulator.fetch_script {
            Some(script) => Arc::new(ScriptFetcher::new(script.clone())),
            None => Arc::new(NoFetch),
        };
        Self {
            mounts: Arc::new(SystemMounts),
            processes: Arc::new(ProcFs::default()),
            launcher: Arc::new(ChrootLauncher::default()),
            fetcher,
        }
    }
}
