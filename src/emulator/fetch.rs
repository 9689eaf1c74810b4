/// External collaborator that obtains an emulator binary when no local copy exists
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::process::Command;

pub trait Fetcher: Send + Sync {
    /// Install `binary` (e.g. `qemu-arm-static`) into `root`'s standard
    /// binary directory. The error string is surfaced to the user.
    fn fetch(&self, binary: &str, root: &Path) -> Result<(), String>;
}

/// Runs `sh <script> <binary> <root>` and trusts its exit status
#[derive(Debug, Clone)]
pub struct ScriptFetcher {
    script: PathBuf,
}

impl ScriptFetcher {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl Fetcher for ScriptFetcher {
    fn fetch(&self, binary: &str, root: &Path) -> Result<(), String> {
        info!("Fetching {} with {}", binary, self.script.display());
        let output = Command::new("sh")
            .arg(&self.script)
            .arg(binary)
            .arg(root)
            .output()
            .map_err(|e| format!("cannot run {}: {}", self.script.display(), e))?;

        if output.status.success() {
            debug!("{} finished", self.script.display());
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!(
            "{} exited with {}: {}",
            self.script.display(),
            output.status,
            stderr.trim()
        ))
    }
}

/// Used when no fetch script is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFetch;

impl Fetcher for NoFetch {
    fn fetch(&self, binary: &str, _root: &Path) -> Result<(), String> {
        Err(format!(
            "{} not found on the host and no fetch script configured",
            binary
        ))
    }
}
