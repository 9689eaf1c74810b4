/// Processes whose filesystem root lies inside a chroot
///
/// The kernel exposes each process's root as the `/proc/<pid>/root` link.
/// Anything still rooted in the tree at teardown keeps its mounts busy, so it
/// is killed before unmounting.
use crate::safety::cleanup::Outcome;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Host process table
pub trait ProcessTable: Send + Sync {
    /// PIDs whose root directory is `root` or lies beneath it
    fn rooted_at(&self, root: &Path) -> io::Result<Vec<u32>>;

    /// Send SIGKILL. A process that is already gone is not an error.
    fn kill(&self, pid: u32) -> io::Result<()>;
}

/// [`ProcessTable`] backed by procfs
#[derive(Debug, Clone)]
pub struct ProcFs {
    proc_dir: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::at("/proc")
    }
}

impl ProcFs {
    pub fn at(proc_dir: impl Into<PathBuf>) -> Self {
        Self {
            proc_dir: proc_dir.into(),
        }
    }
}

impl ProcessTable for ProcFs {
    fn rooted_at(&self, root: &Path) -> io::Result<Vec<u32>> {
        let root = root.canonicalize()?;
        let own_pid = std::process::id();
        let mut pids = Vec::new();

        for entry in fs::read_dir(&self.proc_dir)?.flatten() {
            let pid = match entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) {
                Some(pid) if pid != own_pid => pid,
                _ => continue,
            };

            // EACCES for other users' processes when unprivileged, ENOENT on exit
            let proc_root = match fs::read_link(entry.path().join("root")) {
                Ok(link) => link,
                Err(_) => continue,
            };

            if proc_root.starts_with(&root) {
                pids.push(pid);
            }
        }

        pids.sort_unstable();
        Ok(pids)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Kill every process rooted at `root` and wait up to `grace` for them to go.
///
/// Per-process failures are logged; the returned outcome lists survivors.
pub fn evict_processes(table: &dyn ProcessTable, root: &Path, grace: Duration) -> Outcome {
    let pids = match table.rooted_at(root) {
        Ok(pids) => pids,
        Err(e) => return Outcome::Failed(format!("cannot scan process table: {}", e)),
    };

    if pids.is_empty() {
        debug!("No processes rooted at {}", root.display());
        return Outcome::Skipped;
    }

    info!("Evicting {} process(es) from {}", pids.len(), root.display());
    for pid in &pids {
        if let Err(e) = table.kill(*pid) {
            warn!("Failed to kill process {}: {}", pid, e);
        }
    }

    let deadline = Instant::now() + grace;
    loop {
        let survivors = match table.rooted_at(root) {
            Ok(pids) => pids,
            Err(e) => return Outcome::Failed(format!("cannot scan process table: {}", e)),
        };
        if survivors.is_empty() {
            return Outcome::Done;
        }
        if Instant::now() >= deadline {
            warn!("Processes still rooted at {}: {:?}", root.display(), survivors);
            return Outcome::Failed(format!("processes survived eviction: {:?}", survivors));
        }
        thread::sleep(Duration::from_millis(50));
    }
}
