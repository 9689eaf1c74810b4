/// In-memory stand-ins for host-global state
///
/// Each fake implements the same trait as its system counterpart and keeps
/// a log of what it was asked to do, so tests can assert on the calls
/// without touching the real mount table, process table or network.
use crate::config::types::{EchrootError, Result};
use crate::emulator::Fetcher;
use crate::kernel::launch::{LaunchOutcome, Launcher};
use crate::kernel::mount::{MountOps, MountOptions};
use crate::kernel::process::ProcessTable;
use crate::probe::Architecture;
use crate::testing::fixtures::elf_image;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct MountState {
    mounted: BTreeSet<PathBuf>,
    failing: HashSet<PathBuf>,
    binds: usize,
    filesystems: usize,
    unmounted: Vec<PathBuf>,
}

/// [`MountOps`] over a set of paths
#[derive(Debug, Default)]
pub struct FakeMounts {
    state: Mutex<MountState>,
}

impl FakeMounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every mount or unmount of `target` fail with EPERM
    pub fn fail_on(&self, target: &Path) {
        self.state.lock().unwrap().failing.insert(target.to_path_buf());
    }

    pub fn bind_calls(&self) -> usize {
        self.state.lock().unwrap().binds
    }

    pub fn filesystem_mounts(&self) -> usize {
        self.state.lock().unwrap().filesystems
    }

    pub fn unmount_calls(&self) -> usize {
        self.state.lock().unwrap().unmounted.len()
    }

    /// Unmounted targets in call order
    pub fn unmounted(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().unmounted.clone()
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().mounted.iter().cloned().collect()
    }

    fn check(state: &MountState, target: &Path) -> io::Result<()> {
        if state.failing.contains(target) {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }
}

impl MountOps for FakeMounts {
    fn bind(&self, source: &Path, target: &Path, _options: &MountOptions) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, target)?;
        if !source.is_dir() || !target.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        state.binds += 1;
        state.mounted.insert(target.to_path_buf());
        Ok(())
    }

    fn mount_filesystem(&self, fstype: &str, target: &Path) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, target)?;
        if fstype == "binfmt_misc" {
            fs::write(target.join("register"), b"")?;
        }
        state.filesystems += 1;
        state.mounted.insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path, _detach: bool) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, target)?;
        if !state.mounted.remove(target) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        state.unmounted.push(target.to_path_buf());
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> io::Result<bool> {
        Ok(self.state.lock().unwrap().mounted.contains(target))
    }
}

#[derive(Debug, Default)]
struct ProcessState {
    roots: BTreeMap<u32, PathBuf>,
    unkillable: HashSet<u32>,
    killed: Vec<u32>,
    scans: usize,
}

/// [`ProcessTable`] with processes registered by hand
#[derive(Debug, Default)]
pub struct FakeProcesses {
    state: Mutex<ProcessState>,
}

impl FakeProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn_in(&self, root: &Path, pid: u32) {
        self.state.lock().unwrap().roots.insert(pid, root.to_path_buf());
    }

    /// SIGKILL will be recorded but the process stays
    pub fn make_unkillable(&self, pid: u32) {
        self.state.lock().unwrap().unkillable.insert(pid);
    }

    pub fn killed(&self) -> Vec<u32> {
        let mut killed = self.state.lock().unwrap().killed.clone();
        killed.sort_unstable();
        killed.dedup();
        killed
    }

    pub fn alive(&self) -> Vec<u32> {
        self.state.lock().unwrap().roots.keys().copied().collect()
    }

    /// Number of `rooted_at` queries
    pub fn scans(&self) -> usize {
        self.state.lock().unwrap().scans
    }
}

impl ProcessTable for FakeProcesses {
    fn rooted_at(&self, root: &Path) -> io::Result<Vec<u32>> {
        let mut state = self.state.lock().unwrap();
        state.scans += 1;
        Ok(state
            .roots
            .iter()
            .filter(|(_, dir)| dir.starts_with(root))
            .map(|(pid, _)| *pid)
            .collect())
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.killed.push(pid);
        if !state.unkillable.contains(&pid) {
            state.roots.remove(&pid);
        }
        Ok(())
    }
}

type LaunchHook = Box<dyn Fn(&Path) + Send + Sync>;

/// [`Launcher`] that records the command instead of running it
pub struct FakeLauncher {
    result: std::result::Result<LaunchOutcome, String>,
    hook: Option<LaunchHook>,
    calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
}

impl FakeLauncher {
    pub fn exiting(code: i32) -> Self {
        Self {
            result: Ok(LaunchOutcome {
                exit_code: Some(code),
                ..LaunchOutcome::default()
            }),
            hook: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fails to start the command with `reason`
    pub fn failing(reason: &str) -> Self {
        Self {
            result: Err(reason.to_string()),
            hook: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Run `hook` with the root while the session is active
    pub fn with_hook(mut self, hook: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, root: &Path, command: &[String]) -> Result<LaunchOutcome> {
        self.calls
            .lock()
            .unwrap()
            .push((root.to_path_buf(), command.to_vec()));
        if let Some(hook) = &self.hook {
            hook(root);
        }
        self.result
            .clone()
            .map_err(|reason| EchrootError::SessionExec {
                root: root.to_path_buf(),
                command: command.to_vec(),
                reason,
            })
    }
}

/// [`Fetcher`] that either drops a static ELF into the root or fails
#[derive(Debug)]
pub struct FakeFetcher {
    succeed: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn succeeding() -> Self {
        Self {
            succeed: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            succeed: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, binary: &str, root: &Path) -> std::result::Result<(), String> {
        self.calls.lock().unwrap().push(binary.to_string());
        if !self.succeed {
            return Err(format!("no download source for {}", binary));
        }

        let dir = root.join("usr/bin");
        fs::create_dir_all(&dir).map_err(|e| e.to_string())?;
        let host = Architecture::of_build_target().unwrap_or(Architecture::X86_64);
        fs::write(dir.join(binary), elf_image(host, false)).map_err(|e| e.to_string())
    }
}
