/// Installs and registers a static user-mode emulator for a foreign root
use crate::config::types::{EchrootError, EmulatorSettings, Result};
use crate::emulator::fetch::Fetcher;
use crate::fs::paths::{make_dirs, path_digest, remove_dirs, resolve_in_root};
use crate::kernel::binfmt::{BinfmtEntry, BinfmtRegistry};
use crate::kernel::mount::MountOps;
use crate::probe::elf::is_dynamically_linked;
use crate::probe::Architecture;
use crate::safety::cleanup::Outcome;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lifecycle of an [`EmulatorBinding`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmulatorState {
    Absent,
    Installed,
    Registered,
    Active,
}

/// What happened to SELinux enforcement during setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelinuxOutcome {
    NotPresent,
    AlreadyPermissive,
    Relaxed,
    Failed(String),
}

/// Emulator installed in one root and registered for one architecture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorBinding {
    pub arch: Architecture,
    pub binary_name: String,
    /// Interpreter path as seen inside the root
    pub interpreter: PathBuf,
    /// Same file as a host path
    pub installed_path: PathBuf,
    pub entry_name: String,
    pub state: EmulatorState,
    /// False when the root already shipped the interpreter
    pub installed_by_session: bool,
    pub selinux: Option<SelinuxOutcome>,
    #[serde(skip)]
    created_dirs: Vec<PathBuf>,
}

/// How guest binaries will run
#[derive(Debug)]
pub enum Interpreter {
    /// Host executes the guest directly
    Native,
    Emulated(EmulatorBinding),
}

/// binfmt_misc entry name for `arch` in `root`
///
/// Scoped to the root so host entries and other sessions are never replaced.
pub fn entry_name(root: &Path, arch: Architecture) -> String {
    let digest = path_digest(root);
    format!("echroot-{}-{}", arch.qemu_name(), &digest[..8])
}

fn is_static_elf(path: &Path) -> bool {
    is_dynamically_linked(path) == Some(false)
}

pub struct EmulatorProvisioner {
    settings: EmulatorSettings,
    fetcher: Arc<dyn Fetcher>,
    mounts: Arc<dyn MountOps>,
    registry: BinfmtRegistry,
}

impl EmulatorProvisioner {
    pub fn new(
        settings: EmulatorSettings,
        fetcher: Arc<dyn Fetcher>,
        mounts: Arc<dyn MountOps>,
    ) -> Self {
        let registry = BinfmtRegistry::new(&settings.binfmt_dir);
        Self {
            settings,
            fetcher,
            mounts,
            registry,
        }
    }

    /// Decide how `guest` binaries run on a `host` machine, setting up an
    /// emulator when they cannot run natively
    pub fn resolve(
        &self,
        root: &Path,
        host: Architecture,
        guest: Architecture,
    ) -> Result<Interpreter> {
        if host.runs_natively(guest) {
            info!("{} root runs natively on {} host", guest, host);
            return Ok(Interpreter::Native);
        }
        info!("{} root needs emulation on {} host", guest, host);
        self.setup(root, guest).map(Interpreter::Emulated)
    }

    /// Static `binary_name` from the configured host directories
    fn find_local(&self, binary_name: &str) -> Option<PathBuf> {
        for dir in &self.settings.search_dirs {
            let candidate = dir.join(binary_name);
            if !candidate.is_file() {
                continue;
            }
            match is_dynamically_linked(&candidate) {
                Some(false) => return Some(candidate),
                Some(true) => debug!("Skipping dynamically linked {}", candidate.display()),
                None => debug!("Skipping non-ELF {}", candidate.display()),
            }
        }
        None
    }

    /// Install, register and enable an emulator for `arch` in `root`
    pub fn setup(&self, root: &Path, arch: Architecture) -> Result<EmulatorBinding> {
        let error = |reason: String| EchrootError::EmulatorProvision {
            arch: arch.to_string(),
            reason,
        };

        let root = root.canonicalize()?;
        let binary_name = format!("qemu-{}-static", arch.qemu_name());
        let interpreter = self.settings.install_dir.join(&binary_name);
        let installed_path = resolve_in_root(&root, &interpreter)
            .map_err(|e| error(format!("cannot resolve {}: {}", interpreter.display(), e)))?;

        let mut binding = EmulatorBinding {
            arch,
            binary_name,
            interpreter,
            installed_path,
            entry_name: entry_name(&root, arch),
            state: EmulatorState::Absent,
            installed_by_session: false,
            selinux: None,
            created_dirs: Vec::new(),
        };

        self.install(&root, &mut binding).map_err(error)?;

        let entry = BinfmtEntry::qemu(&binding.entry_name, arch, &binding.interpreter);
        let registered = self
            .registry
            .ensure_mounted(self.mounts.as_ref())
            .and_then(|()| self.registry.register(&entry));
        if let Err(e) = registered {
            warn!("Registration failed, rolling back install of {}", binding.binary_name);
            if let Err(e) = self.uninstall(&mut binding) {
                warn!("Rollback of {} failed: {}", binding.installed_path.display(), e);
            }
            return Err(error(format!("binfmt registration failed: {}", e)));
        }
        binding.state = EmulatorState::Registered;

        binding.selinux = Some(self.relax_selinux());
        binding.state = EmulatorState::Active;
        info!(
            "Emulator {} active for {}",
            binding.interpreter.display(),
            root.display()
        );
        Ok(binding)
    }

    fn install(
        &self,
        root: &Path,
        binding: &mut EmulatorBinding,
    ) -> std::result::Result<(), String> {
        let target = binding.installed_path.clone();

        if fs::symlink_metadata(&target).is_ok() {
            if is_static_elf(&target) {
                info!("Reusing interpreter already in root: {}", target.display());
                binding.state = EmulatorState::Installed;
                return Ok(());
            }
            return Err(format!(
                "{} exists in the root and is not a static ELF binary",
                binding.interpreter.display()
            ));
        }

        let parent = target.parent().unwrap_or(root);
        binding.created_dirs =
            make_dirs(parent).map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;

        let installed = match self.find_local(&binding.binary_name) {
            Some(local) => {
                debug!("Copying {} into root", local.display());
                fs::copy(&local, &target)
                    .map(|_| ())
                    .map_err(|e| format!("cannot copy {}: {}", local.display(), e))
            }
            None => self
                .fetcher
                .fetch(&binding.binary_name, root)
                .and_then(|()| {
                    if is_static_elf(&target) {
                        Ok(())
                    } else {
                        Err(format!(
                            "fetch did not leave a static binary at {}",
                            binding.interpreter.display()
                        ))
                    }
                }),
        };

        binding.installed_by_session = true;
        if let Err(reason) = installed {
            if let Err(e) = self.uninstall(binding) {
                warn!("Rollback of {} failed: {}", target.display(), e);
            }
            return Err(reason);
        }
        binding.state = EmulatorState::Installed;
        info!("Installed {}", target.display());
        Ok(())
    }

    /// Remove the interpreter if this session put it there
    fn uninstall(&self, binding: &mut EmulatorBinding) -> io::Result<()> {
        if binding.installed_by_session {
            match fs::remove_file(&binding.installed_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            remove_dirs(&binding.created_dirs);
            binding.created_dirs.clear();
        }
        binding.state = EmulatorState::Absent;
        Ok(())
    }

    fn relax_selinux(&self) -> SelinuxOutcome {
        let switch = &self.settings.selinux_enforce;
        let current = match fs::read_to_string(switch) {
            Ok(value) => value,
            Err(_) => return SelinuxOutcome::NotPresent,
        };
        if current.trim() == "0" {
            return SelinuxOutcome::AlreadyPermissive;
        }
        match fs::write(switch, "0") {
            Ok(()) => {
                info!("SELinux set to permissive for emulated execution");
                SelinuxOutcome::Relaxed
            }
            Err(e) => {
                warn!(
                    "Could not set SELinux permissive ({}); emulated binaries may fail to start",
                    e
                );
                SelinuxOutcome::Failed(e.to_string())
            }
        }
    }

    /// Unregister, then uninstall. Both steps are attempted.
    pub fn teardown(&self, binding: &mut EmulatorBinding) -> Outcome {
        let mut failures = Vec::new();

        if let Err(e) = self.registry.unregister(&binding.entry_name) {
            warn!("Failed to unregister {}: {}", binding.entry_name, e);
            failures.push(format!("unregister {}: {}", binding.entry_name, e));
        }

        if let Err(e) = self.uninstall(binding) {
            warn!("Failed to remove {}: {}", binding.installed_path.display(), e);
            failures.push(format!("remove {}: {}", binding.installed_path.display(), e));
        }

        if failures.is_empty() {
            Outcome::Done
        } else {
            Outcome::Failed(failures.join("; "))
        }
    }

    /// Remove any entry this tool could have registered for `root`
    pub fn unregister_root(&self, root: &Path) -> Outcome {
        let root = match root.canonicalize() {
            Ok(root) => root,
            Err(e) => return Outcome::Failed(e.to_string()),
        };
        let mut removed = 0;
        let mut failures = Vec::new();
        for arch in Architecture::ALL {
            let name = entry_name(&root, arch);
            if !self.registry.is_registered(&name) {
                continue;
            }
            match self.registry.unregister(&name) {
                Ok(()) => removed += 1,
                Err(e) => failures.push(format!("{}: {}", name, e)),
            }
        }
        match (removed, failures.is_empty()) {
            (_, false) => Outcome::Failed(failures.join("; ")),
            (0, true) => Outcome::Skipped,
            _ => Outcome::Done,
        }
    }
}
