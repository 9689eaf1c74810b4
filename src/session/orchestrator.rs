/// Session state machine
///
/// `NEW -> LOCKED -> VALIDATED -> PREPARED -> ACTIVE -> TEARDOWN -> DONE`
///
/// The lock guard and the [`TeardownGuard`] are both scoped to
/// [`ChrootSession::run`], so teardown and lock release happen on every exit
/// path, panics included. Teardown is always finished before the lock is
/// released.
use super::report::{AppliedPair, InterpreterReport, SessionReport};
use super::Host;
use crate::config::types::{EchrootError, Result, SessionConfig};
use crate::emulator::{EmulatorProvisioner, Interpreter};
use crate::fs::paths::resolve_parent_in_root;
use crate::fs::substitute::FileSubstitution;
use crate::kernel::mount::BindMount;
use crate::probe::{probe_root, Architecture};
use crate::safety::cleanup::{Applied, TeardownGuard};
use crate::safety::lock_manager::SessionLock;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Grace period for evicted processes to disappear
const EVICTION_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    New,
    Locked,
    Validated,
    Prepared,
    Active,
    Teardown,
    Done,
}

/// One chroot session over one root
pub struct ChrootSession {
    config: SessionConfig,
    host: Host,
    provisioner: Arc<EmulatorProvisioner>,
    state: SessionState,
    grace: Duration,
    report: SessionReport,
}

impl ChrootSession {
    pub fn new(config: SessionConfig, host: Host) -> Self {
        let provisioner = Arc::new(EmulatorProvisioner::new(
            config.emulator.clone(),
            host.fetcher.clone(),
            host.mounts.clone(),
        ));
        let report = SessionReport::new(&config.root);
        Self {
            config,
            host,
            provisioner,
            state: SessionState::New,
            grace: EVICTION_GRACE,
            report,
        }
    }

    /// How long teardown waits for evicted processes to exit
    pub fn with_eviction_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Report of the latest run, complete even when the run failed
    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run the session to completion.
    ///
    /// Lock and validation failures return before anything is touched.
    /// Failures from architecture resolution, emulator provisioning and
    /// launching the command return after teardown has run.
    pub fn run(&mut self) -> Result<SessionReport> {
        if self.state != SessionState::New {
            return Err(EchrootError::Config(format!(
                "session for {} already ran",
                self.config.root.display()
            )));
        }
        self.config.check()?;

        let result = self.run_locked();
        self.report
            .finish(result.as_ref().err().map(|e| e.to_string()));
        self.transition(SessionState::Done);

        match result {
            Ok(()) => {
                info!("Session {} finished", self.report.session_id);
                Ok(self.report.clone())
            }
            Err(e) => {
                error!("Session for {} failed: {}", self.config.root.display(), e);
                Err(e)
            }
        }
    }

    fn run_locked(&mut self) -> Result<()> {
        let lock = SessionLock::new(&self.config.root, &self.config.lock)?;
        let _lock_guard = lock.acquire()?;
        self.transition(SessionState::Locked);

        let root = self.validate()?;
        self.report.root = root.clone();
        self.transition(SessionState::Validated);

        let mut teardown = TeardownGuard::new(
            root.clone(),
            self.host.processes.clone(),
            self.provisioner.clone(),
            self.grace,
        );

        let result = match self.prepare(&root, &mut teardown) {
            Ok(()) => {
                self.transition(SessionState::Prepared);
                self.transition(SessionState::Active);
                self.execute(&root)
            }
            Err(e) => Err(e),
        };

        self.transition(SessionState::Teardown);
        self.report.teardown = teardown.finish();
        result
    }

    /// Root must be an existing directory; returns its canonical path
    fn validate(&self) -> Result<PathBuf> {
        let root = &self.config.root;
        let invalid = |reason: String| EchrootError::Validation {
            path: root.clone(),
            reason,
        };

        match fs::metadata(root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(invalid("not a directory".to_string())),
            Err(e) => return Err(invalid(e.to_string())),
        }
        root.canonicalize().map_err(|e| invalid(e.to_string()))
    }

    fn prepare(&mut self, root: &Path, teardown: &mut TeardownGuard) -> Result<()> {
        self.apply_binds(root, teardown);
        self.apply_substitutions(root, teardown);

        let (probed, guest) = probe_root(root, &self.config.probe_candidates).ok_or_else(|| {
            EchrootError::ArchitectureUnresolved {
                root: root.to_path_buf(),
                candidates: self.config.probe_candidates.clone(),
            }
        })?;
        self.report.guest_arch = Some(guest);
        self.report.probed = Some(probed);

        let host = self.host_architecture().ok_or_else(|| EchrootError::EmulatorProvision {
            arch: guest.to_string(),
            reason: "cannot determine host architecture".to_string(),
        })?;
        self.report.host_arch = Some(host);

        match self.provisioner.resolve(root, host, guest)? {
            Interpreter::Native => self.report.interpreter = InterpreterReport::Native,
            Interpreter::Emulated(binding) => {
                self.report.interpreter = InterpreterReport::Emulated {
                    binding: binding.clone(),
                };
                teardown.push(Applied::Emulator(binding));
            }
        }
        Ok(())
    }

    fn host_architecture(&self) -> Option<Architecture> {
        probe_root(&self.config.host_root, &self.config.probe_candidates)
            .map(|(_, arch)| arch)
            .or_else(|| {
                debug!(
                    "Cannot probe host root {}, using build target",
                    self.config.host_root.display()
                );
                Architecture::of_build_target()
            })
    }

    /// Each bind is best-effort: a failed one is skipped, not fatal
    fn apply_binds(&mut self, root: &Path, teardown: &mut TeardownGuard) {
        for spec in &self.config.binds {
            let mut bind = match BindMount::from_spec(root, spec, self.host.mounts.clone()) {
                Ok(bind) => bind,
                Err(e) => {
                    warn!("Skipping bind of {}: {}", spec.source.display(), e);
                    self.report
                        .skip("bind", &spec.source, &spec.target, e.to_string());
                    continue;
                }
            };

            // Someone else's mount; unmounting it at teardown would break them
            if bind.is_bound() {
                warn!("{} is already mounted, leaving it alone", bind.target().display());
                self.report.skip(
                    "bind",
                    &spec.source,
                    &spec.target,
                    "target is already a mountpoint".to_string(),
                );
                continue;
            }

            match bind.bind() {
                Ok(()) => {
                    self.report.binds.push(AppliedPair {
                        source: bind.source().to_path_buf(),
                        target: bind.target().to_path_buf(),
                    });
                    teardown.push(Applied::Bind(bind));
                }
                Err(e) => {
                    warn!("Skipping bind of {}: {}", spec.source.display(), e);
                    self.report
                        .skip("bind", &spec.source, &spec.target, e.to_string());
                }
            }
        }
    }

    /// Same policy as binds
    fn apply_substitutions(&mut self, root: &Path, teardown: &mut TeardownGuard) {
        for spec in &self.config.substitutions {
            let applied = resolve_parent_in_root(root, &spec.dest)
                .map_err(|e| EchrootError::Substitution {
                    replacement: spec.source.clone(),
                    dest: spec.dest.clone(),
                    reason: format!("cannot resolve destination in root: {}", e),
                })
                .and_then(|dest| FileSubstitution::new(&spec.source, &dest))
                .and_then(|mut sub| sub.substitute().map(|()| sub));

            match applied {
                Ok(sub) => {
                    self.report.substitutions.push(AppliedPair {
                        source: sub.source().to_path_buf(),
                        target: sub.dest().to_path_buf(),
                    });
                    teardown.push(Applied::Substitution(sub));
                }
                Err(e) => {
                    warn!("Skipping substitution of {}: {}", spec.dest.display(), e);
                    self.report
                        .skip("substitution", &spec.source, &spec.dest, e.to_string());
                }
            }
        }
    }

    fn execute(&mut self, root: &Path) -> Result<()> {
        info!(
            "Session {} active in {}",
            self.report.session_id,
            root.display()
        );
        let outcome = self.host.launcher.launch(root, &self.config.command)?;
        self.report.launch = Some(outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{BindSpec, LockSettings, SubstitutionSpec};
    use crate::kernel::mount::{MountOps, MountOptions};
    use crate::safety::cleanup::Outcome;
    use crate::testing::fakes::{FakeFetcher, FakeLauncher, FakeMounts, FakeProcesses};
    use crate::testing::fixtures::{elf_image, ScratchDir};

    struct Rig {
        scratch: ScratchDir,
        mounts: Arc<FakeMounts>,
        processes: Arc<FakeProcesses>,
    }

    impl Rig {
        fn new(name: &str, guest: Architecture) -> Self {
            let scratch = ScratchDir::new(name);
            scratch.write_file("root/bin/sh", &elf_image(guest, true));
            scratch.write_file("host/bin/sh", &elf_image(Architecture::X86_64, true));
            scratch.mkdir("binfmt_misc");
            scratch.mkdir("locks");
            Rig {
                scratch,
                mounts: Arc::new(FakeMounts::new()),
                processes: Arc::new(FakeProcesses::new()),
            }
        }

        fn config(&self) -> SessionConfig {
            let mut config = SessionConfig::new(self.scratch.path().join("root"));
            config.host_root = self.scratch.path().join("host");
            config.lock = LockSettings {
                lock_dir: Some(self.scratch.path().join("locks")),
                timeout_secs: Some(0),
                retry_ms: 10,
            };
            config.emulator.search_dirs = vec![self.scratch.path().join("hostbin")];
            config.emulator.binfmt_dir = self.scratch.path().join("binfmt_misc");
            config.emulator.selinux_enforce = self.scratch.path().join("no-selinux");
            config
        }

        fn session(
            &self,
            config: SessionConfig,
            launcher: FakeLauncher,
            fetcher: FakeFetcher,
        ) -> ChrootSession {
            let host = Host {
                mounts: self.mounts.clone(),
                processes: self.processes.clone(),
                launcher: Arc::new(launcher),
                fetcher: Arc::new(fetcher),
            };
            ChrootSession::new(config, host).with_eviction_grace(Duration::ZERO)
        }
    }

    #[test]
    fn test_missing_root_fails_validation() {
        let rig = Rig::new("session-missing", Architecture::X86_64);
        let mut config = rig.config();
        config.root = rig.scratch.path().join("nope");
        let mut session = rig.session(config, FakeLauncher::exiting(0), FakeFetcher::failing());

        let err = session.run().unwrap_err();
        assert!(matches!(err, EchrootError::Validation { .. }));
        assert_eq!(session.state(), SessionState::Done);
        assert_eq!(rig.processes.scans(), 0);
    }

    #[test]
    fn test_native_session_runs_command() {
        let rig = Rig::new("session-native", Architecture::X86_64);
        rig.scratch.mkdir("host/data");
        let mut config = rig.config();
        config.binds = vec![BindSpec::parse(&format!(
            "{}=/mnt/data",
            rig.scratch.path().join("host/data").display()
        ))
        .unwrap()];
        config.command = vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()];

        let launcher = FakeLauncher::exiting(7);
        let mut session = rig.session(config, launcher, FakeFetcher::failing());
        let report = session.run().unwrap();

        assert_eq!(report.guest_arch, Some(Architecture::X86_64));
        assert!(matches!(report.interpreter, InterpreterReport::Native));
        assert_eq!(report.binds.len(), 1);
        assert_eq!(report.exit_code(), 7);
        assert!(report.teardown.is_clean());
        assert!(rig.mounts.mounted().is_empty());
        assert!(!rig.scratch.path().join("root/mnt").exists());
    }

    #[test]
    fn test_failed_bind_is_skipped() {
        let rig = Rig::new("session-skip", Architecture::X86_64);
        let mut config = rig.config();
        config.binds = vec![BindSpec {
            source: rig.scratch.path().join("host/missing"),
            target: PathBuf::from("/mnt"),
            options: Vec::new(),
        }];
        let mut session = rig.session(config, FakeLauncher::exiting(0), FakeFetcher::failing());

        let report = session.run().unwrap();
        assert!(report.binds.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].kind, "bind");
    }

    #[test]
    fn test_unresolved_architecture_unwinds() {
        let rig = Rig::new("session-unresolved", Architecture::X86_64);
        rig.scratch.write_file("root/bin/sh", b"#!/not/elf\n");
        let source = rig.scratch.write_file("host/hosts", b"host");
        rig.scratch.write_file("root/etc/hosts", b"guest");
        let mut config = rig.config();
        config.substitutions = vec![SubstitutionSpec {
            source,
            dest: PathBuf::from("/etc/hosts"),
        }];
        let launcher = Arc::new(FakeLauncher::exiting(0));
        let mut session = ChrootSession::new(
            config,
            Host {
                mounts: rig.mounts.clone(),
                processes: rig.processes.clone(),
                launcher: launcher.clone(),
                fetcher: Arc::new(FakeFetcher::failing()),
            },
        );

        let err = session.run().unwrap_err();
        assert!(matches!(err, EchrootError::ArchitectureUnresolved { .. }));
        assert!(launcher.calls().is_empty());
        assert_eq!(
            fs::read(rig.scratch.path().join("root/etc/hosts")).unwrap(),
            b"guest"
        );
        assert_eq!(session.report().substitutions.len(), 1);
        assert!(session.report().error.is_some());
    }

    #[test]
    fn test_launch_failure_still_tears_down() {
        let rig = Rig::new("session-exec", Architecture::X86_64);
        let root = rig.scratch.path().join("root");
        rig.processes.spawn_in(&root, 4242);
        let mut session = rig.session(
            rig.config(),
            FakeLauncher::failing("no such file"),
            FakeFetcher::failing(),
        );

        let err = session.run().unwrap_err();
        assert!(matches!(err, EchrootError::SessionExec { .. }));
        assert_eq!(rig.processes.killed(), vec![4242]);
        assert_eq!(session.report().teardown.steps[0].outcome, Outcome::Done);
    }

    #[test]
    fn test_session_runs_once() {
        let rig = Rig::new("session-once", Architecture::X86_64);
        let mut session =
            rig.session(rig.config(), FakeLauncher::exiting(0), FakeFetcher::failing());
        session.run().unwrap();
        assert!(matches!(session.run(), Err(EchrootError::Config(_))));
    }

    #[test]
    fn test_existing_mountpoint_left_alone() {
        let rig = Rig::new("session-premounted", Architecture::X86_64);
        let data = rig.scratch.mkdir("host/data");
        let target = rig.scratch.mkdir("root/mnt");
        rig.mounts
            .bind(&data, &target, &MountOptions::default())
            .unwrap();

        let mut config = rig.config();
        config.binds = vec![BindSpec {
            source: data,
            target: PathBuf::from("/mnt"),
            options: Vec::new(),
        }];
        let mut session = rig.session(config, FakeLauncher::exiting(0), FakeFetcher::failing());
        let report = session.run().unwrap();

        assert!(report.binds.is_empty());
        assert_eq!(rig.mounts.mounted(), vec![target]);
    }
}
