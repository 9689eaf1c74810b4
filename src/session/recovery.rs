/// Unwinding what a killed session left behind
///
/// Works from durable facts only: backup files next to substituted files,
/// the live mount table, and binfmt_misc entry names derived from the root.
/// Directories a session created and emulator binaries it installed leave
/// no record and are not removed.
use super::Host;
use crate::config::types::{EchrootError, Result, SessionConfig};
use crate::emulator::EmulatorProvisioner;
use crate::fs::paths::{resolve_in_root, resolve_parent_in_root};
use crate::fs::substitute::FileSubstitution;
use crate::kernel::mount::MountOptions;
use crate::kernel::process::evict_processes;
use crate::safety::cleanup::{Outcome, TeardownReport};
use crate::safety::lock_manager::SessionLock;
use log::info;
use std::path::{Path, PathBuf};
use std::time::Duration;

const RECOVERY_GRACE: Duration = Duration::from_secs(5);

/// Tear down the resources `config` describes, under the session lock.
///
/// Any mount found at a configured bind target is unmounted. Unlike a live
/// session, which leaves alone a target that was already a mountpoint,
/// recovery cannot tell a mount made by the crashed session from one that
/// was there before it.
pub fn recover(config: &SessionConfig, host: &Host) -> Result<TeardownReport> {
    let lock = SessionLock::new(&config.root, &config.lock)?;
    let _lock_guard = lock.acquire()?;

    let root = config
        .root
        .canonicalize()
        .map_err(|e| EchrootError::Validation {
            path: config.root.clone(),
            reason: e.to_string(),
        })?;
    info!("Recovering {}", root.display());

    let mut report = TeardownReport::default();
    report.record(
        "evict processes",
        evict_processes(host.processes.as_ref(), &root, RECOVERY_GRACE),
    );

    let provisioner = EmulatorProvisioner::new(
        config.emulator.clone(),
        host.fetcher.clone(),
        host.mounts.clone(),
    );
    report.record("unregister emulators", provisioner.unregister_root(&root));

    for spec in config.substitutions.iter().rev() {
        let step = format!("restore {}", spec.dest.display());
        let outcome = match resolve_parent_in_root(&root, &spec.dest) {
            Ok(dest) => restore_leftover(&spec.source, &dest),
            Err(e) => Outcome::Failed(format!("cannot resolve in root: {}", e)),
        };
        report.record(step, outcome);
    }

    for spec in config.binds.iter().rev() {
        let step = format!("unbind {}", spec.target.display());
        let outcome = match resolve_in_root(&root, &spec.target) {
            Ok(target) => unmount_leftover(host, &spec.options, target),
            Err(e) => Outcome::Failed(format!("cannot resolve in root: {}", e)),
        };
        report.record(step, outcome);
    }

    Ok(report)
}

fn restore_leftover(source: &Path, dest: &Path) -> Outcome {
    match FileSubstitution::adopt(source, dest) {
        Ok(mut sub) if sub.is_substituted() => Outcome::from_result(sub.restore()),
        Ok(_) => Outcome::Skipped,
        Err(e) => Outcome::Failed(e.to_string()),
    }
}

fn unmount_leftover(host: &Host, options: &[String], target: PathBuf) -> Outcome {
    match host.mounts.is_mounted(&target) {
        Ok(false) => Outcome::Skipped,
        Ok(true) => {
            let detach = MountOptions::parse(options)
                .map(|o| o.recursive)
                .unwrap_or(false);
            Outcome::from_result(host.mounts.unmount(&target, detach))
        }
        Err(e) => Outcome::Failed(format!("cannot read mount table: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{BindSpec, SubstitutionSpec};
    use crate::kernel::mount::MountOps;
    use crate::testing::fakes::{FakeFetcher, FakeLauncher, FakeMounts, FakeProcesses};
    use crate::testing::fixtures::ScratchDir;
    use std::fs;
    use std::sync::Arc;

    #[test]
    fn test_recover_restores_and_unmounts() {
        let scratch = ScratchDir::new("recover");
        let root = scratch.mkdir("root");
        let data = scratch.mkdir("host/data");
        let target = scratch.mkdir("root/mnt");
        let source = scratch.write_file("host/hosts", b"session");
        scratch.write_file("root/etc/hosts", b"session");
        scratch.write_file("root/etc/.hosts.bak", b"original");

        let mounts = Arc::new(FakeMounts::new());
        mounts
            .bind(&data, &target, &MountOptions::default())
            .unwrap();
        let processes = Arc::new(FakeProcesses::new());
        processes.spawn_in(&root, 99);

        let mut config = SessionConfig::new(&root);
        config.lock.lock_dir = Some(scratch.mkdir("locks"));
        config.emulator.binfmt_dir = scratch.mkdir("binfmt_misc");
        config.binds = vec![BindSpec {
            source: data,
            target: PathBuf::from("/mnt"),
            options: Vec::new(),
        }];
        config.substitutions = vec![SubstitutionSpec {
            source,
            dest: PathBuf::from("/etc/hosts"),
        }];

        let host = Host {
            mounts: mounts.clone(),
            processes: processes.clone(),
            launcher: Arc::new(FakeLauncher::exiting(0)),
            fetcher: Arc::new(FakeFetcher::failing()),
        };
        let report = recover(&config, &host).unwrap();

        assert!(report.is_clean());
        assert_eq!(processes.killed(), vec![99]);
        assert_eq!(mounts.unmounted(), vec![target]);
        assert_eq!(fs::read(root.join("etc/hosts")).unwrap(), b"original");
        assert!(!root.join("etc/.hosts.bak").exists());
        assert_eq!(report.steps[1].outcome, Outcome::Skipped);
    }

    #[test]
    fn test_recover_removes_file_that_did_not_exist() {
        let scratch = ScratchDir::new("recover-missing-dest");
        let root = scratch.mkdir("root");
        scratch.mkdir("root/etc");
        let source = scratch.write_file("host/resolv.conf", b"nameserver 1.1.1.1\n");
        let dest = root.join("etc/resolv.conf");

        // Session killed while the substitution was in place
        let mut crashed = FileSubstitution::new(&source, &dest).unwrap();
        crashed.substitute().unwrap();
        std::mem::forget(crashed);

        let mut config = SessionConfig::new(&root);
        config.lock.lock_dir = Some(scratch.mkdir("locks"));
        config.emulator.binfmt_dir = scratch.mkdir("binfmt_misc");
        config.substitutions = vec![SubstitutionSpec {
            source,
            dest: PathBuf::from("/etc/resolv.conf"),
        }];

        let host = Host {
            mounts: Arc::new(FakeMounts::new()),
            processes: Arc::new(FakeProcesses::new()),
            launcher: Arc::new(FakeLauncher::exiting(0)),
            fetcher: Arc::new(FakeFetcher::failing()),
        };
        let report = recover(&config, &host).unwrap();

        assert!(report.is_clean());
        assert!(fs::symlink_metadata(&dest).is_err());
        assert!(fs::read_dir(root.join("etc")).unwrap().next().is_none());
    }

    #[test]
    fn test_recover_clean_root_is_all_skipped() {
        let scratch = ScratchDir::new("recover-clean");
        let root = scratch.mkdir("root");
        scratch.mkdir("host/data");
        let mut config = SessionConfig::new(&root);
        config.lock.lock_dir = Some(scratch.mkdir("locks"));
        config.emulator.binfmt_dir = scratch.mkdir("binfmt_misc");
        config.binds = vec![BindSpec {
            source: scratch.path().join("host/data"),
            target: PathBuf::from("/mnt"),
            options: vec!["rbind".to_string()],
        }];

        let host = Host {
            mounts: Arc::new(FakeMounts::new()),
            processes: Arc::new(FakeProcesses::new()),
            launcher: Arc::new(FakeLauncher::exiting(0)),
            fetcher: Arc::new(FakeFetcher::failing()),
        };
        let report = recover(&config, &host).unwrap();
        assert!(report
            .steps
            .iter()
            .all(|s| s.outcome == Outcome::Skipped));
    }
}
