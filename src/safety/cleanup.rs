/// Teardown bookkeeping
///
/// Everything the session applies is pushed onto an [`UnwindStack`] right
/// after it succeeds. Teardown pops it, so resources come off in reverse
/// order of application. Each step is best-effort: its [`Outcome`] is
/// recorded and the next step runs regardless.
use crate::emulator::{EmulatorBinding, EmulatorProvisioner};
use crate::fs::substitute::FileSubstitution;
use crate::kernel::mount::BindMount;
use crate::kernel::process::{evict_processes, ProcessTable};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Result of one best-effort step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Done,
    /// Nothing to do
    Skipped,
    Failed(String),
}

impl Outcome {
    pub fn from_result<E: std::fmt::Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Outcome::Done,
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: String,
    pub outcome: Outcome,
}

/// Ordered outcomes of a teardown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub steps: Vec<StepOutcome>,
}

impl TeardownReport {
    pub fn record(&mut self, step: impl Into<String>, outcome: Outcome) {
        let step = step.into();
        match &outcome {
            Outcome::Failed(reason) => warn!("Teardown step '{}' failed: {}", step, reason),
            _ => debug!("Teardown step '{}': {:?}", step, outcome),
        }
        self.steps.push(StepOutcome { step, outcome });
    }

    pub fn failures(&self) -> Vec<&StepOutcome> {
        self.steps.iter().filter(|s| s.outcome.is_failure()).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.failures().is_empty()
    }
}

/// A resource the session applied and must undo
#[derive(Debug)]
pub enum Applied {
    Bind(BindMount),
    Substitution(FileSubstitution),
    Emulator(EmulatorBinding),
}

impl Applied {
    fn undo(self, provisioner: &EmulatorProvisioner, report: &mut TeardownReport) {
        match self {
            Applied::Emulator(mut binding) => {
                let outcome = provisioner.teardown(&mut binding);
                report.record(format!("remove emulator {}", binding.entry_name), outcome);
            }
            Applied::Substitution(mut sub) => {
                let outcome = Outcome::from_result(sub.restore());
                report.record(format!("restore {}", sub.dest().display()), outcome);
            }
            Applied::Bind(mut bind) => {
                let outcome = Outcome::from_result(bind.unbind());
                report.record(format!("unbind {}", bind.target().display()), outcome);
            }
        }
    }
}

/// LIFO record of applied resources
#[derive(Debug, Default)]
pub struct UnwindStack {
    entries: Vec<Applied>,
}

impl UnwindStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, applied: Applied) {
        self.entries.push(applied);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Applied> {
        self.entries.iter()
    }

    /// Undo everything, most recent first
    pub fn unwind(&mut self, provisioner: &EmulatorProvisioner, report: &mut TeardownReport) {
        while let Some(applied) = self.entries.pop() {
            applied.undo(provisioner, report);
        }
    }
}

/// Runs teardown exactly once: through [`TeardownGuard::finish`] on the
/// normal path, or from `Drop` when setup bails out or panics
pub struct TeardownGuard {
    root: PathBuf,
    processes: Arc<dyn ProcessTable>,
    provisioner: Arc<EmulatorProvisioner>,
    stack: UnwindStack,
    grace: Duration,
    done: bool,
}

impl TeardownGuard {
    pub fn new(
        root: PathBuf,
        processes: Arc<dyn ProcessTable>,
        provisioner: Arc<EmulatorProvisioner>,
        grace: Duration,
    ) -> Self {
        Self {
            root,
            processes,
            provisioner,
            stack: UnwindStack::new(),
            grace,
            done: false,
        }
    }

    pub fn push(&mut self, applied: Applied) {
        self.stack.push(applied);
    }

    pub fn stack(&self) -> &UnwindStack {
        &self.stack
    }

    fn run(&mut self) -> TeardownReport {
        self.done = true;
        info!(
            "Tearing down {} ({} applied resources)",
            self.root.display(),
            self.stack.len()
        );

        let mut report = TeardownReport::default();
        let eviction = evict_processes(self.processes.as_ref(), &self.root, self.grace);
        report.record("evict processes", eviction);
        self.stack.unwind(&self.provisioner, &mut report);

        if report.is_clean() {
            info!("Teardown of {} complete", self.root.display());
        } else {
            warn!(
                "Teardown of {} finished with {} failed step(s)",
                self.root.display(),
                report.failures().len()
            );
        }
        report
    }

    /// Tear down now and return the report
    pub fn finish(mut self) -> TeardownReport {
        self.run()
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if !self.done {
            warn!("Session for {} ended abnormally, tearing down", self.root.display());
            self.run();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::EmulatorSettings;
    use crate::emulator::NoFetch;
    use crate::kernel::mount::MountOptions;
    use crate::testing::fakes::{FakeMounts, FakeProcesses};
    use crate::testing::fixtures::ScratchDir;
    use std::fs;

    fn provisioner(scratch: &ScratchDir, mounts: Arc<FakeMounts>) -> Arc<EmulatorProvisioner> {
        let settings = EmulatorSettings {
            binfmt_dir: scratch.mkdir("binfmt_misc"),
            selinux_enforce: scratch.path().join("no-selinux"),
            ..EmulatorSettings::default()
        };
        Arc::new(EmulatorProvisioner::new(settings, Arc::new(NoFetch), mounts))
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&Outcome::Failed("busy".to_string())).unwrap();
        assert_eq!(json, r#"{"status":"failed","reason":"busy"}"#);
        assert_eq!(
            serde_json::to_string(&Outcome::Done).unwrap(),
            r#"{"status":"done"}"#
        );
    }

    #[test]
    fn test_report_failures() {
        let mut report = TeardownReport::default();
        report.record("a", Outcome::Done);
        report.record("b", Outcome::Failed("nope".to_string()));
        report.record("c", Outcome::Skipped);
        assert!(!report.is_clean());
        assert_eq!(report.failures().len(), 1);
        assert_eq!(report.failures()[0].step, "b");
    }

    #[test]
    fn test_unwind_is_reverse_order() {
        let scratch = ScratchDir::new("cleanup-order");
        let mounts = Arc::new(FakeMounts::new());
        let host = scratch.mkdir("host");
        let outer = scratch.path().join("root/mnt");
        let inner = scratch.path().join("root/mnt/inner");

        let mut stack = UnwindStack::new();
        for target in [&outer, &inner] {
            let mut bind =
                BindMount::new(&host, target, MountOptions::default(), mounts.clone()).unwrap();
            bind.bind().unwrap();
            stack.push(Applied::Bind(bind));
        }

        let mut report = TeardownReport::default();
        stack.unwind(&provisioner(&scratch, mounts.clone()), &mut report);
        assert!(stack.is_empty());
        assert_eq!(mounts.unmounted(), vec![inner.clone(), outer.clone()]);
        assert_eq!(report.steps.len(), 2);
        assert!(report.steps[0].step.ends_with("inner"));
    }

    #[test]
    fn test_guard_tears_down_on_drop() {
        let scratch = ScratchDir::new("cleanup-drop");
        let mounts = Arc::new(FakeMounts::new());
        let processes = Arc::new(FakeProcesses::new());
        let root = scratch.mkdir("root");
        processes.spawn_in(&root, 77);

        let source = scratch.write_file("host/hosts", b"new");
        let dest = scratch.write_file("root/etc/hosts", b"old");
        let mut sub = FileSubstitution::new(&source, &dest).unwrap();
        sub.substitute().unwrap();

        {
            let mut guard = TeardownGuard::new(
                root.clone(),
                processes.clone(),
                provisioner(&scratch, mounts),
                Duration::from_secs(1),
            );
            guard.push(Applied::Substitution(sub));
        }

        assert_eq!(fs::read(&dest).unwrap(), b"old");
        assert_eq!(processes.killed(), vec![77]);
    }

    #[test]
    fn test_finish_runs_once() {
        let scratch = ScratchDir::new("cleanup-once");
        let mounts = Arc::new(FakeMounts::new());
        let processes = Arc::new(FakeProcesses::new());
        let guard = TeardownGuard::new(
            scratch.mkdir("root"),
            processes.clone(),
            provisioner(&scratch, mounts),
            Duration::ZERO,
        );

        let report = guard.finish();
        assert!(report.is_clean());
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].outcome, Outcome::Skipped);
        assert_eq!(processes.scans(), 1);
    }
}
