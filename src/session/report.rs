/// Machine-readable account of one session
use crate::emulator::EmulatorBinding;
use crate::kernel::launch::LaunchOutcome;
use crate::probe::Architecture;
use crate::safety::cleanup::TeardownReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// How guest binaries were run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InterpreterReport {
    /// Session ended before the architecture was resolved
    #[default]
    Unresolved,
    Native,
    Emulated { binding: EmulatorBinding },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedPair {
    pub source: PathBuf,
    /// Host path inside the root
    pub target: PathBuf,
}

/// A configured bind or substitution that was left out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedSpec {
    pub kind: String,
    pub source: PathBuf,
    pub target: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub root: PathBuf,
    pub guest_arch: Option<Architecture>,
    pub host_arch: Option<Architecture>,
    /// Candidate the guest architecture was read from
    pub probed: Option<PathBuf>,
    pub interpreter: InterpreterReport,
    pub binds: Vec<AppliedPair>,
    pub substitutions: Vec<AppliedPair>,
    pub skipped: Vec<SkippedSpec>,
    pub launch: Option<LaunchOutcome>,
    /// Message of the error that ended the session early
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub teardown: TeardownReport,
}

impl SessionReport {
    pub fn new(root: &Path) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            root: root.to_path_buf(),
            guest_arch: None,
            host_arch: None,
            probed: None,
            interpreter: InterpreterReport::Unresolved,
            binds: Vec::new(),
            substitutions: Vec::new(),
            skipped: Vec::new(),
            launch: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            teardown: TeardownReport::default(),
        }
    }

    pub fn skip(&mut self, kind: &str, source: &Path, target: &Path, reason: String) {
        self.skipped.push(SkippedSpec {
            kind: kind.to_string(),
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            reason,
        });
    }

    pub fn finish(&mut self, error: Option<String>) {
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    /// Exit status to hand back to the caller: the command's own code, or
    /// 128 + signal number when it was killed
    pub fn exit_code(&self) -> i32 {
        match &self.launch {
            Some(LaunchOutcome {
                exit_code: Some(code),
                ..
            }) => *code,
            Some(LaunchOutcome {
                signal: Some(signal),
                ..
            }) => 128 + signal,
            _ => 1,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}
