//! Binary architecture detection
//!
//! Classifies executables by the machine field of their ELF header and
//! resolves the architecture of a whole root from a list of candidates.

pub mod elf;

use crate::fs::paths::resolve_in_root;
use elf::{ElfClass, ElfHeader};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

const EM_386: u16 = 3;
const EM_ARM: u16 = 40;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

/// Instruction-set architectures this crate knows how to handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "i386")]
    I386,
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "arm")]
    Arm,
    #[serde(rename = "aarch64")]
    Aarch64,
}

impl Architecture {
    pub const ALL: [Architecture; 4] = [
        Architecture::I386,
        Architecture::X86_64,
        Architecture::Arm,
        Architecture::Aarch64,
    ];

    pub fn from_machine(machine: u16) -> Option<Self> {
        match machine {
            EM_386 => Some(Architecture::I386),
            EM_X86_64 => Some(Architecture::X86_64),
            EM_ARM => Some(Architecture::Arm),
            EM_AARCH64 => Some(Architecture::Aarch64),
            _ => None,
        }
    }

    /// `e_machine` code
    pub fn machine(self) -> u16 {
        match self {
            Architecture::I386 => EM_386,
            Architecture::X86_64 => EM_X86_64,
            Architecture::Arm => EM_ARM,
            Architecture::Aarch64 => EM_AARCH64,
        }
    }

    pub fn class(self) -> ElfClass {
        match self {
            Architecture::I386 | Architecture::Arm => ElfClass::Elf32,
            Architecture::X86_64 | Architecture::Aarch64 => ElfClass::Elf64,
        }
    }

    /// Name used by qemu (`qemu-<name>-static`) and for binfmt_misc entries
    pub fn qemu_name(self) -> &'static str {
        match self {
            Architecture::I386 => "i386",
            Architecture::X86_64 => "x86_64",
            Architecture::Arm => "arm",
            Architecture::Aarch64 => "aarch64",
        }
    }

    pub fn from_qemu_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.qemu_name() == name)
    }

    /// Architecture this binary was compiled for
    pub fn of_build_target() -> Option<Self> {
        match std::env::consts::ARCH {
            "x86" => Some(Architecture::I386),
            "x86_64" => Some(Architecture::X86_64),
            "arm" => Some(Architecture::Arm),
            "aarch64" => Some(Architecture::Aarch64),
            _ => None,
        }
    }

    /// Whether a host of this architecture executes `guest` binaries without emulation
    pub fn runs_natively(self, guest: Architecture) -> bool {
        self == guest
            || matches!(
                (self, guest),
                (Architecture::X86_64, Architecture::I386)
                    | (Architecture::Aarch64, Architecture::Arm)
            )
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Architecture::I386 => "Intel 80386",
            Architecture::X86_64 => "x86-64",
            Architecture::Arm => "ARM",
            Architecture::Aarch64 => "ARM64",
        };
        f.write_str(label)
    }
}

/// Outcome of probing one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// Missing, unreadable, truncated or not an ELF image
    NotBinary,
    /// Valid header with a machine code outside the known set
    Unknown { machine: u16 },
    Known(Architecture),
}

impl ProbeResult {
    pub fn architecture(self) -> Option<Architecture> {
        match self {
            ProbeResult::Known(arch) => Some(arch),
            _ => None,
        }
    }
}

/// Classify the executable at `path`
pub fn probe_file(path: &Path) -> ProbeResult {
    match ElfHeader::read(path) {
        None => ProbeResult::NotBinary,
        Some(header) => match Architecture::from_machine(header.machine) {
            Some(arch) => ProbeResult::Known(arch),
            None => ProbeResult::Unknown {
                machine: header.machine,
            },
        },
    }
}

/// Resolve the architecture of `root` from the first candidate that probes
/// as a known binary.
///
/// Candidates are paths as seen from inside the root; symlinks are followed
/// within it. Returns the host path of the winning candidate.
pub fn probe_root(root: &Path, candidates: &[PathBuf]) -> Option<(PathBuf, Architecture)> {
    for candidate in candidates {
        let resolved = match resolve_in_root(root, candidate) {
            Ok(p) => p,
            Err(e) => {
                debug!("Skipping probe candidate {}: {}", candidate.display(), e);
                continue;
            }
        };

        match probe_file(&resolved) {
            ProbeResult::Known(arch) => {
                debug!("{} is {}", resolved.display(), arch);
                return Some((resolved, arch));
            }
            ProbeResult::Unknown { machine } => {
                debug!(
                    "{} has unsupported machine type {}",
                    resolved.display(),
                    machine
                );
            }
            ProbeResult::NotBinary => {
                debug!("{} is not a recognized binary", resolved.display());
            }
        }
    }
    None
}
