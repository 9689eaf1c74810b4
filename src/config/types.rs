/// Core types and structures for the echroot system
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Host directory bound into the root
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BindSpec {
    /// Directory on the host
    pub source: PathBuf,
    /// Mountpoint, evaluated relative to the root
    pub target: PathBuf,
    /// mount(8)-style options (`ro`, `rbind`, `nosuid`, ...)
    #[serde(default)]
    pub options: Vec<String>,
}

impl BindSpec {
    /// Parse a binding from the compact form `source=target[:opt,opt]`.
    ///
    /// Without `=` the same path is used on both sides.
    pub fn parse(binding_str: &str) -> Result<Self> {
        let (path_part, options) = match binding_str.split_once(':') {
            Some((paths, opts)) => (paths, opts),
            None => (binding_str, ""),
        };

        let (source, target) = match path_part.split_once('=') {
            Some((_, t)) if t.contains('=') => {
                return Err(EchrootError::Config(format!(
                    "Invalid bind spec '{}'. Use: source=target or source=target:options",
                    binding_str
                )))
            }
            Some((s, t)) => (PathBuf::from(s), PathBuf::from(t)),
            None => (PathBuf::from(path_part), PathBuf::from(path_part)),
        };

        if source.as_os_str().is_empty() || target.as_os_str().is_empty() {
            return Err(EchrootError::Config(format!(
                "Invalid bind spec '{}': empty path",
                binding_str
            )));
        }

        let options = options
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(String::from)
            .collect();

        Ok(BindSpec {
            source,
            target,
            options,
        })
    }
}

/// Host file swapped into the root for the session
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubstitutionSpec {
    /// Replacement file on the host
    pub source: PathBuf,
    /// File inside the root that is replaced
    pub dest: PathBuf,
}

impl SubstitutionSpec {
    /// Parse `source=dest`, or a single path used on both sides
    pub fn parse(spec: &str) -> Result<Self> {
        let (source, dest) = match spec.split_once('=') {
            Some((s, d)) => (PathBuf::from(s), PathBuf::from(d)),
            None => (PathBuf::from(spec), PathBuf::from(spec)),
        };

        if source.as_os_str().is_empty() || dest.as_os_str().is_empty() {
            return Err(EchrootError::Config(format!(
                "Invalid substitution spec '{}': empty path",
                spec
            )));
        }

        Ok(SubstitutionSpec { source, dest })
    }
}

/// Session lock settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Directory holding lock markers (falls back to well-known paths if unset)
    pub lock_dir: Option<PathBuf>,
    /// Give up after this many seconds; wait forever when unset
    pub timeout_secs: Option<u64>,
    /// Fixed backoff between acquisition attempts
    pub retry_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lock_dir: None,
            timeout_secs: None,
            retry_ms: 1000,
        }
    }
}

impl LockSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_ms.max(1))
    }
}

/// Emulator provisioning settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorSettings {
    /// Host directories searched for `qemu-<arch>-static`
    pub search_dirs: Vec<PathBuf>,
    /// Directory inside the root that receives the interpreter
    pub install_dir: PathBuf,
    /// Script invoked as `sh <script> <binary-name> <root>` when no local copy exists
    pub fetch_script: Option<PathBuf>,
    /// Mountpoint of the binfmt_misc filesystem
    pub binfmt_dir: PathBuf,
    /// SELinux enforcement switch
    pub selinux_enforce: PathBuf,
}

impl Default for EmulatorSettings {
    fn default() -> Self {
        let search_dirs = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect::<Vec<_>>())
            .filter(|dirs| !dirs.is_empty())
            .unwrap_or_else(|| vec![PathBuf::from("/usr/local/bin"), PathBuf::from("/usr/bin")]);

        Self {
            search_dirs,
            install_dir: PathBuf::from("/usr/bin"),
            fetch_script: None,
            binfmt_dir: PathBuf::from("/proc/sys/fs/binfmt_misc"),
            selinux_enforce: PathBuf::from("/sys/fs/selinux/enforce"),
        }
    }
}

/// Everything one chroot session needs
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Chroot target
    pub root: PathBuf,
    /// Bind mounts, applied in order
    pub binds: Vec<BindSpec>,
    /// File substitutions, applied in order
    pub substitutions: Vec<SubstitutionSpec>,
    /// Executables probed (in order) to detect the root's architecture
    pub probe_candidates: Vec<PathBuf>,
    /// Interactive command run inside the root
    pub command: Vec<String>,
    /// Root used to detect the host architecture
    pub host_root: PathBuf,
    pub lock: LockSettings,
    pub emulator: EmulatorSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            binds: Vec::new(),
            substitutions: Vec::new(),
            probe_candidates: default_probe_candidates(),
            command: vec!["/bin/sh".to_string()],
            host_root: PathBuf::from("/"),
            lock: LockSettings::default(),
            emulator: EmulatorSettings::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }
}

pub fn default_probe_candidates() -> Vec<PathBuf> {
    ["/bin/sh", "/bin/bash", "/sbin/init"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

/// Error types for echroot operations
#[derive(Error, Debug)]
pub enum EchrootError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Root {path} is not usable: {reason}")]
    Validation { path: PathBuf, reason: String },

    #[error("Directory '{root}' is busy now (owner: {owner_pid:?})")]
    LockBusy {
        root: PathBuf,
        owner_pid: Option<u32>,
    },

    #[error("Lock error: {0}")]
    Lock(LockError),

    #[error("Cannot bind {host_dir} to {target}: {reason}")]
    Binding {
        host_dir: PathBuf,
        target: PathBuf,
        reason: String,
    },

    #[error("Cannot substitute {dest} with {replacement}: {reason}")]
    Substitution {
        replacement: PathBuf,
        dest: PathBuf,
        reason: String,
    },

    #[error("No recognized binary in {root} (checked {candidates:?})")]
    ArchitectureUnresolved {
        root: PathBuf,
        candidates: Vec<PathBuf>,
    },

    #[error("Cannot provision emulator for {arch}: {reason}")]
    EmulatorProvision { arch: String, reason: String },

    #[error("Cannot launch {command:?} in {root}: {reason}")]
    SessionExec {
        root: PathBuf,
        command: Vec<String>,
        reason: String,
    },
}

impl EchrootError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            EchrootError::Io(_) => 74,
            EchrootError::Config(_) => 78,
            EchrootError::Validation { .. } => 66,
            EchrootError::LockBusy { .. } => 75,
            EchrootError::Lock(e) => match e {
                LockError::PermissionDenied { .. } => 77,
                LockError::FilesystemError(_) => 74,
                _ => 1,
            },
            EchrootError::Binding { .. } | EchrootError::Substitution { .. } => 1,
            EchrootError::ArchitectureUnresolved { .. } => 69,
            EchrootError::EmulatorProvision { .. } => 69,
            EchrootError::SessionExec { .. } => 126,
        }
    }
}

/// Result type for echroot operations
pub type Result<T> = std::result::Result<T, EchrootError>;

/// Session lock errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Root {root} is busy (owned by PID {owner_pid:?})")]
    Busy {
        root: PathBuf,
        owner_pid: Option<u32>,
    },

    #[error("Timeout waiting for {root} after {waited:?} (current owner: {owner_pid:?})")]
    Timeout {
        root: PathBuf,
        waited: Duration,
        owner_pid: Option<u32>,
    },

    #[error("Lock directory permission denied: {details}")]
    PermissionDenied { details: String },

    #[error("Filesystem error: {0}")]
    FilesystemError(#[from] std::io::Error),

    #[error("Lock corruption detected at {path}: {details}")]
    CorruptedLock { path: PathBuf, details: String },
}

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

impl From<LockError> for EchrootError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy { root, owner_pid } | LockError::Timeout { root, owner_pid, .. } => {
                EchrootError::LockBusy { root, owner_pid }
            }
            other => EchrootError::Lock(other),
        }
    }
}

impl From<nix::errno::Errno> for EchrootError {
    fn from(err: nix::errno::Errno) -> Self {
        EchrootError::Io(std::io::Error::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_spec_parse_with_options() {
        let spec = BindSpec::parse("/dev=/dev:rbind,ro").unwrap();
        assert_eq!(spec.source, PathBuf::from("/dev"));
        assert_eq!(spec.target, PathBuf::from("/dev"));
        assert_eq!(spec.options, vec!["rbind".to_string(), "ro".to_string()]);
    }

    #[test]
    fn test_bind_spec_parse_same_path() {
        let spec = BindSpec::parse("/proc").unwrap();
        assert_eq!(spec.source, spec.target);
        assert!(spec.options.is_empty());
    }

    #[test]
    fn test_bind_spec_rejects_garbage() {
        assert!(BindSpec::parse("a=b=c").is_err());
        assert!(BindSpec::parse("=/mnt").is_err());
    }

    #[test]
    fn test_substitution_spec_parse() {
        let spec = SubstitutionSpec::parse("/etc/resolv.conf").unwrap();
        assert_eq!(spec.source, spec.dest);

        let spec = SubstitutionSpec::parse("/tmp/hosts=/etc/hosts").unwrap();
        assert_eq!(spec.source, PathBuf::from("/tmp/hosts"));
        assert_eq!(spec.dest, PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn test_lock_errors_map_to_busy() {
        let err: EchrootError = LockError::Timeout {
            root: PathBuf::from("/srv/jail"),
            waited: Duration::from_secs(3),
            owner_pid: Some(42),
        }
        .into();
        assert!(matches!(err, EchrootError::LockBusy { owner_pid: Some(42), .. }));
        assert_eq!(err.exit_code(), 75);
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::new("/srv/jail");
        assert_eq!(config.command, vec!["/bin/sh".to_string()]);
        assert_eq!(config.probe_candidates[0], PathBuf::from("/bin/sh"));
        assert_eq!(config.lock.retry_interval(), Duration::from_secs(1));
        assert!(config.lock.timeout().is_none());
    }
}
