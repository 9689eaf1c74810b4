/// Spawning the session command inside the root
use crate::config::types::{EchrootError, Result};
use crate::kernel::signal::{should_continue, SignalHandler};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command};
use std::thread;
use std::time::Duration;

/// How the session command ended
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchOutcome {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// The wait was cut short by a shutdown request and the command killed
    pub interrupted: bool,
}

/// Runs a command with its filesystem root changed to `root`
pub trait Launcher: Send + Sync {
    fn launch(&self, root: &Path, command: &[String]) -> Result<LaunchOutcome>;
}

/// [`Launcher`] using chroot(2) in the forked child
#[derive(Debug, Clone)]
pub struct ChrootLauncher {
    poll_interval: Duration,
}

impl Default for ChrootLauncher {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl Launcher for ChrootLauncher {
    fn launch(&self, root: &Path, command: &[String]) -> Result<LaunchOutcome> {
        let exec_error = |reason: String| EchrootError::SessionExec {
            root: root.to_path_buf(),
            command: command.to_vec(),
            reason,
        };

        let (program, args) = command
            .split_first()
            .ok_or_else(|| exec_error("empty command".to_string()))?;

        // Allocate before fork; only async-signal-safe calls run in the child.
        let root_c = CString::new(root.as_os_str().as_bytes())
            .map_err(|e| exec_error(format!("invalid root path: {}", e)))?;
        let slash = CString::new("/").map_err(|e| exec_error(e.to_string()))?;

        let signals = SignalHandler::init()?;
        signals.reset();

        let mut cmd = Command::new(program);
        cmd.args(args);
        // SAFETY: chroot and chdir are async-signal-safe and only use
        // memory allocated before the fork.
        unsafe {
            cmd.pre_exec(move || {
                if libc::chroot(root_c.as_ptr()) != 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::chdir(slash.as_ptr()) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        info!("Launching {:?} in {}", command, root.display());
        let mut child = cmd.spawn().map_err(|e| exec_error(e.to_string()))?;

        let outcome = wait_for(&mut child, self.poll_interval, should_continue)
            .map_err(|e| exec_error(format!("wait failed: {}", e)))?;

        signals.report();
        info!(
            "Session command exited (code {:?}, signal {:?})",
            outcome.exit_code, outcome.signal
        );
        Ok(outcome)
    }
}

/// Wait for `child`, polling `keep_running` between checks. Once it returns
/// false the child is killed and the outcome marked interrupted.
fn wait_for(
    child: &mut Child,
    poll_interval: Duration,
    keep_running: impl Fn() -> bool,
) -> io::Result<LaunchOutcome> {
    let mut outcome = LaunchOutcome::default();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if !keep_running() {
            warn!("Shutdown requested, killing session command {}", child.id());
            outcome.interrupted = true;
            let _ = child.kill();
            break child.wait()?;
        }
        thread::sleep(poll_interval);
    };
    outcome.exit_code = status.code();
    outcome.signal = status.signal();
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_command_rejected() {
        let err = ChrootLauncher::default()
            .launch(Path::new("/"), &[])
            .unwrap_err();
        assert!(matches!(err, EchrootError::SessionExec { .. }));
    }

    #[test]
    fn test_wait_reports_exit_code() {
        let mut child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let outcome = wait_for(&mut child, Duration::from_millis(10), || true).unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.signal, None);
        assert!(!outcome.interrupted);
    }

    #[test]
    fn test_shutdown_kills_running_command() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let outcome = wait_for(&mut child, Duration::from_millis(10), || false).unwrap();
        assert!(outcome.interrupted);
        assert_eq!(outcome.exit_code, None);
        assert_eq!(outcome.signal, Some(libc::SIGKILL));
    }

    #[test]
    fn test_outcome_serializes() {
        let outcome = LaunchOutcome {
            exit_code: Some(0),
            signal: None,
            interrupted: false,
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"exit_code\":0"));
    }
}
