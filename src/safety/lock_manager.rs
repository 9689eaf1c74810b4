/// Per-root session lock implemented as an exclusive PID marker file
///
/// The marker lives in a lock directory and is named after the SHA-256 of
/// the absolute root path, so different roots never contend and the root
/// tree itself is not touched. It is created with `O_EXCL` and holds the
/// owner's PID on a single line.
///
/// Every inspection or replacement of the marker happens under an exclusive
/// `flock(2)` on a sibling `.guard` file, so a stale takeover cannot delete a
/// marker another owner has just written. The guard file is never removed;
/// unlinking a flock target would let two holders lock different inodes.
use crate::config::types::{LockError, LockResult, LockSettings};
use crate::fs::paths::{absolute, path_digest};
use log::{debug, info, warn};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Lock directories tried in order when none is configured
const LOCK_DIRS: [&str; 2] = ["/run/echroot/locks", "/tmp/echroot/locks"];

fn is_process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

fn prepare_lock_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let probe = dir.join(format!(".access_test_{}", std::process::id()));
    fs::write(&probe, b"test")?;
    let _ = fs::remove_file(&probe);
    Ok(())
}

/// Pick the configured lock directory, or the first usable well-known one
fn get_lock_directory(configured: Option<&Path>) -> LockResult<PathBuf> {
    if let Some(dir) = configured {
        prepare_lock_dir(dir).map_err(|e| LockError::PermissionDenied {
            details: format!("Lock directory {} not usable: {}", dir.display(), e),
        })?;
        return Ok(dir.to_path_buf());
    }

    for candidate in LOCK_DIRS {
        let dir = PathBuf::from(candidate);
        match prepare_lock_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) => debug!("Lock directory {} not usable: {}", dir.display(), e),
        }
    }

    Err(LockError::PermissionDenied {
        details: "Cannot find or create a writable lock directory".to_string(),
    })
}

/// Marker state as read from disk
enum MarkerState {
    Absent,
    /// The creator died between creating the marker and recording its PID
    Empty,
    Owner(u32),
}

/// Mutual exclusion over one root directory
#[derive(Debug, Clone)]
pub struct SessionLock {
    root: PathBuf,
    marker: PathBuf,
    guard: PathBuf,
    owner: u32,
    timeout: Option<Duration>,
    retry: Duration,
}

impl SessionLock {
    /// Lock for `root`, owned by the current process
    pub fn new(root: &Path, settings: &LockSettings) -> LockResult<Self> {
        let root = absolute(root)?;
        let dir = get_lock_directory(settings.lock_dir.as_deref())?;
        let digest = path_digest(&root);
        let marker = dir.join(format!("{}.lock", digest));
        let guard = dir.join(format!("{}.guard", digest));

        Ok(Self {
            root,
            marker,
            guard,
            owner: std::process::id(),
            timeout: settings.timeout(),
            retry: settings.retry_interval(),
        })
    }

    /// Same lock under a different owner identity
    pub fn with_owner(mut self, owner: u32) -> Self {
        self.owner = owner;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    pub fn owner(&self) -> u32 {
        self.owner
    }

    fn read_marker(&self) -> LockResult<MarkerState> {
        let content = match fs::read_to_string(&self.marker) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(MarkerState::Absent),
            Err(e) => return Err(e.into()),
        };

        let line = content.lines().next().unwrap_or("").trim();
        if line.is_empty() {
            return Ok(MarkerState::Empty);
        }
        line.parse::<u32>()
            .map(MarkerState::Owner)
            .map_err(|_| LockError::CorruptedLock {
                path: self.marker.clone(),
                details: format!("Invalid owner record {:?}", line),
            })
    }

    /// PID recorded in the marker, if any
    pub fn current_owner(&self) -> Option<u32> {
        match self.read_marker() {
            Ok(MarkerState::Owner(pid)) => Some(pid),
            _ => None,
        }
    }

    /// Whether a live process holds the lock
    pub fn is_held(&self) -> bool {
        self.current_owner().map(is_process_alive).unwrap_or(false)
    }

    /// Serialize marker access with other owners of this root
    fn serialize(&self) -> LockResult<Flock<File>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.guard)
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => LockError::PermissionDenied {
                    details: format!("Cannot open {}: {}", self.guard.display(), e),
                },
                _ => e.into(),
            })?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| LockError::FilesystemError(io::Error::from(errno)))
    }

    fn create_marker(&self) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.marker)?;
        let written = writeln!(file, "{}", self.owner).and_then(|_| file.sync_all());
        if written.is_err() {
            let _ = fs::remove_file(&self.marker);
        }
        written
    }

    fn remove_marker(&self) -> LockResult<()> {
        match fs::remove_file(&self.marker) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn guard(&self, release_on_drop: bool) -> SessionLockGuard {
        SessionLockGuard {
            lock: self.clone(),
            release_on_drop,
        }
    }

    /// One acquisition attempt; `Busy` if a live owner holds the lock
    pub fn try_acquire(&self) -> LockResult<SessionLockGuard> {
        let _serial = self.serialize()?;

        match self.read_marker()? {
            MarkerState::Absent => {}
            MarkerState::Owner(pid) if pid == self.owner => {
                debug!("Lock for {} already held by this owner", self.root.display());
                return Ok(self.guard(false));
            }
            MarkerState::Owner(pid) if is_process_alive(pid) => {
                return Err(LockError::Busy {
                    root: self.root.clone(),
                    owner_pid: Some(pid),
                });
            }
            MarkerState::Owner(pid) => {
                warn!(
                    "Removing stale lock for {} (pid {} is gone)",
                    self.root.display(),
                    pid
                );
                self.remove_marker()?;
            }
            // Markers are written under the guard, so an empty one was
            // abandoned mid-write.
            MarkerState::Empty => {
                warn!(
                    "Removing lock for {} abandoned before its owner was recorded",
                    self.root.display()
                );
                self.remove_marker()?;
            }
        }

        match self.create_marker() {
            Ok(()) => {
                info!("Acquired lock for {}", self.root.display());
                Ok(self.guard(true))
            }
            // Created by something that bypasses the guard
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(LockError::Busy {
                root: self.root.clone(),
                owner_pid: self.current_owner(),
            }),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                Err(LockError::PermissionDenied {
                    details: format!("Cannot create {}: {}", self.marker.display(), e),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Block until the lock is acquired or the timeout elapses
    pub fn acquire(&self) -> LockResult<SessionLockGuard> {
        let start = Instant::now();
        loop {
            match self.try_acquire() {
                Err(LockError::Busy { owner_pid, .. }) => {
                    if let Some(timeout) = self.timeout {
                        if start.elapsed() >= timeout {
                            return Err(LockError::Timeout {
                                root: self.root.clone(),
                                waited: start.elapsed(),
                                owner_pid,
                            });
                        }
                    }
                    debug!(
                        "{} is busy (owner {:?}), retrying in {:?}",
                        self.root.display(),
                        owner_pid,
                        self.retry
                    );
                    thread::sleep(self.retry);
                }
                other => return other,
            }
        }
    }

    /// Remove the marker if this owner holds it. Releasing a lock held by
    /// someone else, or not held at all, does nothing.
    pub fn release(&self) {
        let _serial = match self.serialize() {
            Ok(serial) => serial,
            Err(e) => {
                warn!("Cannot release lock for {}: {}", self.root.display(), e);
                return;
            }
        };
        match self.read_marker() {
            Ok(MarkerState::Owner(pid)) if pid == self.owner => {
                match fs::remove_file(&self.marker) {
                    Ok(()) => info!("Released lock for {}", self.root.display()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to remove {}: {}", self.marker.display(), e),
                }
            }
            Ok(_) => debug!("Lock for {} not held by {}", self.root.display(), self.owner),
            Err(e) => warn!("Cannot read {}: {}", self.marker.display(), e),
        }
    }
}

/// RAII guard: releases the lock on every exit path
#[derive(Debug)]
pub struct SessionLockGuard {
    lock: SessionLock,
    /// False for a re-entrant acquisition; the outer guard releases
    release_on_drop: bool,
}

impl SessionLockGuard {
    pub fn lock(&self) -> &SessionLock {
        &self.lock
    }

    pub fn is_reentrant(&self) -> bool {
        !self.release_on_drop
    }
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        if self.release_on_drop {
            self.lock.release();
        }
    }
}
