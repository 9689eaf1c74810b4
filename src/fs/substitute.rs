/// File substitution with on-disk backup.
///
/// The substituted state is the existence of the backup file
/// (`.<name>.bak` next to the destination), so it can be inspected and
/// restored after the process that made it is gone. When the destination
/// did not exist, a `.<name>.bak.new` marker records that restoring means
/// removing it again.
use crate::config::types::{EchrootError, Result};
use crate::fs::paths::{make_dirs, remove_dirs};
use log::{debug, info, warn};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::{symlink, OpenOptionsExt};
use std::path::{Path, PathBuf};

/// Backup location for `dest`: hidden file in the same directory
pub fn backup_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.bak", name))
}

/// Marker present while the backup stands in for a destination that did not exist
pub fn placeholder_marker(dest: &Path) -> PathBuf {
    let mut name = backup_path(dest).into_os_string();
    name.push(".new");
    PathBuf::from(name)
}

fn exists_no_follow(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Copy `source` to `dest`, recreating a symlink instead of copying through it
fn copy_preserving_link(source: &Path, dest: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(source)?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(source)?;
        symlink(target, dest)
    } else {
        fs::copy(source, dest).map(|_| ())
    }
}

/// One file swapped into the root for the length of a session
#[derive(Debug)]
pub struct FileSubstitution {
    source: PathBuf,
    dest: PathBuf,
    backup: PathBuf,
    marker: PathBuf,
    /// Destination did not exist; an empty placeholder stands in as its backup
    placeholder: bool,
    created_dirs: Vec<PathBuf>,
}

impl FileSubstitution {
    /// Prepare a substitution of `dest` (host path) by `source`.
    ///
    /// Fails if `source` is not a regular file, if `dest` exists but is not
    /// a regular file, or if a backup from an earlier session is still
    /// present.
    pub fn new(source: &Path, dest: &Path) -> Result<Self> {
        let sub = Self::adopt(source, dest)?;
        if exists_no_follow(&sub.backup) {
            return Err(sub.error(format!(
                "backup {} already exists (unclean previous session?)",
                sub.backup.display()
            )));
        }
        Ok(sub)
    }

    /// Like [`FileSubstitution::new`] but accepts an existing backup, for
    /// restoring what a crashed session left behind. Directories the crashed
    /// session created are not known and stay in place.
    pub fn adopt(source: &Path, dest: &Path) -> Result<Self> {
        let backup = backup_path(dest);
        let marker = placeholder_marker(dest);
        let placeholder = exists_no_follow(&backup) && exists_no_follow(&marker);
        let sub = FileSubstitution {
            source: source.to_path_buf(),
            dest: dest.to_path_buf(),
            backup,
            marker,
            placeholder,
            created_dirs: Vec::new(),
        };

        match fs::metadata(source) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(sub.error("source is not a regular file".to_string())),
            Err(e) => return Err(sub.error(format!("source unavailable: {}", e))),
        }

        if exists_no_follow(dest) && !fs::metadata(dest).map(|m| m.is_file()).unwrap_or(false) {
            return Err(sub.error("destination exists and is not a regular file".to_string()));
        }

        Ok(sub)
    }

    fn error(&self, reason: String) -> EchrootError {
        EchrootError::Substitution {
            replacement: self.source.clone(),
            dest: self.dest.clone(),
            reason,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn backup(&self) -> &Path {
        &self.backup
    }

    /// True while the backup file exists
    pub fn is_substituted(&self) -> bool {
        exists_no_follow(&self.backup)
    }

    /// Move the destination aside and put a copy of the source in its place.
    ///
    /// A no-op if already substituted. On failure the destination is left
    /// as it was found.
    pub fn substitute(&mut self) -> Result<()> {
        if self.is_substituted() {
            debug!("{} already substituted", self.dest.display());
            return Ok(());
        }

        if exists_no_follow(&self.dest) {
            // Stale marker from an interrupted restore
            self.remove_marker()
                .map_err(|e| self.error(format!("cannot clear stale marker: {}", e)))?;
        } else {
            let parent = self.dest.parent().unwrap_or_else(|| Path::new("/"));
            self.created_dirs = make_dirs(parent)
                .map_err(|e| self.error(format!("cannot create parent directory: {}", e)))?;
            self.placeholder = true;
            if let Err(e) = fs::write(&self.marker, b"") {
                self.discard_placeholder();
                return Err(self.error(format!("cannot record missing destination: {}", e)));
            }
            if let Err(e) = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o644)
                .open(&self.dest)
            {
                self.discard_placeholder();
                return Err(self.error(format!("cannot create placeholder: {}", e)));
            }
        }

        if let Err(e) = fs::rename(&self.dest, &self.backup) {
            self.discard_placeholder();
            return Err(self.error(format!("cannot move destination aside: {}", e)));
        }

        if let Err(e) = copy_preserving_link(&self.source, &self.dest) {
            let _ = fs::remove_file(&self.dest);
            if let Err(re) = fs::rename(&self.backup, &self.dest) {
                warn!(
                    "Could not put {} back after failed copy: {}",
                    self.dest.display(),
                    re
                );
            }
            self.discard_placeholder();
            return Err(self.error(format!("cannot copy source: {}", e)));
        }

        info!("Substituted {} with {}", self.dest.display(), self.source.display());
        Ok(())
    }

    /// Put the original destination back. A no-op if not substituted.
    pub fn restore(&mut self) -> Result<()> {
        if !self.is_substituted() {
            debug!("{} not substituted, nothing to restore", self.dest.display());
            return Ok(());
        }

        match fs::remove_file(&self.dest) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(self.error(format!("cannot remove substitute: {}", e))),
        }

        if self.placeholder {
            // Dropping the backup ends the substituted state; the marker goes last.
            fs::remove_file(&self.backup)
                .map_err(|e| self.error(format!("cannot remove placeholder backup: {}", e)))?;
            self.discard_placeholder();
        } else {
            fs::rename(&self.backup, &self.dest)
                .map_err(|e| self.error(format!("cannot restore backup: {}", e)))?;
        }

        info!("Restored {}", self.dest.display());
        Ok(())
    }

    fn discard_placeholder(&mut self) {
        if !self.placeholder {
            return;
        }
        if let Err(e) = fs::remove_file(&self.dest) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Could not remove placeholder {}: {}", self.dest.display(), e);
            }
        }
        if let Err(e) = self.remove_marker() {
            warn!("Could not remove {}: {}", self.marker.display(), e);
        }
        remove_dirs(&self.created_dirs);
        self.created_dirs.clear();
        self.placeholder = false;
    }
}

impl FileSubstitution {
    fn remove_marker(&self) -> io::Result<()> {
        match fs::remove_file(&self.marker) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

impl fmt::Display for FileSubstitution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = if self.is_substituted() { "====" } else { "!=!=" };
        write!(f, "{} {} {}", self.source.display(), label, self.dest.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::ScratchDir;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_backup_name() {
        assert_eq!(
            backup_path(Path::new("/srv/jail/etc/resolv.conf")),
            PathBuf::from("/srv/jail/etc/.resolv.conf.bak")
        );
    }

    #[test]
    fn test_substitute_and_restore_existing() {
        let scratch = ScratchDir::new("subst-existing");
        let source = scratch.write_file("host/hosts", b"127.0.0.1 host\n");
        let dest = scratch.write_file("root/etc/hosts", b"original\n");
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o600)).unwrap();

        let mut sub = FileSubstitution::new(&source, &dest).unwrap();
        assert!(!sub.is_substituted());

        sub.substitute().unwrap();
        assert!(sub.is_substituted());
        assert_eq!(fs::read(&dest).unwrap(), b"127.0.0.1 host\n");
        assert_eq!(fs::read(sub.backup()).unwrap(), b"original\n");

        // idempotent
        sub.substitute().unwrap();
        assert_eq!(fs::read(sub.backup()).unwrap(), b"original\n");

        sub.restore().unwrap();
        assert!(!sub.is_substituted());
        assert_eq!(fs::read(&dest).unwrap(), b"original\n");
        let mode = fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        sub.restore().unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"original\n");
    }

    #[test]
    fn test_missing_destination_is_removed_on_restore() {
        let scratch = ScratchDir::new("subst-missing");
        let source = scratch.write_file("host/resolv.conf", b"nameserver 1.1.1.1\n");
        scratch.mkdir("root");
        let dest = scratch.path().join("root/etc/resolv.conf");

        let mut sub = FileSubstitution::new(&source, &dest).unwrap();
        sub.substitute().unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"nameserver 1.1.1.1\n");

        sub.restore().unwrap();
        assert!(!dest.exists());
        assert!(!sub.backup().exists());
        assert!(!placeholder_marker(&dest).exists());
        assert!(!scratch.path().join("root/etc").exists());
    }

    #[test]
    fn test_missing_destination_survives_restart() {
        let scratch = ScratchDir::new("subst-missing-restart");
        let source = scratch.write_file("host/resolv.conf", b"nameserver 1.1.1.1\n");
        scratch.mkdir("root/etc");
        let dest = scratch.path().join("root/etc/resolv.conf");

        let mut first = FileSubstitution::new(&source, &dest).unwrap();
        first.substitute().unwrap();
        assert!(placeholder_marker(&dest).exists());
        drop(first);

        let mut second = FileSubstitution::adopt(&source, &dest).unwrap();
        assert!(second.is_substituted());
        second.restore().unwrap();
        assert!(fs::symlink_metadata(&dest).is_err());
        assert!(!second.backup().exists());
        assert!(!placeholder_marker(&dest).exists());
    }

    #[test]
    fn test_stale_marker_does_not_describe_real_backup() {
        let scratch = ScratchDir::new("subst-stale-marker");
        let source = scratch.write_file("host/f", b"new");
        let dest = scratch.write_file("root/f", b"old");
        fs::write(placeholder_marker(&dest), b"").unwrap();

        let mut sub = FileSubstitution::new(&source, &dest).unwrap();
        sub.substitute().unwrap();
        assert!(!placeholder_marker(&dest).exists());
        drop(sub);

        let mut adopted = FileSubstitution::adopt(&source, &dest).unwrap();
        adopted.restore().unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"old");
    }

    #[test]
    fn test_symlink_source_is_recreated() {
        let scratch = ScratchDir::new("subst-link");
        scratch.write_file("host/real", b"data");
        let source = scratch.path().join("host/link");
        symlink("real", &source).unwrap();
        let dest = scratch.write_file("root/file", b"before");

        let mut sub = FileSubstitution::new(&source, &dest).unwrap();
        sub.substitute().unwrap();
        assert_eq!(fs::read_link(&dest).unwrap(), PathBuf::from("real"));

        sub.restore().unwrap();
        assert!(!fs::symlink_metadata(&dest).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&dest).unwrap(), b"before");
    }

    #[test]
    fn test_rejects_orphaned_backup() {
        let scratch = ScratchDir::new("subst-orphan");
        let source = scratch.write_file("host/f", b"new");
        let dest = scratch.write_file("root/f", b"old");
        scratch.write_file("root/.f.bak", b"someone else's");

        let err = FileSubstitution::new(&source, &dest).unwrap_err();
        assert!(matches!(err, EchrootError::Substitution { .. }));

        let adopted = FileSubstitution::adopt(&source, &dest).unwrap();
        assert!(adopted.is_substituted());
    }

    #[test]
    fn test_rejects_non_file_source_and_dest() {
        let scratch = ScratchDir::new("subst-kinds");
        let dir = scratch.mkdir("somedir");
        let file = scratch.write_file("file", b"x");

        assert!(FileSubstitution::new(&dir, &scratch.path().join("dest")).is_err());
        assert!(FileSubstitution::new(&file, &dir).is_err());
        assert!(FileSubstitution::new(&scratch.path().join("absent"), &file).is_err());
    }

    #[test]
    fn test_restore_after_restart() {
        let scratch = ScratchDir::new("subst-restart");
        let source = scratch.write_file("host/f", b"new");
        let dest = scratch.write_file("root/f", b"old");

        let mut first = FileSubstitution::new(&source, &dest).unwrap();
        first.substitute().unwrap();
        drop(first);

        let mut second = FileSubstitution::adopt(&source, &dest).unwrap();
        assert!(second.is_substituted());
        second.restore().unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"old");
    }
}
