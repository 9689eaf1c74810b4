//! Bind mounts and the host mount table
//!
//! [`MountOps`] is the narrow seam to the host mount facility. The live mount
//! table is always queried, never cached, since other processes bind and
//! unbind the same paths.

pub mod bind;
pub mod table;

pub use bind::BindMount;

use crate::config::types::{EchrootError, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::io;
use std::path::Path;

/// Flags of one bind mount, parsed from mount(8)-style option words
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub read_only: bool,
    pub recursive: bool,
    pub nosuid: bool,
    pub nodev: bool,
    pub noexec: bool,
}

impl MountOptions {
    pub fn parse<S: AsRef<str>>(words: &[S]) -> Result<Self> {
        let mut options = MountOptions::default();
        for word in words {
            match word.as_ref() {
                "bind" | "defaults" => {}
                "rbind" | "rec" => options.recursive = true,
                "ro" => options.read_only = true,
                "rw" => options.read_only = false,
                "nosuid" => options.nosuid = true,
                "nodev" => options.nodev = true,
                "noexec" => options.noexec = true,
                other => {
                    return Err(EchrootError::Config(format!(
                        "Unsupported bind option '{}'",
                        other
                    )))
                }
            }
        }
        Ok(options)
    }

    /// Flags that need a second `MS_REMOUNT` pass to take effect on a bind
    fn restrict_flags(&self) -> MsFlags {
        let mut flags = MsFlags::empty();
        if self.read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        if self.nosuid {
            flags |= MsFlags::MS_NOSUID;
        }
        if self.nodev {
            flags |= MsFlags::MS_NODEV;
        }
        if self.noexec {
            flags |= MsFlags::MS_NOEXEC;
        }
        flags
    }
}

/// Host mount facility
pub trait MountOps: Send + Sync {
    /// Bind `source` onto the existing directory `target`
    fn bind(&self, source: &Path, target: &Path, options: &MountOptions) -> io::Result<()>;

    /// Mount a pseudo filesystem (`binfmt_misc`, ...) at `target`
    fn mount_filesystem(&self, fstype: &str, target: &Path) -> io::Result<()>;

    /// Unmount `target`; `detach` requests a lazy unmount of the whole subtree
    fn unmount(&self, target: &Path, detach: bool) -> io::Result<()>;

    /// Whether `target` is currently a mountpoint
    fn is_mounted(&self, target: &Path) -> io::Result<bool>;
}

/// [`MountOps`] backed by mount(2) and `/proc/self/mountinfo`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounts;

impl MountOps for SystemMounts {
    fn bind(&self, source: &Path, target: &Path, options: &MountOptions) -> io::Result<()> {
        let mut flags = MsFlags::MS_BIND;
        if options.recursive {
            flags |= MsFlags::MS_REC;
        }
        mount(Some(source), target, None::<&str>, flags, None::<&str>)?;

        // Bind mounts ignore restricting flags on the first call.
        let restrict = options.restrict_flags();
        if !restrict.is_empty() {
            let remount = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | restrict;
            if let Err(e) = mount(None::<&str>, target, None::<&str>, remount, None::<&str>) {
                let _ = umount2(target, MntFlags::MNT_DETACH);
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn mount_filesystem(&self, fstype: &str, target: &Path) -> io::Result<()> {
        mount(
            Some(fstype),
            target,
            Some(fstype),
            MsFlags::empty(),
            None::<&str>,
        )?;
        Ok(())
    }

    fn unmount(&self, target: &Path, detach: bool) -> io::Result<()> {
        let flags = if detach {
            MntFlags::MNT_DETACH
        } else {
            MntFlags::empty()
        };
        umount2(target, flags)?;
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> io::Result<bool> {
        table::is_mountpoint(target)
    }
}
