/// Path helpers for operating on a tree that will become a chroot.
///
/// Paths handed to the session are written as the jailed process sees them
/// (`/etc/hosts`), so they are resolved against the root the way the kernel
/// would resolve them after `chroot(2)`: absolute symlink targets restart at
/// the root and `..` stops at the root.
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

const MAX_SYMLINK_HOPS: usize = 40;

fn split(path: &Path) -> Vec<OsString> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            _ => None,
        })
        .collect()
}

fn resolve(root: &Path, path: &Path, follow_last: bool) -> io::Result<PathBuf> {
    let root = root.canonicalize()?;
    let mut resolved = root.clone();
    let mut pending = split(path);
    pending.reverse();
    let mut hops = 0;

    while let Some(part) = pending.pop() {
        if part == ".." {
            if resolved != root {
                resolved.pop();
            }
            continue;
        }

        let next = resolved.join(&part);
        let is_last = pending.is_empty();
        match fs::symlink_metadata(&next) {
            Ok(meta) if meta.file_type().is_symlink() && (follow_last || !is_last) => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("too many levels of symbolic links at {}", next.display()),
                    ));
                }
                let target = fs::read_link(&next)?;
                if target.is_absolute() {
                    resolved = root.clone();
                }
                let mut expanded = split(&target);
                expanded.reverse();
                pending.extend(expanded);
            }
            // Missing components are joined as-is.
            _ => resolved = next,
        }
    }

    Ok(resolved)
}

/// Map `path` (as seen inside `root`) to a host path, following symlinks
/// within the root.
pub fn resolve_in_root(root: &Path, path: &Path) -> io::Result<PathBuf> {
    resolve(root, path, true)
}

/// Like [`resolve_in_root`] but leaves a symlink in the final component
/// untouched, so the link itself can be renamed or replaced.
pub fn resolve_parent_in_root(root: &Path, path: &Path) -> io::Result<PathBuf> {
    resolve(root, path, false)
}

/// Absolute form of `path` without requiring it to exist
pub fn absolute(path: &Path) -> io::Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::from("/");
    for part in split(&joined) {
        if part == ".." {
            normalized.pop();
        } else {
            normalized.push(part);
        }
    }
    Ok(normalized)
}

/// Short stable digest of a path, used to name per-root host resources
pub fn path_digest(path: &Path) -> String {
    use std::os::unix::ffi::OsStrExt;

    let digest = Sha256::digest(path.as_os_str().as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Create `dir` and any missing parents.
///
/// Returns the directories that did not exist before, outermost first.
pub fn make_dirs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut missing: Vec<PathBuf> = dir
        .ancestors()
        .take_while(|p| fs::symlink_metadata(p).is_err())
        .map(Path::to_path_buf)
        .collect();
    missing.reverse();

    let mut created = Vec::with_capacity(missing.len());
    for path in missing {
        match fs::create_dir(&path) {
            Ok(()) => created.push(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                remove_dirs(&created);
                return Err(e);
            }
        }
    }
    Ok(created)
}

/// Remove directories previously returned by [`make_dirs`], innermost first.
///
/// Stops at the first directory that cannot be removed (typically because
/// it is no longer empty). Returns true if all of them are gone.
pub fn remove_dirs(created: &[PathBuf]) -> bool {
    for dir in created.iter().rev() {
        match fs::remove_dir(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                log::debug!("Leaving {} in place: {}", dir.display(), e);
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::ScratchDir;
    use std::os::unix::fs::symlink;

    #[test]
    fn test_plain_join() {
        let scratch = ScratchDir::new("paths-join");
        let resolved = resolve_in_root(scratch.path(), Path::new("/etc/hosts")).unwrap();
        assert_eq!(resolved, scratch.path().join("etc/hosts"));
    }

    #[test]
    fn test_dotdot_stops_at_root() {
        let scratch = ScratchDir::new("paths-dotdot");
        let resolved = resolve_in_root(scratch.path(), Path::new("/../../etc/./passwd")).unwrap();
        assert_eq!(resolved, scratch.path().join("etc/passwd"));
    }

    #[test]
    fn test_absolute_link_stays_inside() {
        let scratch = ScratchDir::new("paths-abs-link");
        scratch.mkdir("usr/lib");
        symlink("/usr/lib", scratch.path().join("lib")).unwrap();

        let resolved = resolve_in_root(scratch.path(), Path::new("/lib/libc.so")).unwrap();
        assert_eq!(resolved, scratch.path().join("usr/lib/libc.so"));
    }

    #[test]
    fn test_relative_link_escape_is_clamped() {
        let scratch = ScratchDir::new("paths-rel-link");
        symlink("../../../../etc", scratch.path().join("evil")).unwrap();

        let resolved = resolve_in_root(scratch.path(), Path::new("/evil/shadow")).unwrap();
        assert_eq!(resolved, scratch.path().join("etc/shadow"));
    }

    #[test]
    fn test_last_component_link_kept() {
        let scratch = ScratchDir::new("paths-last-link");
        scratch.mkdir("run");
        scratch.mkdir("etc");
        symlink("/run/resolv.conf", scratch.path().join("etc/resolv.conf")).unwrap();

        let kept = resolve_parent_in_root(scratch.path(), Path::new("/etc/resolv.conf")).unwrap();
        assert_eq!(kept, scratch.path().join("etc/resolv.conf"));
        let followed = resolve_in_root(scratch.path(), Path::new("/etc/resolv.conf")).unwrap();
        assert_eq!(followed, scratch.path().join("run/resolv.conf"));
    }

    #[test]
    fn test_symlink_loop() {
        let scratch = ScratchDir::new("paths-loop");
        symlink("/b", scratch.path().join("a")).unwrap();
        symlink("/a", scratch.path().join("b")).unwrap();
        assert!(resolve_in_root(scratch.path(), Path::new("/a")).is_err());
    }

    #[test]
    fn test_make_and_remove_dirs() {
        let scratch = ScratchDir::new("paths-mkdirs");
        scratch.mkdir("existing");

        let created = make_dirs(&scratch.path().join("existing/a/b/c")).unwrap();
        assert_eq!(created.len(), 3);
        assert!(created[0].ends_with("existing/a"));
        assert!(scratch.path().join("existing/a/b/c").is_dir());

        assert!(remove_dirs(&created));
        assert!(!scratch.path().join("existing/a").exists());
        assert!(scratch.path().join("existing").is_dir());
    }

    #[test]
    fn test_remove_dirs_keeps_non_empty() {
        let scratch = ScratchDir::new("paths-nonempty");
        let created = make_dirs(&scratch.path().join("a/b")).unwrap();
        scratch.write_file("a/keep", b"x");

        assert!(!remove_dirs(&created));
        assert!(!scratch.path().join("a/b").exists());
        assert!(scratch.path().join("a/keep").exists());
    }

    #[test]
    fn test_make_dirs_existing_is_empty_list() {
        let scratch = ScratchDir::new("paths-existing");
        assert!(make_dirs(scratch.path()).unwrap().is_empty());
    }

    #[test]
    fn test_absolute_normalizes() {
        let abs = absolute(Path::new("/nonexistent-echroot/a/../b")).unwrap();
        assert_eq!(abs, PathBuf::from("/nonexistent-echroot/b"));
    }

    #[test]
    fn test_digest_is_stable() {
        let a = path_digest(Path::new("/srv/jail"));
        assert_eq!(a.len(), 64);
        assert_eq!(a, path_digest(Path::new("/srv/jail")));
        assert_ne!(a, path_digest(Path::new("/srv/jail2")));
    }
}
