/// Scratch directories and synthetic binaries for tests
use crate::probe::elf::{ElfClass, ELF_MAGIC};
use crate::probe::Architecture;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Uniquely named directory under the system temp dir, removed on drop
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir().join(format!("echroot-{}-{}", prefix, Uuid::new_v4()));
        fs::create_dir_all(&path).unwrap_or_else(|e| panic!("create {}: {}", path.display(), e));
        // temp_dir may sit behind a symlink; work with the real path
        let path = path.canonicalize().unwrap_or(path);
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `bytes` to `rel`, creating parent directories
    pub fn write_file(&self, rel: &str, bytes: &[u8]) -> PathBuf {
        let path = self.path.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .unwrap_or_else(|e| panic!("create {}: {}", parent.display(), e));
        }
        fs::write(&path, bytes).unwrap_or_else(|e| panic!("write {}: {}", path.display(), e));
        path
    }

    pub fn mkdir(&self, rel: &str) -> PathBuf {
        let path = self.path.join(rel);
        fs::create_dir_all(&path).unwrap_or_else(|e| panic!("create {}: {}", path.display(), e));
        path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Minimal little-endian ELF executable for `arch` with one program header:
/// `PT_INTERP` when `dynamic`, `PT_LOAD` otherwise
pub fn elf_image(arch: Architecture, dynamic: bool) -> Vec<u8> {
    let class = arch.class();
    let (ehsize, phentsize) = match class {
        ElfClass::Elf32 => (52usize, 32usize),
        ElfClass::Elf64 => (64, 56),
    };

    let mut image = vec![0u8; ehsize + phentsize];
    image[..4].copy_from_slice(&ELF_MAGIC);
    image[4] = match class {
        ElfClass::Elf32 => 1,
        ElfClass::Elf64 => 2,
    };
    image[5] = 1;
    image[6] = 1;
    image[16..18].copy_from_slice(&2u16.to_le_bytes());
    image[18..20].copy_from_slice(&arch.machine().to_le_bytes());
    image[20..24].copy_from_slice(&1u32.to_le_bytes());

    match class {
        ElfClass::Elf32 => {
            image[28..32].copy_from_slice(&(ehsize as u32).to_le_bytes());
            image[40..42].copy_from_slice(&(ehsize as u16).to_le_bytes());
            image[42..44].copy_from_slice(&(phentsize as u16).to_le_bytes());
            image[44..46].copy_from_slice(&1u16.to_le_bytes());
        }
        ElfClass::Elf64 => {
            image[32..40].copy_from_slice(&(ehsize as u64).to_le_bytes());
            image[52..54].copy_from_slice(&(ehsize as u16).to_le_bytes());
            image[54..56].copy_from_slice(&(phentsize as u16).to_le_bytes());
            image[56..58].copy_from_slice(&1u16.to_le_bytes());
        }
    }

    let p_type: u32 = if dynamic { 3 } else { 1 };
    image[ehsize..ehsize + 4].copy_from_slice(&p_type.to_le_bytes());
    image
}

/// Every entry under `root` with its type, mode and content, for
/// before/after comparisons
pub fn tree_snapshot(root: &Path) -> BTreeMap<PathBuf, String> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, String>) {
        let mut entries: Vec<_> = match fs::read_dir(dir) {
            Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
            Err(_) => return,
        };
        entries.sort();

        for path in entries {
            let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let mode = meta.permissions().mode() & 0o7777;
            if meta.file_type().is_symlink() {
                let target = fs::read_link(&path).unwrap_or_default();
                out.insert(rel, format!("link -> {}", target.display()));
            } else if meta.is_dir() {
                out.insert(rel, format!("dir {:o}", mode));
                walk(root, &path, out);
            } else {
                let content = fs::read(&path).unwrap_or_default();
                out.insert(
                    rel,
                    format!("file {:o} {}", mode, String::from_utf8_lossy(&content)),
                );
            }
        }
    }

    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}
