/// Kernel binary-format dispatcher (binfmt_misc)
///
/// Entries are written as `:name:M::magic:mask:interpreter:` to the
/// `register` file and removed by writing `-1` to the entry's own file.
/// The kernel refuses a name that is already registered, so an existing
/// entry is always removed before a new one is written.
use crate::kernel::mount::MountOps;
use crate::probe::Architecture;
use log::{debug, info};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// First 20 bytes of a little-endian executable ELF for `arch`
fn elf_magic(arch: Architecture) -> Vec<u8> {
    let class = match arch.class() {
        crate::probe::elf::ElfClass::Elf32 => 1,
        crate::probe::elf::ElfClass::Elf64 => 2,
    };
    let mut magic = vec![0x7f, b'E', b'L', b'F', class, 0x01, 0x01];
    magic.extend_from_slice(&[0u8; 9]);
    magic.extend_from_slice(&[0x02, 0x00]);
    magic.extend_from_slice(&arch.machine().to_le_bytes());
    magic
}

/// Mask paired with [`elf_magic`]: ignores OS ABI, padding, and ET_EXEC vs ET_DYN
fn elf_mask(arch: Architecture) -> Vec<u8> {
    let ident: &[u8] = match arch {
        Architecture::I386 | Architecture::X86_64 => {
            &[0xff, 0xff, 0xff, 0xff, 0xff, 0xfe, 0xfe, 0x00]
        }
        Architecture::Arm | Architecture::Aarch64 => {
            &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00]
        }
    };
    let mut mask = ident.to_vec();
    mask.extend_from_slice(&[0xff; 8]);
    mask.extend_from_slice(&[0xfe, 0xff, 0xff, 0xff]);
    mask
}

fn escape(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\x{:02x}", b)).collect()
}

/// One registration record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinfmtEntry {
    pub name: String,
    pub magic: Vec<u8>,
    pub mask: Vec<u8>,
    /// Interpreter path as seen by the process being executed
    pub interpreter: PathBuf,
}

impl BinfmtEntry {
    /// Entry routing `arch` executables to a qemu user-mode interpreter
    pub fn qemu(name: impl Into<String>, arch: Architecture, interpreter: &Path) -> Self {
        Self {
            name: name.into(),
            magic: elf_magic(arch),
            mask: elf_mask(arch),
            interpreter: interpreter.to_path_buf(),
        }
    }

    /// Line written to the `register` file
    pub fn record(&self) -> String {
        format!(
            ":{}:M::{}:{}:{}:",
            self.name,
            escape(&self.magic),
            escape(&self.mask),
            self.interpreter.display()
        )
    }

    fn validate(&self) -> io::Result<()> {
        let bad_name = self.name.is_empty()
            || self.name.contains(|c: char| c == '/' || c == ':')
            || self.name == "."
            || self.name == ".."
            || self.name == "register"
            || self.name == "status";
        let bad_interp = self.interpreter.to_string_lossy().contains(':');
        if bad_name || bad_interp || self.magic.len() != self.mask.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("malformed binfmt entry {:?}", self.name),
            ));
        }
        Ok(())
    }
}

/// The binfmt_misc directory
#[derive(Debug, Clone)]
pub struct BinfmtRegistry {
    dir: PathBuf,
}

impl BinfmtRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn register_file(&self) -> PathBuf {
        self.dir.join("register")
    }

    pub fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Mount binfmt_misc on the directory unless it already is
    pub fn ensure_mounted(&self, mounts: &dyn MountOps) -> io::Result<()> {
        if self.register_file().exists() {
            return Ok(());
        }
        debug!("Mounting binfmt_misc on {}", self.dir.display());
        mounts.mount_filesystem("binfmt_misc", &self.dir)?;
        if !self.register_file().exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} has no register file", self.dir.display()),
            ));
        }
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.entry_path(name).exists()
    }

    /// Register `entry`, replacing a stale entry of the same name
    pub fn register(&self, entry: &BinfmtEntry) -> io::Result<()> {
        entry.validate()?;
        if self.is_registered(&entry.name) {
            debug!("Replacing stale binfmt entry {}", entry.name);
            self.unregister(&entry.name)?;
        }

        // The kernel file must not be truncated, only written.
        let mut register = OpenOptions::new().write(true).open(self.register_file())?;
        register.write_all(entry.record().as_bytes())?;
        info!(
            "Registered binfmt entry {} -> {}",
            entry.name,
            entry.interpreter.display()
        );
        Ok(())
    }

    /// Remove entry `name`. Absence is success.
    pub fn unregister(&self, name: &str) -> io::Result<()> {
        let path = self.entry_path(name);
        let mut file = match OpenOptions::new().write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        file.write_all(b"-1")?;
        info!("Unregistered binfmt entry {}", name);
        Ok(())
    }

    /// Read back the interpreter of a registered entry
    pub fn interpreter_of(&self, name: &str) -> Option<PathBuf> {
        let content = fs::read_to_string(self.entry_path(name)).ok()?;
        content
            .lines()
            .find_map(|line| line.strip_prefix("interpreter "))
            .map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fakes::FakeMounts;
    use crate::testing::fixtures::ScratchDir;

    #[test]
    fn test_arm_record() {
        let entry = BinfmtEntry::qemu(
            "echroot-arm",
            Architecture::Arm,
            Path::new("/usr/bin/qemu-arm-static"),
        );
        let record = entry.record();
        assert!(record.starts_with(":echroot-arm:M::\\x7f\\x45\\x4c\\x46\\x01\\x01\\x01\\x00"));
        assert!(record.contains("\\x02\\x00\\x28\\x00:"));
        assert!(record.contains(":\\xff\\xff\\xff\\xff\\xff\\xff\\xff\\x00"));
        assert!(record.ends_with(":/usr/bin/qemu-arm-static:"));
    }

    #[test]
    fn test_magic_and_mask_shapes() {
        for arch in Architecture::ALL {
            assert_eq!(elf_magic(arch).len(), 20);
            assert_eq!(elf_mask(arch).len(), 20);
        }
        assert_eq!(&elf_magic(Architecture::Aarch64)[18..], &[0xb7, 0x00]);
        assert_eq!(elf_magic(Architecture::X86_64)[4], 2);
        assert_eq!(elf_mask(Architecture::I386)[5], 0xfe);
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        let mut entry = BinfmtEntry::qemu("a:b", Architecture::Arm, Path::new("/q"));
        assert!(entry.validate().is_err());
        entry.name = "register".to_string();
        assert!(entry.validate().is_err());
        entry.name = "ok".to_string();
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn test_ensure_mounted_mounts_once() {
        let scratch = ScratchDir::new("binfmt-mount");
        let dir = scratch.mkdir("binfmt_misc");
        let mounts = FakeMounts::new();
        let registry = BinfmtRegistry::new(&dir);

        registry.ensure_mounted(&mounts).unwrap();
        assert!(dir.join("register").exists());
        registry.ensure_mounted(&mounts).unwrap();
        assert_eq!(mounts.filesystem_mounts(), 1);
    }

    #[test]
    fn test_unregister_absent_is_ok() {
        let scratch = ScratchDir::new("binfmt-absent");
        let registry = BinfmtRegistry::new(scratch.path());
        registry.unregister("nothing-here").unwrap();
    }

    #[test]
    fn test_register_writes_record() {
        let scratch = ScratchDir::new("binfmt-register");
        scratch.write_file("register", b"");
        let registry = BinfmtRegistry::new(scratch.path());
        let entry = BinfmtEntry::qemu("echroot-aarch64", Architecture::Aarch64, Path::new("/q"));

        registry.register(&entry).unwrap();
        let written = fs::read_to_string(scratch.path().join("register")).unwrap();
        assert_eq!(written, entry.record());
    }

    #[test]
    fn test_register_replaces_stale_entry() {
        let scratch = ScratchDir::new("binfmt-stale");
        scratch.write_file("register", b"");
        let stale = scratch.write_file("echroot-arm", b"enabled\ninterpreter /old/qemu\n");
        let registry = BinfmtRegistry::new(scratch.path());
        assert_eq!(
            registry.interpreter_of("echroot-arm"),
            Some(PathBuf::from("/old/qemu"))
        );

        let entry = BinfmtEntry::qemu("echroot-arm", Architecture::Arm, Path::new("/new/qemu"));
        registry.register(&entry).unwrap();
        // A plain file stands in for the kernel entry: the removal record was written to it.
        assert_eq!(fs::read_to_string(&stale).unwrap().get(..2), Some("-1"));
    }
}
