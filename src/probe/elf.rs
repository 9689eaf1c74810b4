/// ELF identification header decoding
///
/// Only the fixed-layout file header is decoded, plus the program header
/// table when linkage is asked for. Every read failure, short read or
/// inconsistent field is a negative result, never an error.
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_NIDENT: usize = 16;

const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;

const E_MACHINE_OFFSET: usize = 18;
const PT_INTERP: u32 = 3;

/// Word size selected by `e_ident[EI_CLASS]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

impl ElfClass {
    fn from_ident(byte: u8) -> Option<Self> {
        match byte {
            ELFCLASS32 => Some(ElfClass::Elf32),
            ELFCLASS64 => Some(ElfClass::Elf64),
            _ => None,
        }
    }

    /// Size of the file header for this class
    pub fn header_size(self) -> usize {
        match self {
            ElfClass::Elf32 => 52,
            ElfClass::Elf64 => 64,
        }
    }
}

/// Byte order selected by `e_ident[EI_DATA]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    fn from_ident(byte: u8) -> Option<Self> {
        match byte {
            ELFDATA2LSB => Some(Endian::Little),
            ELFDATA2MSB => Some(Endian::Big),
            _ => None,
        }
    }

    fn u16(self, bytes: &[u8], offset: usize) -> u16 {
        let raw = [bytes[offset], bytes[offset + 1]];
        match self {
            Endian::Little => u16::from_le_bytes(raw),
            Endian::Big => u16::from_be_bytes(raw),
        }
    }

    fn u32(self, bytes: &[u8], offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[offset..offset + 4]);
        match self {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        }
    }

    fn u64(self, bytes: &[u8], offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[offset..offset + 8]);
        match self {
            Endian::Little => u64::from_le_bytes(raw),
            Endian::Big => u64::from_be_bytes(raw),
        }
    }
}

/// Decoded subset of the ELF file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    pub class: ElfClass,
    pub endian: Endian,
    pub machine: u16,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

impl ElfHeader {
    /// Decode a header from the first bytes of a file.
    ///
    /// Returns `None` when the magic is missing, the class or data byte is
    /// not a defined value, or fewer bytes than the header needs are present.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < EI_NIDENT || bytes[..4] != ELF_MAGIC {
            return None;
        }

        let class = ElfClass::from_ident(bytes[EI_CLASS])?;
        let endian = Endian::from_ident(bytes[EI_DATA])?;
        if bytes.len() < class.header_size() {
            return None;
        }

        let machine = endian.u16(bytes, E_MACHINE_OFFSET);
        let (phoff, phentsize, phnum) = match class {
            ElfClass::Elf32 => (
                endian.u32(bytes, 28) as u64,
                endian.u16(bytes, 42),
                endian.u16(bytes, 44),
            ),
            ElfClass::Elf64 => (
                endian.u64(bytes, 32),
                endian.u16(bytes, 54),
                endian.u16(bytes, 56),
            ),
        };

        Some(ElfHeader {
            class,
            endian,
            machine,
            phoff,
            phentsize,
            phnum,
        })
    }

    /// Read and decode the header of the file at `path`
    pub fn read(path: &Path) -> Option<Self> {
        let file = File::open(path).ok()?;
        let mut buf = Vec::with_capacity(ElfClass::Elf64.header_size());
        file.take(ElfClass::Elf64.header_size() as u64)
            .read_to_end(&mut buf)
            .ok()?;
        Self::parse(&buf)
    }
}

/// Whether the executable at `path` needs a program interpreter.
///
/// `Some(true)` for dynamically linked images (a `PT_INTERP` segment is
/// present), `Some(false)` for static ones, `None` if the file is not a
/// readable ELF image.
pub fn is_dynamically_linked(path: &Path) -> Option<bool> {
    let header = ElfHeader::read(path)?;
    if header.phnum == 0 {
        return Some(false);
    }
    if header.phentsize < 4 {
        return None;
    }

    let mut file = File::open(path).ok()?;
    let mut p_type = [0u8; 4];
    for index in 0..header.phnum as u64 {
        let offset = header
            .phoff
            .checked_add(index.checked_mul(header.phentsize as u64)?)?;
        file.seek(SeekFrom::Start(offset)).ok()?;
        file.read_exact(&mut p_type).ok()?;
        if header.endian.u32(&p_type, 0) == PT_INTERP {
            return Some(true);
        }
    }

    Some(false)
}
