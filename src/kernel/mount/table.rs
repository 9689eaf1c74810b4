/// Live mount table from /proc/self/mountinfo
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// One line of /proc/self/mountinfo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_id: u32,
    pub parent_id: u32,
    pub mount_point: PathBuf,
    pub filesystem_type: String,
}

/// Undo the octal escaping the kernel applies to spaces, tabs, newlines and backslashes
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + (b - b'0') as u32);
                out.push(value as u8);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse a single line.
///
/// Format: `mount_id parent_id major:minor root mount_point options
/// [optional...] - fs_type source super_options`
pub fn parse_mountinfo_line(line: &str) -> Option<MountEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 7 {
        return None;
    }

    let mount_id = parts[0].parse::<u32>().ok()?;
    let parent_id = parts[1].parse::<u32>().ok()?;
    let mount_point = PathBuf::from(unescape(parts[4]));

    let sep_pos = parts.iter().skip(6).position(|&p| p == "-")? + 6;
    let filesystem_type = parts.get(sep_pos + 1)?.to_string();

    Some(MountEntry {
        mount_id,
        parent_id,
        mount_point,
        filesystem_type,
    })
}

pub fn parse_mountinfo(content: &str) -> Vec<MountEntry> {
    content.lines().filter_map(parse_mountinfo_line).collect()
}

/// Read the current mount table
pub fn read_mount_table() -> io::Result<Vec<MountEntry>> {
    let content = fs::read_to_string(MOUNTINFO)?;
    Ok(parse_mountinfo(&content))
}

/// Whether `path` is a mountpoint right now
pub fn is_mountpoint(path: &Path) -> io::Result<bool> {
    let wanted = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    Ok(read_mount_table()?
        .iter()
        .any(|entry| entry.mount_point == wanted))
}
