//! Memory mapping utilities for process address space analysis
//!
//! This module parses /proc/pid/maps to find every file-backed mapping of the
//! traced process, which is needed to know which object file an instruction
//! belongs to and where that object was loaded (PIE executables and shared
//! libraries are relocated at load time).

use log::debug;
use std::fs;

use crate::domain::{Pid, TargetError};

/// Memory range of a mapping in a process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// One file-backed line of /proc/pid/maps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub range: MemoryRange,
    /// Offset of `range.start` within the file
    pub offset: u64,
    pub executable: bool,
    pub path: String,
}

/// Parse the contents of /proc/pid/maps.
///
/// Anonymous mappings and pseudo-files (`[heap]`, `[stack]`, `[vdso]`, ...) are
/// skipped; they have no object file to symbolize against.
#[must_use]
pub fn parse_maps(content: &str) -> Vec<Mapping> {
    content.lines().filter_map(parse_maps_line).collect()
}

/// Parse a line: "start-end perms offset dev inode pathname"
fn parse_maps_line(line: &str) -> Option<Mapping> {
    let mut fields = line.splitn(6, char::is_whitespace);
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next()?.trim_start();

    if !path.starts_with('/') {
        return None;
    }
    let path = path.strip_suffix(" (deleted)").unwrap_or(path);

    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let offset = u64::from_str_radix(offset, 16).ok()?;

    Some(Mapping {
        range: MemoryRange { start, end },
        offset,
        executable: perms.as_bytes().get(2) == Some(&b'x'),
        path: path.to_string(),
    })
}

/// Read and parse /proc/pid/maps
///
/// # Errors
/// Returns an error if /proc/pid/maps cannot be read
pub fn read_memory_maps(pid: Pid) -> Result<Vec<Mapping>, TargetError> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    let maps = fs::read_to_string(&maps_path).map_err(|_| TargetError::MemoryMapsParseFailed(pid))?;
    let mappings = parse_maps(&maps);
    debug!("{} file-backed mappings in {maps_path}", mappings.len());
    Ok(mappings)
}

/// Runtime load bias of the object at `path`: `runtime address - link-time address`.
///
/// Uses the mapping with the lowest file offset, assuming the first loadable
/// segment starts at file offset 0 (true for executables and shared libraries
/// produced by the usual linkers).
#[must_use]
pub fn load_bias(mappings: &[Mapping], path: &str, min_segment_address: u64) -> Option<u64> {
    mappings
        .iter()
        .filter(|m| m.path == path)
        .min_by_key(|m| m.offset)
        .map(|m| m.range.start.wrapping_sub(m.offset).wrapping_sub(min_segment_address))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c8a00000-55d0c8a01000 r--p 00000000 fd:01 1234   /usr/bin/app
55d0c8a01000-55d0c8a02000 r-xp 00001000 fd:01 1234   /usr/bin/app
55d0c9c4e000-55d0c9c6f000 rw-p 00000000 00:00 0      [heap]
7f1e2a000000-7f1e2a028000 r--p 00000000 fd:01 5678   /usr/lib/libc.so.6
7f1e2a028000-7f1e2a1bd000 r-xp 00028000 fd:01 5678   /usr/lib/libc.so.6
7f1e2a300000-7f1e2a301000 rw-p 00000000 00:00 0
7ffd4b7f1000-7ffd4b7f3000 r-xp 00000000 00:00 0      [vdso]
7f1e2a400000-7f1e2a401000 r-xp 00000000 fd:01 9999   /tmp/my lib.so (deleted)";

    #[test]
    fn test_memory_range_contains() {
        let range = MemoryRange { start: 0x1000, end: 0x2000 };

        assert!(range.contains(0x1000));
        assert!(range.contains(0x1500));
        assert!(range.contains(0x1FFF));
        assert!(!range.contains(0x0FFF));
        assert!(!range.contains(0x2000));
        assert!(!range.contains(0x2001));
    }

    #[test]
    fn test_parse_maps_keeps_file_backed_mappings() {
        let mappings = parse_maps(MAPS);
        assert_eq!(mappings.len(), 5);
        assert!(mappings.iter().all(|m| m.path.starts_with('/')));
    }

    #[test]
    fn test_parse_maps_fields() {
        let mappings = parse_maps(MAPS);
        let text = &mappings[1];
        assert_eq!(text.range, MemoryRange { start: 0x55d0_c8a0_1000, end: 0x55d0_c8a0_2000 });
        assert_eq!(text.offset, 0x1000);
        assert!(text.executable);
        assert!(!mappings[0].executable);
        assert_eq!(text.path, "/usr/bin/app");
    }

    #[test]
    fn test_parse_maps_handles_spaces_and_deleted_suffix() {
        let mappings = parse_maps(MAPS);
        assert_eq!(mappings[4].path, "/tmp/my lib.so");
    }

    #[test]
    fn test_load_bias_for_pie_and_fixed_executables() {
        let mappings = parse_maps(MAPS);
        assert_eq!(load_bias(&mappings, "/usr/bin/app", 0), Some(0x55d0_c8a0_0000));
        assert_eq!(load_bias(&mappings, "/usr/lib/libc.so.6", 0), Some(0x7f1e_2a00_0000));
        assert_eq!(load_bias(&mappings, "/missing", 0), None);

        let fixed = parse_maps("00400000-00401000 r-xp 00000000 fd:01 1 /usr/bin/static");
        assert_eq!(load_bias(&fixed, "/usr/bin/static", 0x40_0000), Some(0));
    }

    #[test]
    fn test_read_memory_maps_self() {
        let pid = Pid(std::process::id() as i32);
        let mappings = read_memory_maps(pid).unwrap();

        let exe = std::env::current_exe().unwrap();
        let exe = exe.to_string_lossy();
        assert!(mappings.iter().any(|m| m.executable && m.path == exe));
    }
}
