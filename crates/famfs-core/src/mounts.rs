//! `/proc/mounts` scanning.
//!
//! A famfs instance is recognized by its fstype column; the device
//! column is compared as the literal string mount(8) recorded. Parsing
//! is split from I/O so the column handling is testable on fixed text.

use famfs_error::Result;
use std::path::{Path, PathBuf};

/// One line of a mounts table, reduced to the columns famfs cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount: PathBuf,
    pub fstype: String,
}

/// Decode the octal escapes mount tables use for whitespace in paths.
fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        match u8::from_str_radix(&digits, 8) {
            Ok(code) if digits.len() == 3 => {
                out.push(code as char);
                chars.nth(2);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Parse mounts-table text into entries; malformed lines are dropped.
#[must_use]
pub fn parse_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let device = cols.next()?;
            let mount = cols.next()?;
            let fstype = cols.next()?;
            Some(MountEntry {
                device: unescape(device),
                mount: PathBuf::from(unescape(mount)),
                fstype: fstype.to_owned(),
            })
        })
        .collect()
}

/// The mount point of the famfs instance backed by `device`, if any.
#[must_use]
pub fn famfs_mount_in(entries: &[MountEntry], device: &str) -> Option<PathBuf> {
    entries
        .iter()
        .find(|e| e.fstype == "famfs" && e.device == device)
        .map(|e| e.mount.clone())
}

/// Scan the host's `/proc/mounts` for a famfs mount of `device`.
pub fn famfs_mount_of_device(device: &Path) -> Result<Option<PathBuf>> {
    let text = std::fs::read_to_string("/proc/mounts")?;
    let device = device.to_string_lossy();
    Ok(famfs_mount_in(&parse_mounts(&text), &device))
}
