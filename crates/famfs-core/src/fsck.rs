//! Filesystem check.
//!
//! fsck has two ways in: an unmounted device (or raw image), whose
//! metadata prefix is mapped directly, or any path inside a mounted
//! filesystem, whose metadata arrives through the meta files. Either
//! way the output is the same report: the superblock dump, the log
//! occupancy, and the counters from a full bitmap build. Allocation
//! collisions are reportable, not fatal; a bad superblock is fatal.

use crate::media::{FileMap, MapMode, RawMedia};
use crate::mounts;
use crate::resolve;
use famfs_alloc::{BitmapReport, build_bitmap};
use famfs_error::{FamfsError, Result};
use famfs_ondisk::{LogHeader, Superblock};
use famfs_types::{FAMFS_LOG_LEN, FAMFS_SUPERBLOCK_SIZE, FAMFS_SUPER_MAGIC, read_le_u64};
use serde::Serialize;
use std::io::Read;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use tracing::info;

/// Log occupancy as fsck reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogInfo {
    pub entries_in_use: u64,
    pub capacity: u64,
    pub bytes_in_use: u64,
    pub next_seqnum: u64,
}

impl From<LogHeader> for LogInfo {
    fn from(header: LogHeader) -> Self {
        Self {
            entries_in_use: header.next_index,
            capacity: header.capacity(),
            bytes_in_use: header.bytes_in_use(),
            next_seqnum: header.next_seqnum,
        }
    }
}

/// Everything one fsck pass learns.
#[derive(Debug, Clone, Serialize)]
pub struct FsckReport {
    pub superblock: Superblock,
    pub log: LogInfo,
    pub bitmap: BitmapReport,
}

impl FsckReport {
    /// The canonical corrupted-allocation signal.
    #[must_use]
    pub fn alloc_errors(&self) -> u64 {
        self.bitmap.alloc_errors
    }

    /// Filesystem identity in canonical UUID form.
    #[must_use]
    pub fn uuid_string(&self) -> String {
        uuid::Uuid::from_bytes(self.superblock.uuid).to_string()
    }
}

/// Check the filesystem reachable from `path`.
///
/// `path` may be a DAX device or raw image (must be unmounted; `Busy`
/// otherwise) or any file or directory inside a mounted famfs.
pub fn fsck(path: &Path) -> Result<FsckReport> {
    let md = std::fs::metadata(path)?;
    let ft = md.file_type();

    let report = if ft.is_block_device() || ft.is_char_device() {
        fsck_device(path)?
    } else if ft.is_dir() {
        fsck_mounted(path)?
    } else if ft.is_file() {
        // A regular file is either a raw image or a path inside a
        // mount; the superblock magic at offset 0 settles it.
        if file_has_magic(path)? {
            fsck_device(path)?
        } else {
            fsck_mounted(path)?
        }
    } else {
        return Err(FamfsError::InvalidArg(format!(
            "not a device, file, or directory: {}",
            path.display()
        )));
    };

    info!(
        path = %path.display(),
        entries = report.log.entries_in_use,
        alloc_errors = report.bitmap.alloc_errors,
        "fsck scan complete"
    );
    Ok(report)
}

fn file_has_magic(path: &Path) -> Result<bool> {
    let md = std::fs::metadata(path)?;
    if md.len() < FAMFS_SUPERBLOCK_SIZE + FAMFS_LOG_LEN {
        return Ok(false);
    }
    let mut head = [0_u8; 8];
    let mut file = std::fs::File::open(path)?;
    file.read_exact(&mut head)?;
    Ok(matches!(read_le_u64(&head, 0), Ok(magic) if magic == FAMFS_SUPER_MAGIC))
}

fn fsck_device(device: &Path) -> Result<FsckReport> {
    // A mounted device must be checked through its mount point instead.
    if let Some(mount) = mounts::famfs_mount_of_device(device)? {
        return Err(FamfsError::Busy {
            device: device.to_string_lossy().into_owned(),
            mount,
        });
    }

    let media = RawMedia::map(device, MapMode::ReadOnly)?;
    let sb = Superblock::parse(media.superblock())
        .map_err(|e| FamfsError::BadSuperblock(e.to_string()))?;
    scan(&sb, media.log())
}

fn fsck_mounted(path: &Path) -> Result<FsckReport> {
    let sb_meta = resolve::open_superblock(path, false)?;
    let sb_map = FileMap::of_file(&sb_meta.file, MapMode::ReadOnly)?;
    let sb = Superblock::parse(sb_map.bytes())
        .map_err(|e| FamfsError::BadSuperblock(e.to_string()))?;

    let log_meta = resolve::open_log(path, false)?;
    let log_map = FileMap::of_file(&log_meta.file, MapMode::ReadOnly)?;
    scan(&sb, log_map.bytes())
}

fn scan(sb: &Superblock, log: &[u8]) -> Result<FsckReport> {
    let header = LogHeader::parse(log)?;
    let (_, bitmap_report) = build_bitmap(log, sb.primary().size, sb.log_offset, sb.log_len)?;

    Ok(FsckReport {
        superblock: sb.clone(),
        log: header.into(),
        bitmap: bitmap_report,
    })
}
