//! Log replay: rebuild the kernel namespace from the log.
//!
//! The log is the sole source of truth. At mount time every entry is
//! replayed in index order: file-create entries become empty inodes
//! bound to their recorded extents, mkdir entries become directories.
//! Anything already present is left alone, which is what makes replay
//! idempotent and what erases half-built files: a file that never
//! reached the log simply is not recreated.

use famfs_error::Result;
use famfs_ioctl::{FileType, KernelAdapter, MapCreateSpec};
use famfs_ondisk::{FileCreate, LogEntryBody, LogEntryIter, MkdirEntry, path_is_relative};
use serde::Serialize;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::{debug, info, warn};

/// How far replay is allowed to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Create files and directories and bind extents.
    Commit,
    /// Validate every entry but mutate nothing.
    DryRun,
}

/// Aggregate counters for one replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ReplayStats {
    pub processed: u64,
    pub files_created: u64,
    pub dirs_created: u64,
    pub already_present: u64,
    pub skipped_relative: u64,
    pub skipped_zero_offset: u64,
    pub invalid_entries: u64,
    pub errors: u64,
}

enum Target<'a> {
    /// Replay against a famfs mount through the kernel driver.
    Kernel(&'a dyn KernelAdapter),
    /// Replay the namespace shape into an ordinary directory.
    Shadow,
}

/// Replay `log` under `mount` through the kernel adapter.
pub fn replay_log(
    log: &[u8],
    mount: &Path,
    kernel: &dyn KernelAdapter,
    mode: ReplayMode,
) -> Result<ReplayStats> {
    replay(log, mount, &Target::Kernel(kernel), mode)
}

/// Replay the namespace skeleton into `shadow`, an ordinary directory.
///
/// No famfs guard and no extent binding: files are created empty at
/// their recorded size so the tree can be inspected on any filesystem.
pub fn replay_shadow(log: &[u8], shadow: &Path) -> Result<ReplayStats> {
    replay(log, shadow, &Target::Shadow, ReplayMode::Commit)
}

fn replay(log: &[u8], mount: &Path, target: &Target<'_>, mode: ReplayMode) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();

    for entry in LogEntryIter::new(log)? {
        let entry = entry?;
        stats.processed += 1;
        match entry.body {
            LogEntryBody::FileCreate(fc) => {
                replay_file(&fc, entry.index, mount, target, mode, &mut stats);
            }
            LogEntryBody::Mkdir(md) => {
                replay_mkdir(&md, entry.index, mount, mode, &mut stats);
            }
            LogEntryBody::Unknown { kind } => {
                warn!(index = entry.index, kind, "invalid log entry");
                stats.invalid_entries += 1;
            }
        }
    }

    info!(
        processed = stats.processed,
        files = stats.files_created,
        dirs = stats.dirs_created,
        errors = stats.errors,
        "replayed log"
    );
    Ok(stats)
}

fn replay_file(
    fc: &FileCreate,
    index: u64,
    mount: &Path,
    target: &Target<'_>,
    mode: ReplayMode,
    stats: &mut ReplayStats,
) {
    if !path_is_relative(&fc.relpath) {
        warn!(index, relpath = %fc.relpath, "ignoring file entry; path is not relative");
        stats.skipped_relative += 1;
        return;
    }
    // Offset 0 is the superblock; no logged file may reach it.
    if fc.extents.iter().any(|e| e.offset == 0) {
        warn!(index, relpath = %fc.relpath, "ignoring file entry with zero-offset extent");
        stats.skipped_zero_offset += 1;
        return;
    }

    let full = mount.join(&fc.relpath);
    if full.exists() {
        warn!(index, path = %full.display(), "file already exists; skipping");
        stats.already_present += 1;
        return;
    }

    if mode == ReplayMode::DryRun {
        stats.files_created += 1;
        return;
    }

    debug!(index, path = %full.display(), mode = fc.mode, "creating file");
    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(fc.mode)
        .open(&full)
    {
        Ok(file) => file,
        Err(err) => {
            warn!(index, path = %full.display(), %err, "unable to create file");
            stats.errors += 1;
            return;
        }
    };

    match target {
        Target::Kernel(kernel) => {
            if !kernel.is_famfs(&file) {
                warn!(index, path = %full.display(), "created file is not on famfs");
                let _ = std::fs::remove_file(&full);
                stats.errors += 1;
                return;
            }
            if fc.uid != 0 && fc.gid != 0 {
                if let Err(err) = std::os::unix::fs::fchown(&file, Some(fc.uid), Some(fc.gid)) {
                    warn!(index, path = %full.display(), %err, "fchown failed");
                }
            }
            let spec = MapCreateSpec {
                file_type: FileType::Regular,
                file_size: fc.size,
                extents: fc.extents.clone(),
            };
            if let Err(err) = kernel.map_create(&file, &full, &spec) {
                warn!(index, path = %full.display(), %err, "extent binding failed");
                let _ = std::fs::remove_file(&full);
                stats.errors += 1;
                return;
            }
        }
        Target::Shadow => {
            // Skeleton only: carry the size, skip ownership and binding.
            if let Err(err) = file.set_len(fc.size) {
                warn!(index, path = %full.display(), %err, "cannot size shadow file");
            }
        }
    }

    stats.files_created += 1;
}

fn replay_mkdir(
    md: &MkdirEntry,
    index: u64,
    mount: &Path,
    mode: ReplayMode,
    stats: &mut ReplayStats,
) {
    if !path_is_relative(&md.relpath) {
        warn!(index, relpath = %md.relpath, "ignoring mkdir entry; path is not relative");
        stats.skipped_relative += 1;
        return;
    }

    let full = mount.join(&md.relpath);
    match std::fs::metadata(&full) {
        Ok(meta) if meta.is_dir() => {
            warn!(index, path = %full.display(), "directory already exists");
            stats.already_present += 1;
            return;
        }
        Ok(_) => {
            warn!(index, path = %full.display(), "non-directory exists where directory expected");
            stats.already_present += 1;
            return;
        }
        Err(_) => {}
    }

    if mode == ReplayMode::DryRun {
        stats.dirs_created += 1;
        return;
    }

    debug!(index, path = %full.display(), mode = md.mode, "creating directory");
    let mut builder = std::fs::DirBuilder::new();
    std::os::unix::fs::DirBuilderExt::mode(&mut builder, md.mode);
    if let Err(err) = builder.create(&full) {
        warn!(index, path = %full.display(), %err, "unable to create directory");
        stats.errors += 1;
        return;
    }
    if md.uid != 0 && md.gid != 0 {
        if let Err(err) = std::os::unix::fs::chown(&full, Some(md.uid), Some(md.gid)) {
            warn!(index, path = %full.display(), %err, "chown failed");
        }
    }
    stats.dirs_created += 1;
}
