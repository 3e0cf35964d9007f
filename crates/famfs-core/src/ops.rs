//! Namespace operations.
//!
//! Everything here composes the lower layers: resolve the mount, map
//! the metadata, derive allocation state from the log, talk to the
//! kernel, append to the log. Multi-step operations compensate and
//! unwind: a failure after the kernel inode exists unlinks it, and a
//! ghost that slips through anyway is erased by the next remount
//! because it never reached the log.

use crate::device;
use crate::media::{FileMap, MapMode, RawMedia};
use crate::mounts;
use crate::resolve::{self, LOG_RELPATH, META_DIR, SB_RELPATH};
use famfs_alloc::{alloc_contiguous, build_bitmap};
use famfs_error::{FamfsError, Result};
use famfs_ioctl::{FileType, KernelAdapter, MapCreateSpec};
use famfs_ondisk::{
    FC_ALL_HOSTS_RW, FileCreate, LogEntryBody, MkdirEntry, SUPERBLOCK_STRUCT_SIZE, Superblock,
    append_entry, format_log, has_superblock_magic,
};
use famfs_types::{
    Extent, FAMFS_ALLOC_UNIT, FAMFS_LOG_LEN, FAMFS_LOG_OFFSET, FAMFS_SUPERBLOCK_SIZE,
    round_to_alloc_unit,
};
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

fn parse_superblock(region: &[u8]) -> Result<Superblock> {
    Superblock::parse(region).map_err(|e| FamfsError::BadSuperblock(e.to_string()))
}

// ── mkfs ────────────────────────────────────────────────────────────────────

/// Write a fresh filesystem onto `device`: superblock plus empty log.
///
/// Refuses a device that already carries a famfs superblock unless
/// `force` is set, and refuses a device that is currently mounted.
/// Returns the superblock that was written.
pub fn mkfs(device: &Path, force: bool) -> Result<Superblock> {
    if let Some(mount) = mounts::famfs_mount_of_device(device)? {
        return Err(FamfsError::Busy {
            device: device.to_string_lossy().into_owned(),
            mount,
        });
    }

    let size = device::device_size(device)?;
    let needed = FAMFS_LOG_OFFSET + FAMFS_LOG_LEN + FAMFS_ALLOC_UNIT;
    if size < needed {
        return Err(FamfsError::InvalidArg(format!(
            "device is {size} bytes; a filesystem needs at least {needed}"
        )));
    }

    let mut media = RawMedia::map(device, MapMode::ReadWrite)?;
    if has_superblock_magic(media.superblock()) && !force {
        return Err(FamfsError::Exists(device.to_path_buf()));
    }

    let uuid = *uuid::Uuid::new_v4().as_bytes();
    let sb = Superblock::new(uuid, &device.to_string_lossy(), size);

    let sb_region = media.superblock_mut()?;
    sb_region[..SUPERBLOCK_STRUCT_SIZE].fill(0);
    sb.encode(sb_region)?;

    let log_region = media.log_mut()?;
    log_region.fill(0);
    format_log(log_region, FAMFS_LOG_LEN)?;
    media.flush()?;

    info!(
        device = %device.display(),
        size,
        uuid = %uuid::Uuid::from_bytes(uuid),
        "created filesystem"
    );
    Ok(sb)
}

/// Clobber the superblock magic so the device no longer probes as famfs.
pub fn kill_superblock(device: &Path) -> Result<()> {
    if let Some(mount) = mounts::famfs_mount_of_device(device)? {
        return Err(FamfsError::Busy {
            device: device.to_string_lossy().into_owned(),
            mount,
        });
    }
    let mut media = RawMedia::map(device, MapMode::ReadWrite)?;
    media.superblock_mut()?[..8].fill(0);
    media.flush()?;
    info!(device = %device.display(), "killed superblock");
    Ok(())
}

// ── mkmeta ──────────────────────────────────────────────────────────────────

/// Create the `.meta/` files for the mounted filesystem on `device`.
///
/// The mount point is discovered through `/proc/mounts`; the superblock
/// is read raw off the device (the meta files do not exist yet), and
/// the two reserved files are bound to their fixed device regions.
pub fn mkmeta(device: &Path, kernel: &dyn KernelAdapter) -> Result<PathBuf> {
    let mount = mounts::famfs_mount_of_device(device)?
        .ok_or_else(|| FamfsError::NotMounted(device.to_string_lossy().into_owned()))?;
    mkmeta_at(device, &mount, kernel)?;
    Ok(mount)
}

/// `mkmeta` with the mount point supplied by the caller.
pub fn mkmeta_at(device: &Path, mount: &Path, kernel: &dyn KernelAdapter) -> Result<()> {
    let media = RawMedia::map(device, MapMode::ReadOnly)?;
    let sb = parse_superblock(media.superblock())?;

    let meta_dir = mount.join(META_DIR);
    if !meta_dir.exists() {
        let mut builder = DirBuilder::new();
        builder.mode(0o700);
        builder.create(&meta_dir)?;
    }

    create_meta_file(
        &mount.join(SB_RELPATH),
        FAMFS_SUPERBLOCK_SIZE,
        FileType::Superblock,
        Extent::new(0, FAMFS_SUPERBLOCK_SIZE),
        kernel,
    )?;
    create_meta_file(
        &mount.join(LOG_RELPATH),
        sb.log_len,
        FileType::Log,
        Extent::new(sb.log_offset, sb.log_len),
        kernel,
    )?;

    info!(mount = %mount.display(), "meta files ready");
    Ok(())
}

fn create_meta_file(
    path: &Path,
    size: u64,
    file_type: FileType,
    extent: Extent,
    kernel: &dyn KernelAdapter,
) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(md) if md.is_file() => {
            if md.len() != size {
                warn!(path = %path.display(), found = md.len(), want = size,
                    "unlinking wrong-sized meta file");
                std::fs::remove_file(path)?;
            }
        }
        Ok(_) => {
            return Err(FamfsError::InvalidArg(format!(
                "non-regular file found where meta file expected: {}",
                path.display()
            )));
        }
        Err(_) => {}
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o600)
        .open(path)?;
    kernel.map_create(
        &file,
        path,
        &MapCreateSpec {
            file_type,
            file_size: size,
            extents: vec![extent],
        },
    )
}

// ── mkfile ──────────────────────────────────────────────────────────────────

/// Phase one of file creation: an empty kernel inode, verified to live
/// on famfs, with ownership applied when both ids are non-zero.
///
/// The result is invalid until extents are bound and the creation is
/// logged; remount erases it if the caller never gets that far.
pub fn file_create(
    path: &Path,
    mode: u32,
    uid: u32,
    gid: u32,
    kernel: &dyn KernelAdapter,
) -> Result<File> {
    if path.exists() {
        return Err(FamfsError::Exists(path.to_path_buf()));
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)?;

    if !kernel.is_famfs(&file) {
        drop(file);
        let _ = std::fs::remove_file(path);
        return Err(FamfsError::NotFamfs(path.to_path_buf()));
    }

    if uid != 0 && gid != 0 {
        if let Err(err) = std::os::unix::fs::fchown(&file, Some(uid), Some(gid)) {
            warn!(path = %path.display(), %err, "fchown failed");
        }
    }
    Ok(file)
}

/// Phase two: allocate space, bind it, and log the creation.
fn file_alloc(
    file: &File,
    path: &Path,
    size: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    kernel: &dyn KernelAdapter,
) -> Result<()> {
    let full = path.canonicalize()?;

    let log_meta = resolve::open_log(&full, true)?;
    let mut log_map = FileMap::of_file(&log_meta.file, MapMode::ReadWrite)?;

    let sb_meta = resolve::open_superblock(&full, false)?;
    let sb_map = FileMap::of_file(&sb_meta.file, MapMode::ReadOnly)?;
    let sb = parse_superblock(sb_map.bytes())?;

    // Resolve the relative path before allocating, so a bogus path
    // costs nothing.
    let relpath = resolve::relpath_within(&log_meta.mount, &full)?;

    let (mut bitmap, _) = build_bitmap(
        log_map.bytes(),
        sb.primary().size,
        sb.log_offset,
        sb.log_len,
    )?;
    let offset = alloc_contiguous(&mut bitmap, size)?;
    let extent = Extent::new(
        offset,
        round_to_alloc_unit(size).ok_or_else(|| {
            FamfsError::InvalidArg(format!("size {size} overflows allocation rounding"))
        })?,
    );

    // Bind before logging: a failed bind must not burn a log slot, and
    // an unlogged binding is erased by the next remount anyway.
    kernel.map_create(
        file,
        &full,
        &MapCreateSpec {
            file_type: FileType::Regular,
            file_size: size,
            extents: vec![extent],
        },
    )?;

    append_entry(
        log_map.bytes_mut()?,
        &LogEntryBody::FileCreate(FileCreate {
            relpath,
            size,
            flags: FC_ALL_HOSTS_RW,
            mode,
            uid,
            gid,
            extents: vec![extent],
        }),
    )?;
    log_map.flush()?;

    debug!(path = %full.display(), size, offset, "allocated and logged file");
    Ok(())
}

/// Create *and* allocate a file; returns the open descriptor.
pub fn mkfile(
    path: &Path,
    size: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    kernel: &dyn KernelAdapter,
) -> Result<File> {
    if size == 0 {
        return Err(FamfsError::InvalidArg("file size must be non-zero".to_owned()));
    }
    let file = file_create(path, mode, uid, gid, kernel)?;
    if let Err(err) = file_alloc(&file, path, size, mode, uid, gid, kernel) {
        let _ = std::fs::remove_file(path);
        return Err(err);
    }
    Ok(file)
}

// ── mkdir ───────────────────────────────────────────────────────────────────

/// Create a directory and log it.
///
/// The parent must already exist as a directory inside a famfs mount;
/// intermediate directories are not created.
pub fn mkdir(path: &Path, mode: u32, uid: u32, gid: u32) -> Result<()> {
    let name = path
        .file_name()
        .ok_or_else(|| FamfsError::InvalidArg(format!("bad directory path: {}", path.display())))?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => {
            return Err(FamfsError::InvalidArg(format!(
                "bad directory path: {}",
                path.display()
            )));
        }
    };

    let parent_md = std::fs::metadata(parent)?;
    if !parent_md.is_dir() {
        return Err(FamfsError::InvalidArg(format!(
            "parent of {} is not a directory",
            path.display()
        )));
    }
    let real_parent = parent.canonicalize()?;
    let full = real_parent.join(name);
    if full.exists() {
        return Err(FamfsError::Exists(full));
    }

    let log_meta = resolve::open_log(&real_parent, true)?;
    let mut log_map = FileMap::of_file(&log_meta.file, MapMode::ReadWrite)?;
    let relpath = resolve::relpath_within(&log_meta.mount, &full)?;

    debug!(path = %full.display(), mode, "creating directory");
    let mut builder = DirBuilder::new();
    builder.mode(mode);
    builder.create(&full)?;
    if uid != 0 && gid != 0 {
        if let Err(err) = std::os::unix::fs::chown(&full, Some(uid), Some(gid)) {
            warn!(path = %full.display(), %err, "chown failed");
        }
    }

    let logged = append_entry(
        log_map.bytes_mut()?,
        &LogEntryBody::Mkdir(MkdirEntry {
            relpath,
            mode,
            uid,
            gid,
        }),
    );
    if let Err(err) = logged {
        let _ = std::fs::remove_dir(&full);
        return Err(err);
    }
    log_map.flush()
}

// ── cp ──────────────────────────────────────────────────────────────────────

const CP_CHUNK: usize = 0x10_0000; // 1 MiB copy chunks

/// Copy an ordinary file into the famfs namespace.
///
/// The destination must not exist; it inherits size, mode, and
/// ownership from the source, and the data is read into the
/// destination's shared mapping chunk by chunk.
pub fn cp(src: &Path, dst: &Path, kernel: &dyn KernelAdapter) -> Result<u64> {
    if dst.exists() {
        return Err(FamfsError::Exists(dst.to_path_buf()));
    }
    let src_md = std::fs::metadata(src)?;
    if !src_md.is_file() {
        return Err(FamfsError::InvalidArg(format!(
            "source is not a regular file: {}",
            src.display()
        )));
    }
    let size = src_md.len();
    let mode = src_md.permissions().mode() & 0o7777;

    let dst_file = mkfile(dst, size, mode, src_md.uid(), src_md.gid(), kernel)?;

    let copied = copy_into(src, &dst_file, size);
    match copied {
        Ok(bytes) => {
            info!(src = %src.display(), dst = %dst.display(), bytes, "copied");
            Ok(bytes)
        }
        Err(err) => {
            let _ = std::fs::remove_file(dst);
            Err(err)
        }
    }
}

fn copy_into(src: &Path, dst_file: &File, size: u64) -> Result<u64> {
    let mut src_file = File::open(src)?;
    let mut map = FileMap::of_file(dst_file, MapMode::ReadWrite)?;
    let dest = map.bytes_mut()?;

    let mut offset = 0_usize;
    let total = usize::try_from(size)
        .map_err(|_| FamfsError::InvalidArg("source too large for this platform".to_owned()))?;
    while offset < total {
        let want = CP_CHUNK.min(total - offset);
        let got = src_file.read(&mut dest[offset..offset + want])?;
        if got == 0 {
            return Err(FamfsError::InvalidArg(format!(
                "short read: source shrank at offset {offset}"
            )));
        }
        offset += got;
    }
    map.flush()?;
    Ok(offset as u64)
}
