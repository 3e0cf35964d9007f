//! Device capacity discovery.
//!
//! DAX devices do not answer `lseek(SEEK_END)`, so capacity comes from
//! sysfs: block devices advertise a 512-byte sector count under
//! `/sys/class/block/<name>/size`, character devices a byte count under
//! `/sys/dev/char/<major>:<minor>/size`. Regular files (loopback images
//! used by tests and bring-up) report their own length. Nothing else is
//! a valid famfs medium.

use famfs_error::{FamfsError, Result};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use tracing::debug;

/// Resolve `path` to its capacity in bytes using the host's `/sys`.
pub fn device_size(path: &Path) -> Result<u64> {
    device_size_with_sysfs(path, Path::new("/sys"))
}

/// Capacity resolution with an explicit sysfs root (tests fake the tree).
pub fn device_size_with_sysfs(path: &Path, sysfs_root: &Path) -> Result<u64> {
    let md = std::fs::metadata(path)?;
    let ft = md.file_type();

    if ft.is_file() {
        return Ok(md.len());
    }

    let (node, unit) = if ft.is_block_device() {
        let name = path
            .file_name()
            .ok_or_else(|| FamfsError::NotADaxDevice(path.to_path_buf()))?;
        (
            sysfs_root.join("class/block").join(name).join("size"),
            512_u64,
        )
    } else if ft.is_char_device() {
        let rdev = md.rdev();
        let major = libc::major(rdev);
        let minor = libc::minor(rdev);
        (
            sysfs_root
                .join("dev/char")
                .join(format!("{major}:{minor}"))
                .join("size"),
            1_u64,
        )
    } else {
        return Err(FamfsError::NotADaxDevice(path.to_path_buf()));
    };

    let text = std::fs::read_to_string(&node).map_err(|source| FamfsError::SysfsUnavailable {
        path: node.clone(),
        source,
    })?;
    let units: u64 = text
        .trim()
        .parse()
        .map_err(|_| FamfsError::SysfsUnavailable {
            path: node.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "sysfs size attribute is not an integer",
            ),
        })?;

    let size = units * unit;
    debug!(path = %path.display(), size, "resolved device size");
    Ok(size)
}
