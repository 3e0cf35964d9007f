//! Shared mappings of the metadata regions.
//!
//! Two ways to reach the superblock and log exist. Before the
//! filesystem is mounted (fsck, mkmeta, mkfs) the metadata prefix is
//! mapped straight off the device. Once mounted, every other caller
//! goes through the two reserved meta files instead, which the kernel
//! has bound to the same device bytes. Either way the mapping is
//! `MAP_SHARED`: stores become visible to every process mapping the
//! same region, and the mapping is released when the value drops.

use famfs_error::{FamfsError, Result};
use famfs_types::{FAMFS_LOG_LEN, FAMFS_LOG_OFFSET, FAMFS_SUPERBLOCK_SIZE, u64_to_usize};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Access requested for a metadata mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    ReadOnly,
    ReadWrite,
}

enum MapInner {
    Ro(Mmap),
    Rw(MmapMut),
}

impl MapInner {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Ro(m) => m,
            Self::Rw(m) => m,
        }
    }

    fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        match self {
            Self::Ro(_) => Err(FamfsError::InvalidArg(
                "mapping was requested read-only".to_owned(),
            )),
            Self::Rw(m) => Ok(m),
        }
    }

    fn flush(&self) -> Result<()> {
        if let Self::Rw(m) = self {
            m.flush()?;
        }
        Ok(())
    }
}

/// Map `len` bytes of `file` from offset 0, shared.
#[allow(unsafe_code)]
fn map_len(file: &File, len: u64, mode: MapMode) -> Result<MapInner> {
    let len = u64_to_usize(len, "map_len")?;
    // SAFETY: the mapping is over a regular file or DAX device that the
    // caller keeps at least `len` bytes long; famfs metadata is only
    // ever mutated through these shared mappings, so the aliasing the
    // kernel permits is the aliasing the format is designed around.
    match mode {
        MapMode::ReadOnly => unsafe { MmapOptions::new().len(len).map(file) }
            .map(MapInner::Ro)
            .map_err(FamfsError::Io),
        MapMode::ReadWrite => unsafe { MmapOptions::new().len(len).map_mut(file) }
            .map(MapInner::Rw)
            .map_err(FamfsError::Io),
    }
}

// ── Raw device mapping ──────────────────────────────────────────────────────

/// The metadata prefix of a device, mapped directly.
///
/// Only fsck and mkmeta (and mkfs, which writes the prefix) map raw;
/// everything else goes through the meta files.
pub struct RawMedia {
    inner: MapInner,
}

impl RawMedia {
    /// Map `[0, log_offset + log_len)` of `device`.
    ///
    /// The prefix geometry is fixed per format version, so the length is
    /// known before the superblock has been read.
    pub fn map(device: &Path, mode: MapMode) -> Result<Self> {
        let len = FAMFS_SUPERBLOCK_SIZE + FAMFS_LOG_LEN;
        let file = OpenOptions::new()
            .read(true)
            .write(mode == MapMode::ReadWrite)
            .open(device)?;

        let md = file.metadata()?;
        if md.is_file() && md.len() < len {
            return Err(FamfsError::InvalidArg(format!(
                "{} is only {} bytes; the metadata prefix needs {len}",
                device.display(),
                md.len()
            )));
        }

        Ok(Self {
            inner: map_len(&file, len, mode)?,
        })
    }

    /// The superblock region `[0, superblock_size)`.
    #[must_use]
    pub fn superblock(&self) -> &[u8] {
        &self.inner.bytes()[..FAMFS_SUPERBLOCK_SIZE as usize]
    }

    pub fn superblock_mut(&mut self) -> Result<&mut [u8]> {
        Ok(&mut self.inner.bytes_mut()?[..FAMFS_SUPERBLOCK_SIZE as usize])
    }

    /// The log region `[log_offset, log_offset + log_len)`.
    #[must_use]
    pub fn log(&self) -> &[u8] {
        &self.inner.bytes()[FAMFS_LOG_OFFSET as usize..(FAMFS_LOG_OFFSET + FAMFS_LOG_LEN) as usize]
    }

    pub fn log_mut(&mut self) -> Result<&mut [u8]> {
        Ok(&mut self.inner.bytes_mut()?
            [FAMFS_LOG_OFFSET as usize..(FAMFS_LOG_OFFSET + FAMFS_LOG_LEN) as usize])
    }

    /// Flush dirty pages back to the medium (no-op for read-only maps).
    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }
}

// ── Whole-file mapping ──────────────────────────────────────────────────────

/// A whole file mapped shared: a meta file, or a user file being
/// written through its DAX mapping (cp, seeded fills).
pub struct FileMap {
    inner: MapInner,
    len: u64,
}

impl FileMap {
    /// Map the entire current extent of `file`.
    pub fn of_file(file: &File, mode: MapMode) -> Result<Self> {
        let len = file.metadata()?.len();
        if len == 0 {
            return Err(FamfsError::InvalidArg(
                "cannot map a zero-length file".to_owned(),
            ));
        }
        Ok(Self {
            inner: map_len(file, len, mode)?,
            len,
        })
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.inner.bytes()
    }

    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        self.inner.bytes_mut()
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }
}
