#![forbid(unsafe_code)]
//! Error types for the famfs control plane.
//!
//! Defines `FamfsError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings so the CLI can exit with a
//! meaningful status.

use famfs_types::ParseError;
use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for all famfs operations.
#[derive(Debug, Error)]
pub enum FamfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid superblock: {0}")]
    BadSuperblock(String),

    #[error("log is full")]
    LogFull,

    #[error("corrupt log: {0}")]
    LogCorrupt(String),

    #[error("{count} allocation collisions found")]
    AllocCollision { count: u64 },

    #[error("no contiguous free space for {requested} bytes")]
    OutOfSpace { requested: u64 },

    #[error("{} is not on a famfs file system", .0.display())]
    NotFamfs(PathBuf),

    #[error("no famfs mount found for device {0}")]
    NotMounted(String),

    #[error("device {device} is mounted at {mount}; unmount it first")]
    Busy { device: String, mount: PathBuf },

    #[error("path is not relative: {0}")]
    PathNotRelative(String),

    #[error("path {} is not within mount {}", .path.display(), .mount.display())]
    PathNotInMount { path: PathBuf, mount: PathBuf },

    #[error("{op} ioctl failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not a DAX character or block device", .0.display())]
    NotADaxDevice(PathBuf),

    #[error("cannot read device size from sysfs node {}: {source}", .path.display())]
    SysfsUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} already exists", .0.display())]
    Exists(PathBuf),

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("on-media parse failure: {0}")]
    Parse(#[from] ParseError),
}

impl FamfsError {
    /// Convert this error into a POSIX errno suitable for exit statuses.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::BadSuperblock(_) | Self::LogCorrupt(_) | Self::Parse(_) => libc::EIO,
            Self::LogFull => libc::ENOSPC,
            Self::AllocCollision { .. } => libc::EIO,
            Self::OutOfSpace { .. } => libc::ENOSPC,
            Self::NotFamfs(_) => libc::EBADF,
            Self::NotMounted(_) => libc::ENODEV,
            Self::Busy { .. } => libc::EBUSY,
            Self::PathNotRelative(_) | Self::PathNotInMount { .. } | Self::InvalidArg(_) => {
                libc::EINVAL
            }
            Self::Ioctl { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            Self::NotADaxDevice(_) => libc::EINVAL,
            Self::SysfsUnavailable { source, .. } => source.raw_os_error().unwrap_or(libc::EINVAL),
            Self::Exists(_) => libc::EEXIST,
        }
    }
}

/// Result alias using `FamfsError`.
pub type Result<T> = std::result::Result<T, FamfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mappings() {
        assert_eq!(FamfsError::LogFull.to_errno(), libc::ENOSPC);
        assert_eq!(
            FamfsError::OutOfSpace { requested: 42 }.to_errno(),
            libc::ENOSPC
        );
        assert_eq!(
            FamfsError::NotFamfs(PathBuf::from("/tmp/x")).to_errno(),
            libc::EBADF
        );
        assert_eq!(
            FamfsError::Busy {
                device: "/dev/dax0.0".to_owned(),
                mount: PathBuf::from("/mnt/famfs"),
            }
            .to_errno(),
            libc::EBUSY
        );
        assert_eq!(
            FamfsError::PathNotRelative("/abs".to_owned()).to_errno(),
            libc::EINVAL
        );
    }

    #[test]
    fn io_error_preserves_raw_errno() {
        let err = FamfsError::Io(std::io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn display_is_one_line() {
        let err = FamfsError::Busy {
            device: "/dev/pmem0".to_owned(),
            mount: PathBuf::from("/mnt/famfs"),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("/dev/pmem0"));
        assert!(!rendered.contains('\n'));
    }
}
