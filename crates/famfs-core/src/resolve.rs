//! Mount discovery by upward walk.
//!
//! Any path inside a famfs mount can find its metadata: ascend toward
//! the root until a directory holding `.meta/.superblock` (or
//! `.meta/.log`) as a regular file appears. That directory is the mount
//! point. This walk is the only way the library answers "which famfs am
//! I in?".

use famfs_error::{FamfsError, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reserved metadata directory directly under the mount point.
pub const META_DIR: &str = ".meta";

/// Superblock meta file, relative to the mount point.
pub const SB_RELPATH: &str = ".meta/.superblock";

/// Log meta file, relative to the mount point.
pub const LOG_RELPATH: &str = ".meta/.log";

/// A resolved meta file: the mount it belongs to, the open file, and
/// its size.
#[derive(Debug)]
pub struct MetaFile {
    pub mount: PathBuf,
    pub file: File,
    pub size: u64,
}

fn open_relpath(start: &Path, relpath: &str, writable: bool) -> Result<MetaFile> {
    let rationalized = start
        .canonicalize()
        .map_err(|_| FamfsError::NotFamfs(start.to_path_buf()))?;

    let mut cur: &Path = if rationalized.is_dir() {
        &rationalized
    } else {
        rationalized
            .parent()
            .ok_or_else(|| FamfsError::NotFamfs(start.to_path_buf()))?
    };

    loop {
        let candidate = cur.join(relpath);
        if candidate.is_file() {
            let file = OpenOptions::new()
                .read(true)
                .write(writable)
                .open(&candidate)?;
            let size = file.metadata()?.len();
            debug!(mount = %cur.display(), meta = relpath, size, "resolved mount");
            return Ok(MetaFile {
                mount: cur.to_path_buf(),
                file,
                size,
            });
        }
        match cur.parent() {
            Some(parent) => cur = parent,
            None => return Err(FamfsError::NotFamfs(start.to_path_buf())),
        }
    }
}

/// Find and open the log of the mount containing `path`.
pub fn open_log(path: &Path, writable: bool) -> Result<MetaFile> {
    open_relpath(path, LOG_RELPATH, writable)
}

/// Find and open the superblock of the mount containing `path`.
pub fn open_superblock(path: &Path, writable: bool) -> Result<MetaFile> {
    open_relpath(path, SB_RELPATH, writable)
}

/// The path of `full` relative to `mount`, as the log records it.
///
/// `full` must be rationalized the same way the mount was (both come
/// out of `canonicalize`), so a plain prefix strip is exact.
pub fn relpath_within(mount: &Path, full: &Path) -> Result<String> {
    let rel = full
        .strip_prefix(mount)
        .map_err(|_| FamfsError::PathNotInMount {
            path: full.to_path_buf(),
            mount: mount.to_path_buf(),
        })?;
    let rel = rel
        .to_str()
        .ok_or_else(|| FamfsError::InvalidArg(format!("non-UTF-8 path: {}", full.display())))?;
    if rel.is_empty() {
        return Err(FamfsError::PathNotInMount {
            path: full.to_path_buf(),
            mount: mount.to_path_buf(),
        });
    }
    Ok(rel.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Lay down a fake mount: root/.meta/{.superblock,.log} with junk bytes.
    fn fake_mount(root: &Path) {
        fs::create_dir_all(root.join(META_DIR)).unwrap();
        fs::write(root.join(SB_RELPATH), b"sb-bytes").unwrap();
        fs::write(root.join(LOG_RELPATH), b"log-bytes").unwrap();
    }

    #[test]
    fn walks_up_from_nested_path() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("mnt");
        fake_mount(&mount);
        let nested = mount.join("a/b/c");
        fs::create_dir_all(&nested).unwrap();

        let meta = open_log(&nested, false).unwrap();
        assert_eq!(meta.mount, mount.canonicalize().unwrap());
        assert_eq!(meta.size, 9);

        let sb = open_superblock(&nested, false).unwrap();
        assert_eq!(sb.mount, meta.mount);
        assert_eq!(sb.size, 8);
    }

    #[test]
    fn resolves_from_a_file_inside_the_mount() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("mnt");
        fake_mount(&mount);
        let file_path = mount.join("data.bin");
        fs::write(&file_path, b"x").unwrap();

        let meta = open_log(&file_path, false).unwrap();
        assert_eq!(meta.mount, mount.canonicalize().unwrap());
    }

    #[test]
    fn stops_at_root_when_no_meta_exists() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_log(dir.path(), false).unwrap_err();
        assert!(matches!(err, FamfsError::NotFamfs(_)));
    }

    #[test]
    fn nonexistent_start_path_gives_up() {
        let err = open_log(Path::new("/no/such/famfs/path"), false).unwrap_err();
        assert!(matches!(err, FamfsError::NotFamfs(_)));
    }

    #[test]
    fn meta_entry_must_be_a_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("mnt");
        // .meta/.log exists but is a directory; the walk must not stop here.
        fs::create_dir_all(mount.join(LOG_RELPATH)).unwrap();
        assert!(open_log(&mount, false).is_err());
    }

    #[test]
    fn writable_open_honors_request() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("mnt");
        fake_mount(&mount);

        let mut meta = open_log(&mount, true).unwrap();
        meta.file.write_all(b"!").unwrap();
    }

    #[test]
    fn relpath_strips_the_mount_prefix() {
        let mount = Path::new("/mnt/famfs");
        assert_eq!(
            relpath_within(mount, Path::new("/mnt/famfs/d/file")).unwrap(),
            "d/file"
        );
        assert!(matches!(
            relpath_within(mount, Path::new("/elsewhere/file")),
            Err(FamfsError::PathNotInMount { .. })
        ));
        assert!(matches!(
            relpath_within(mount, mount),
            Err(FamfsError::PathNotInMount { .. })
        ));
    }
}
