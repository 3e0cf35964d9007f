//! Kernel interface boundary.
//!
//! Everything the library asks of the famfs kernel driver goes through
//! the [`KernelAdapter`] trait: the NOP probe that answers "is this fd
//! on a famfs mount?", and `MAP_CREATE`, which irreversibly binds a set
//! of device extents to a freshly created inode. [`DaxKernel`] issues
//! the real ioctls; [`MockKernel`] records calls so the whole control
//! plane can be exercised against ordinary directories in tests.
//!
//! The raw `ioctl(2)` and `mount(2)` invocations live here and nowhere
//! else; the rest of the workspace touches the kernel only through the
//! trait.

use famfs_error::{FamfsError, Result};
use famfs_types::Extent;
use parking_lot::Mutex;
use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

// ── ioctl ABI ───────────────────────────────────────────────────────────────

const IOC_NONE: u64 = 0;
const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, ty: u8, nr: u8, size: usize) -> u64 {
    (dir << 30) | ((size as u64) << 16) | ((ty as u64) << 8) | nr as u64
}

/// Wire form of one extent handed to the kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IocExtent {
    pub offset: u64,
    pub len: u64,
}

/// Payload of the `MAP_CREATE` ioctl.
#[repr(C)]
#[derive(Debug)]
pub struct IocMap {
    pub extent_type: u32,
    pub file_type: u32,
    pub file_size: u64,
    pub ext_list_count: u64,
    pub ext_list: *const IocExtent,
}

/// Binds an extent list to a file; the file's size and backing are
/// frozen afterwards.
pub const FAMFSIOC_MAP_CREATE: u64 =
    ioc(IOC_READ | IOC_WRITE, b'b', 1, std::mem::size_of::<IocMap>());

/// Returns 0 iff the fd lives on a famfs mount.
pub const FAMFSIOC_NOP: u64 = ioc(IOC_NONE, b'b', 2, 0);

/// Extent addressing scheme; only FS-DAX extents exist today.
pub const FSDAX_EXTENT: u32 = 1;

/// Role of the file being bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// The `.meta/.superblock` file.
    Superblock,
    /// The `.meta/.log` file.
    Log,
    /// An ordinary user file.
    Regular,
}

impl FileType {
    #[must_use]
    pub fn as_wire(self) -> u32 {
        match self {
            Self::Superblock => 0,
            Self::Log => 1,
            Self::Regular => 2,
        }
    }
}

/// Everything `MAP_CREATE` needs besides the fd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapCreateSpec {
    pub file_type: FileType,
    pub file_size: u64,
    pub extents: Vec<Extent>,
}

// ── Kernel adapter ──────────────────────────────────────────────────────────

/// The famfs kernel driver as the library sees it.
pub trait KernelAdapter {
    /// Whether the open file lives on a famfs mount (NOP ioctl).
    fn is_famfs(&self, file: &File) -> bool;

    /// Bind `spec.extents` to `file`. `path` is diagnostic only.
    fn map_create(&self, file: &File, path: &Path, spec: &MapCreateSpec) -> Result<()>;
}

/// Real kernel adapter issuing ioctls against the famfs driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct DaxKernel;

impl KernelAdapter for DaxKernel {
    fn is_famfs(&self, file: &File) -> bool {
        // SAFETY: NOP takes no argument and only inspects the fd.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), FAMFSIOC_NOP as libc::c_ulong) };
        rc == 0
    }

    fn map_create(&self, file: &File, path: &Path, spec: &MapCreateSpec) -> Result<()> {
        let wire_extents: Vec<IocExtent> = spec
            .extents
            .iter()
            .map(|e| IocExtent {
                offset: e.offset,
                len: e.len,
            })
            .collect();

        let payload = IocMap {
            extent_type: FSDAX_EXTENT,
            file_type: spec.file_type.as_wire(),
            file_size: spec.file_size,
            ext_list_count: wire_extents.len() as u64,
            ext_list: wire_extents.as_ptr(),
        };

        // SAFETY: payload and the extent list outlive the call; the
        // kernel copies both before returning.
        let rc = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                FAMFSIOC_MAP_CREATE as libc::c_ulong,
                &payload,
            )
        };
        if rc != 0 {
            let source = std::io::Error::last_os_error();
            error!(path = %path.display(), %source, "MAP_CREATE failed");
            return Err(FamfsError::Ioctl {
                op: "MAP_CREATE",
                source,
            });
        }
        debug!(
            path = %path.display(),
            extents = spec.extents.len(),
            size = spec.file_size,
            "bound extents"
        );
        Ok(())
    }
}

// ── Mock adapter ────────────────────────────────────────────────────────────

/// One recorded `MAP_CREATE` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMap {
    pub path: PathBuf,
    pub spec: MapCreateSpec,
}

/// Recording kernel adapter for tests.
///
/// A rooted mock treats files under its root directory as famfs-resident
/// (resolved through `/proc/self/fd`); an accepting mock treats every
/// file that way. `map_create` is recorded instead of issued, and the
/// kernel's observable effects are emulated: the file's length is frozen
/// at `file_size`, and when a backing image is configured the extent
/// bytes are copied in so reads through the "bound" file see the device
/// content.
#[derive(Debug, Default)]
pub struct MockKernel {
    root: Option<PathBuf>,
    backing: Option<PathBuf>,
    maps: Mutex<Vec<RecordedMap>>,
}

impl MockKernel {
    /// Mock that says yes to every fd.
    #[must_use]
    pub fn accepting() -> Self {
        Self::default()
    }

    /// Mock that only recognizes files under `root`.
    ///
    /// The root is canonicalized so it compares equal to the paths
    /// `/proc/self/fd` resolves to.
    #[must_use]
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self {
            root: Some(root),
            backing: None,
            maps: Mutex::new(Vec::new()),
        }
    }

    /// Serve `map_create` reads out of `device`: each bound extent's
    /// bytes are copied from the image into the target file.
    #[must_use]
    pub fn with_backing(mut self, device: impl Into<PathBuf>) -> Self {
        self.backing = Some(device.into());
        self
    }

    /// Snapshot of the recorded `MAP_CREATE` calls, in order.
    #[must_use]
    pub fn maps(&self) -> Vec<RecordedMap> {
        self.maps.lock().clone()
    }

    fn fd_path(file: &File) -> Option<PathBuf> {
        std::fs::read_link(format!("/proc/self/fd/{}", file.as_raw_fd())).ok()
    }
}

impl KernelAdapter for MockKernel {
    fn is_famfs(&self, file: &File) -> bool {
        match &self.root {
            None => true,
            Some(root) => Self::fd_path(file).is_some_and(|p| p.starts_with(root)),
        }
    }

    fn map_create(&self, file: &File, path: &Path, spec: &MapCreateSpec) -> Result<()> {
        use std::os::unix::fs::FileExt;

        if !self.is_famfs(file) {
            return Err(FamfsError::NotFamfs(path.to_path_buf()));
        }

        if let Some(backing) = &self.backing {
            let device = File::open(backing)?;
            let mut file_off = 0_u64;
            let mut remaining = spec.file_size;
            for ext in &spec.extents {
                let take = ext.len.min(remaining);
                let mut buf = vec![0_u8; take as usize];
                device.read_exact_at(&mut buf, ext.offset)?;
                file.write_all_at(&buf, file_off)?;
                file_off += take;
                remaining -= take;
            }
        }
        // The real driver freezes the inode size at bind time.
        file.set_len(spec.file_size)?;

        self.maps.lock().push(RecordedMap {
            path: path.to_path_buf(),
            spec: spec.clone(),
        });
        Ok(())
    }
}

// ── mount(2) shim ───────────────────────────────────────────────────────────

/// Mount `device` at `mountpoint` with filesystem type `famfs`.
pub fn mount_famfs(device: &Path, mountpoint: &Path) -> Result<()> {
    let dev = path_to_cstring(device)?;
    let mpt = path_to_cstring(mountpoint)?;
    let fstype = CString::new("famfs").expect("static fstype");

    // SAFETY: all three strings are NUL-terminated and outlive the call;
    // no mount data is passed.
    let rc = unsafe {
        libc::mount(
            dev.as_ptr(),
            mpt.as_ptr(),
            fstype.as_ptr(),
            0,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(FamfsError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| FamfsError::InvalidArg(format!("path contains NUL: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_numbers_encode_direction_and_type() {
        // NOP carries no payload.
        assert_eq!(FAMFSIOC_NOP, (u64::from(b'b') << 8) | 2);
        // MAP_CREATE is read/write with the payload size in bits 16..30.
        assert_eq!(FAMFSIOC_MAP_CREATE >> 30, IOC_READ | IOC_WRITE);
        assert_eq!(
            (FAMFSIOC_MAP_CREATE >> 16) & 0x3FFF,
            std::mem::size_of::<IocMap>() as u64
        );
        assert_eq!((FAMFSIOC_MAP_CREATE >> 8) & 0xFF, u64::from(b'b'));
    }

    #[test]
    fn wire_extent_layout_is_fixed() {
        assert_eq!(std::mem::size_of::<IocExtent>(), 16);
    }

    #[test]
    fn accepting_mock_accepts_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let file = File::create(&path).unwrap();

        let kernel = MockKernel::accepting();
        assert!(kernel.is_famfs(&file));
        kernel
            .map_create(
                &file,
                &path,
                &MapCreateSpec {
                    file_type: FileType::Regular,
                    file_size: 4096,
                    extents: vec![Extent::new(0x20_0000, 0x20_0000)],
                },
            )
            .unwrap();

        let maps = kernel.maps();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].spec.file_size, 4096);
        assert!(maps[0].path.ends_with("f"));
    }

    #[test]
    fn rooted_mock_rejects_foreign_files() {
        let inside = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();

        let kernel = MockKernel::rooted(inside.path());

        let ours = File::create(inside.path().join("a")).unwrap();
        assert!(kernel.is_famfs(&ours));

        let foreign_path = outside.path().join("b");
        let foreign = File::create(&foreign_path).unwrap();
        assert!(!kernel.is_famfs(&foreign));

        let err = kernel
            .map_create(
                &foreign,
                &foreign_path,
                &MapCreateSpec {
                    file_type: FileType::Regular,
                    file_size: 1,
                    extents: vec![Extent::new(0x20_0000, 0x20_0000)],
                },
            )
            .unwrap_err();
        assert!(matches!(err, FamfsError::NotFamfs(_)));
        assert!(kernel.maps().is_empty());
    }

    #[test]
    fn file_type_wire_values_are_stable() {
        assert_eq!(FileType::Superblock.as_wire(), 0);
        assert_eq!(FileType::Log.as_wire(), 1);
        assert_eq!(FileType::Regular.as_wire(), 2);
    }
}
