#![deny(unsafe_code)]
//! famfs user-space control plane.
//!
//! Famfs is a shared-memory filesystem for DAX devices: every host maps
//! the same device and sees the same files. The kernel driver provides
//! the VFS surface; this crate is the metadata engine behind it: the
//! on-media superblock and log, the replay that rebuilds the namespace
//! at mount time, the log-derived allocator, and the operations that
//! tie them to kernel inodes.
//!
//! The library holds no global state: every operation starts from a
//! path, resolves its mount, and maps what it needs for exactly as long
//! as it needs it. The only `unsafe` in the crate is the pair of
//! memory-map constructors in [`media`]; the kernel ioctl surface lives
//! behind the [`famfs_ioctl::KernelAdapter`] trait so the whole control
//! plane runs against ordinary directories in tests.

pub mod device;
pub mod fsck;
pub mod media;
pub mod mounts;
pub mod ops;
pub mod replay;
pub mod resolve;
pub mod verify;

pub use device::device_size;
pub use fsck::{FsckReport, LogInfo, fsck};
pub use media::{FileMap, MapMode, RawMedia};
pub use mounts::famfs_mount_of_device;
pub use ops::{cp, file_create, kill_superblock, mkdir, mkfile, mkfs, mkmeta, mkmeta_at};
pub use replay::{ReplayMode, ReplayStats, replay_log, replay_shadow};
pub use resolve::{LOG_RELPATH, META_DIR, SB_RELPATH, open_log, open_superblock};
pub use verify::{fill_seeded, verify_seeded};
