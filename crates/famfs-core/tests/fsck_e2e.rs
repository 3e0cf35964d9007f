#![forbid(unsafe_code)]
//! fsck against deliberately damaged images.

use famfs_core::{MapMode, RawMedia};
use famfs_ondisk::{FC_ALL_HOSTS_RW, FileCreate, LogEntryBody, append_entry};
use famfs_types::{Extent, FAMFS_ALLOC_UNIT};
use std::fs;
use std::path::PathBuf;

const AU: u64 = FAMFS_ALLOC_UNIT;
const DEV_SIZE: u64 = 32 * AU;

fn fresh_image() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("dax.img");
    let file = fs::File::create(&image).unwrap();
    file.set_len(DEV_SIZE).unwrap();
    famfs_core::mkfs(&image, false).unwrap();
    (dir, image)
}

fn append_file_entry(image: &PathBuf, relpath: &str, size: u64, extent: Extent) {
    let mut media = RawMedia::map(image, MapMode::ReadWrite).unwrap();
    append_entry(
        media.log_mut().unwrap(),
        &LogEntryBody::FileCreate(FileCreate {
            relpath: relpath.to_owned(),
            size,
            flags: FC_ALL_HOSTS_RW,
            mode: 0o644,
            uid: 0,
            gid: 0,
            extents: vec![extent],
        }),
    )
    .unwrap();
    media.flush().unwrap();
}

#[test]
fn overlapping_extents_are_reported_as_collisions() {
    let (_dir, image) = fresh_image();

    // Two files whose extents overlap by exactly one allocation unit.
    append_file_entry(&image, "one", 2 * AU, Extent::new(6 * AU, 2 * AU));
    append_file_entry(&image, "two", 2 * AU, Extent::new(7 * AU, 2 * AU));

    let report = famfs_core::fsck(&image).unwrap();
    assert_eq!(report.alloc_errors(), 1);
    assert_eq!(report.log.entries_in_use, 2);
    // The collided unit counts once toward the allocation total.
    assert_eq!(report.bitmap.alloc_total, 3 * AU);
}

#[test]
fn disjoint_extents_are_clean() {
    let (_dir, image) = fresh_image();
    append_file_entry(&image, "one", AU, Extent::new(6 * AU, AU));
    append_file_entry(&image, "two", AU, Extent::new(9 * AU, AU));

    let report = famfs_core::fsck(&image).unwrap();
    assert_eq!(report.alloc_errors(), 0);
    assert_eq!(report.bitmap.alloc_total, 2 * AU);
    assert_eq!(report.bitmap.size_total, 2 * AU);
}

#[test]
fn extent_beyond_device_counts_as_error() {
    let (_dir, image) = fresh_image();
    append_file_entry(&image, "beyond", AU, Extent::new(31 * AU, 2 * AU));

    let report = famfs_core::fsck(&image).unwrap();
    assert_eq!(report.alloc_errors(), 1);
}

#[test]
fn corrupt_log_magic_fails_the_scan() {
    let (_dir, image) = fresh_image();
    {
        let mut media = RawMedia::map(&image, MapMode::ReadWrite).unwrap();
        media.log_mut().unwrap()[0] ^= 0xFF;
        media.flush().unwrap();
    }
    assert!(matches!(
        famfs_core::fsck(&image),
        Err(famfs_error::FamfsError::LogCorrupt(_))
    ));
}

#[test]
fn unformatted_image_is_not_famfs() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("blank.img");
    let file = fs::File::create(&image).unwrap();
    file.set_len(DEV_SIZE).unwrap();

    // No magic, so the path is treated as a file inside a (nonexistent)
    // mount and the resolver gives up.
    assert!(famfs_core::fsck(&image).is_err());
}

#[test]
fn fsck_by_device_and_by_mount_agree() {
    let (_dir, image) = fresh_image();
    append_file_entry(&image, "f", AU - 7, Extent::new(8 * AU, AU));

    let by_device = famfs_core::fsck(&image).unwrap();

    // Expose the same metadata through meta files and re-scan by path.
    let mount = _dir.path().join("mnt");
    fs::create_dir(&mount).unwrap();
    let kernel = famfs_ioctl::MockKernel::rooted(&mount).with_backing(&image);
    famfs_core::mkmeta_at(&image, &mount, &kernel).unwrap();
    let by_mount = famfs_core::fsck(&mount).unwrap();

    assert_eq!(by_device.log.entries_in_use, by_mount.log.entries_in_use);
    assert_eq!(by_device.bitmap, by_mount.bitmap);
    assert_eq!(by_device.uuid_string(), by_mount.uuid_string());
}
