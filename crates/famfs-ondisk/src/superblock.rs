#![forbid(unsafe_code)]
//! Superblock parsing and encoding.
//!
//! Field offsets are part of the on-media contract and never move within
//! a format version. The CRC slot is declared but written as zero and is
//! not validated in this version.

use famfs_types::{
    FAMFS_ALLOC_UNIT, FAMFS_DEVNAME_LEN, FAMFS_FORMAT_VERSION, FAMFS_LOG_LEN, FAMFS_LOG_OFFSET,
    FAMFS_MAX_DAXDEVS, FAMFS_SUPER_MAGIC, ParseError, read_fixed, read_le_u32, read_le_u64,
    reserved_prefix, trim_nul_padded, write_fixed, write_le_u32, write_le_u64, write_nul_padded,
};
use serde::{Deserialize, Serialize};

const OFF_MAGIC: usize = 0x00;
const OFF_VERSION: usize = 0x08;
const OFF_FLAGS: usize = 0x0C;
const OFF_UUID: usize = 0x10;
const OFF_CRC: usize = 0x20;
const OFF_NUM_DAXDEVS: usize = 0x24;
const OFF_LOG_OFFSET: usize = 0x28;
const OFF_LOG_LEN: usize = 0x30;
const OFF_DEVLIST: usize = 0x38;

const DAXDEV_DESC_SIZE: usize = 0x50;
const DESC_OFF_SIZE: usize = 0x00;
const DESC_OFF_PATH: usize = 0x08;

/// Bytes occupied by the encoded superblock struct (the reserved region
/// on media is larger).
pub const SUPERBLOCK_STRUCT_SIZE: usize = OFF_DEVLIST + FAMFS_MAX_DAXDEVS * DAXDEV_DESC_SIZE;

/// One entry of the superblock's device table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaxDevice {
    pub path: String,
    pub size: u64,
}

/// Parsed, validated superblock view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub version: u32,
    pub flags: u32,
    pub uuid: [u8; 16],
    pub crc: u32,
    pub log_offset: u64,
    pub log_len: u64,
    pub devices: Vec<DaxDevice>,
}

impl Superblock {
    /// Build a fresh superblock for a single-device filesystem (mkfs).
    #[must_use]
    pub fn new(uuid: [u8; 16], device_path: &str, device_size: u64) -> Self {
        Self {
            version: FAMFS_FORMAT_VERSION,
            flags: 0,
            uuid,
            crc: 0,
            log_offset: FAMFS_LOG_OFFSET,
            log_len: FAMFS_LOG_LEN,
            devices: vec![DaxDevice {
                path: device_path.to_owned(),
                size: device_size,
            }],
        }
    }

    /// Parse and validate a superblock from a mapped region.
    ///
    /// Checks the magic and structural sanity: device count bounds, log
    /// geometry alignment, and that the primary device covers the
    /// metadata prefix. The CRC field is read but deliberately not
    /// verified.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u64(region, OFF_MAGIC)?;
        if magic != FAMFS_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: FAMFS_SUPER_MAGIC,
                actual: magic,
            });
        }

        let num_daxdevs = read_le_u32(region, OFF_NUM_DAXDEVS)?;
        if num_daxdevs == 0 || num_daxdevs as usize > FAMFS_MAX_DAXDEVS {
            return Err(ParseError::InvalidField {
                field: "num_daxdevs",
                reason: "device count out of range",
            });
        }

        let log_offset = read_le_u64(region, OFF_LOG_OFFSET)?;
        let log_len = read_le_u64(region, OFF_LOG_LEN)?;
        if log_offset % FAMFS_ALLOC_UNIT != 0 || log_len % FAMFS_ALLOC_UNIT != 0 || log_len == 0 {
            return Err(ParseError::InvalidField {
                field: "log_geometry",
                reason: "log offset/length must be non-zero allocation-unit multiples",
            });
        }

        let mut devices = Vec::with_capacity(num_daxdevs as usize);
        for i in 0..num_daxdevs as usize {
            let base = OFF_DEVLIST + i * DAXDEV_DESC_SIZE;
            let size = read_le_u64(region, base + DESC_OFF_SIZE)?;
            let path =
                trim_nul_padded(&read_fixed::<FAMFS_DEVNAME_LEN>(region, base + DESC_OFF_PATH)?);
            devices.push(DaxDevice { path, size });
        }

        if devices[0].size < reserved_prefix(log_offset, log_len) {
            return Err(ParseError::InvalidField {
                field: "devlist[0].size",
                reason: "primary device smaller than metadata prefix",
            });
        }

        Ok(Self {
            version: read_le_u32(region, OFF_VERSION)?,
            flags: read_le_u32(region, OFF_FLAGS)?,
            uuid: read_fixed::<16>(region, OFF_UUID)?,
            crc: read_le_u32(region, OFF_CRC)?,
            log_offset,
            log_len,
            devices,
        })
    }

    /// Encode this superblock into a mapped region (mkfs write-side).
    ///
    /// Bytes beyond the struct are left untouched; callers that need a
    /// pristine region zero it first.
    pub fn encode(&self, region: &mut [u8]) -> Result<(), ParseError> {
        if self.devices.is_empty() || self.devices.len() > FAMFS_MAX_DAXDEVS {
            return Err(ParseError::InvalidField {
                field: "num_daxdevs",
                reason: "device count out of range",
            });
        }

        write_le_u64(region, OFF_MAGIC, FAMFS_SUPER_MAGIC)?;
        write_le_u32(region, OFF_VERSION, self.version)?;
        write_le_u32(region, OFF_FLAGS, self.flags)?;
        write_fixed(region, OFF_UUID, &self.uuid)?;
        // CRC is reserved; always written as zero.
        write_le_u32(region, OFF_CRC, 0)?;
        write_le_u32(region, OFF_NUM_DAXDEVS, self.devices.len() as u32)?;
        write_le_u64(region, OFF_LOG_OFFSET, self.log_offset)?;
        write_le_u64(region, OFF_LOG_LEN, self.log_len)?;

        for (i, dev) in self.devices.iter().enumerate() {
            let base = OFF_DEVLIST + i * DAXDEV_DESC_SIZE;
            write_le_u64(region, base + DESC_OFF_SIZE, dev.size)?;
            write_nul_padded(
                region,
                base + DESC_OFF_PATH,
                FAMFS_DEVNAME_LEN,
                &dev.path,
                "devlist.path",
            )?;
        }
        Ok(())
    }

    /// The primary device descriptor (index 0).
    #[must_use]
    pub fn primary(&self) -> &DaxDevice {
        &self.devices[0]
    }

    /// First byte past the metadata prefix; user data starts here.
    #[must_use]
    pub fn data_start(&self) -> u64 {
        reserved_prefix(self.log_offset, self.log_len)
    }
}

/// Quick magic probe without full parsing, for mkfs "already formatted?"
/// checks.
#[must_use]
pub fn has_superblock_magic(region: &[u8]) -> bool {
    matches!(read_le_u64(region, OFF_MAGIC), Ok(magic) if magic == FAMFS_SUPER_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use famfs_types::FAMFS_ALLOC_UNIT;

    fn sample() -> Superblock {
        Superblock::new([0xAB; 16], "/dev/dax0.0", 64 * FAMFS_ALLOC_UNIT)
    }

    #[test]
    fn struct_size_is_stable() {
        assert_eq!(SUPERBLOCK_STRUCT_SIZE, 0x38 + 16 * 0x50);
    }

    #[test]
    fn encode_parse_round_trip() {
        let sb = sample();
        let mut region = vec![0_u8; SUPERBLOCK_STRUCT_SIZE];
        sb.encode(&mut region).unwrap();

        let parsed = Superblock::parse(&region).unwrap();
        assert_eq!(parsed, sb);
        assert_eq!(parsed.primary().path, "/dev/dax0.0");
        assert_eq!(parsed.data_start(), FAMFS_LOG_OFFSET + FAMFS_LOG_LEN);
        assert!(has_superblock_magic(&region));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut region = vec![0_u8; SUPERBLOCK_STRUCT_SIZE];
        sample().encode(&mut region).unwrap();
        region[0] ^= 0xFF;
        assert!(matches!(
            Superblock::parse(&region),
            Err(ParseError::InvalidMagic { .. })
        ));
        assert!(!has_superblock_magic(&region));
    }

    #[test]
    fn undersized_primary_device_is_rejected() {
        let mut sb = sample();
        sb.devices[0].size = FAMFS_LOG_OFFSET + FAMFS_LOG_LEN - FAMFS_ALLOC_UNIT;
        let mut region = vec![0_u8; SUPERBLOCK_STRUCT_SIZE];
        sb.encode(&mut region).unwrap();
        assert!(matches!(
            Superblock::parse(&region),
            Err(ParseError::InvalidField {
                field: "devlist[0].size",
                ..
            })
        ));
    }

    #[test]
    fn device_count_bounds() {
        let mut region = vec![0_u8; SUPERBLOCK_STRUCT_SIZE];
        sample().encode(&mut region).unwrap();
        // Zero devices.
        write_le_u32(&mut region, OFF_NUM_DAXDEVS, 0).unwrap();
        assert!(Superblock::parse(&region).is_err());
        // Too many devices.
        write_le_u32(&mut region, OFF_NUM_DAXDEVS, 17).unwrap();
        assert!(Superblock::parse(&region).is_err());
    }

    #[test]
    fn unaligned_log_geometry_is_rejected() {
        let mut region = vec![0_u8; SUPERBLOCK_STRUCT_SIZE];
        sample().encode(&mut region).unwrap();
        write_le_u64(&mut region, OFF_LOG_OFFSET, FAMFS_LOG_OFFSET + 512).unwrap();
        assert!(Superblock::parse(&region).is_err());
    }

    #[test]
    fn crc_field_is_written_zero_and_ignored() {
        let mut sb = sample();
        sb.crc = 0xDEAD_BEEF;
        let mut region = vec![0_u8; SUPERBLOCK_STRUCT_SIZE];
        sb.encode(&mut region).unwrap();
        let parsed = Superblock::parse(&region).unwrap();
        assert_eq!(parsed.crc, 0);
    }

    #[test]
    fn overlong_device_path_fails_encode() {
        let mut sb = sample();
        sb.devices[0].path = "d".repeat(FAMFS_DEVNAME_LEN);
        let mut region = vec![0_u8; SUPERBLOCK_STRUCT_SIZE];
        assert!(sb.encode(&mut region).is_err());
    }
}
