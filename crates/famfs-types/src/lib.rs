#![forbid(unsafe_code)]
//! Core types shared across the famfs workspace.
//!
//! Famfs metadata lives in a fixed little-endian layout on a DAX device.
//! This crate provides the layout constants, the unit-carrying wrapper
//! types, the bounds-checked byte codec helpers that every on-media
//! parser/encoder is built from, and the extent type that flows from the
//! allocator through the log into the kernel map ioctl.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Allocation unit: every extent offset and length is a multiple of this.
pub const FAMFS_ALLOC_UNIT: u64 = 0x20_0000; // 2 MiB

/// Device region reserved for the superblock (the struct itself is smaller).
pub const FAMFS_SUPERBLOCK_SIZE: u64 = 0x20_0000;

/// Byte offset of the log region; fixed for all filesystems of this version.
pub const FAMFS_LOG_OFFSET: u64 = FAMFS_SUPERBLOCK_SIZE;

/// Length of the log region in bytes.
pub const FAMFS_LOG_LEN: u64 = 0x80_0000; // 8 MiB

/// "!FAMFSSB" in little-endian payload.
pub const FAMFS_SUPER_MAGIC: u64 = 0x4253_5346_4D41_4621;

/// "!FAMFSLG" in little-endian payload.
pub const FAMFS_LOG_MAGIC: u64 = 0x474C_5346_4D41_4621;

/// Current on-media format version.
pub const FAMFS_FORMAT_VERSION: u32 = 1;

/// Maximum length of a log-entry relative path, including the NUL pad.
pub const FAMFS_MAX_PATHLEN: usize = 80;

/// Maximum number of inline extents in one file-create log entry.
pub const FAMFS_MAX_EXTENTS: usize = 8;

/// Maximum number of device descriptors in the superblock table.
pub const FAMFS_MAX_DAXDEVS: usize = 16;

/// Maximum length of a device path string in a superblock descriptor.
pub const FAMFS_DEVNAME_LEN: usize = 64;

/// Bytes of device implicitly allocated to metadata (superblock + log).
#[must_use]
pub fn reserved_prefix(log_offset: u64, log_len: u64) -> u64 {
    log_offset.saturating_add(log_len)
}

// ── Unit-carrying wrappers ──────────────────────────────────────────────────

/// Byte offset on the primary DAX device (offset 0 is the superblock).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Index of the allocation unit containing this offset (truncating).
    #[must_use]
    pub fn au(self) -> AuIndex {
        AuIndex(self.0 / FAMFS_ALLOC_UNIT)
    }

    /// Whether this offset is a multiple of the allocation unit.
    #[must_use]
    pub fn is_au_aligned(self) -> bool {
        self.0 % FAMFS_ALLOC_UNIT == 0
    }
}

/// Index of an allocation unit on the primary device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AuIndex(pub u64);

impl AuIndex {
    /// Byte offset of the start of this allocation unit.
    ///
    /// Returns `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self) -> Option<ByteOffset> {
        self.0.checked_mul(FAMFS_ALLOC_UNIT).map(ByteOffset)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AuIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Extents ─────────────────────────────────────────────────────────────────

/// Contiguous byte range on the primary device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub offset: u64,
    pub len: u64,
}

impl Extent {
    #[must_use]
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// One-past-the-end byte offset, `None` on overflow.
    #[must_use]
    pub fn end(self) -> Option<u64> {
        self.offset.checked_add(self.len)
    }

    /// Whether both offset and length are allocation-unit multiples.
    #[must_use]
    pub fn is_au_aligned(self) -> bool {
        self.offset % FAMFS_ALLOC_UNIT == 0 && self.len % FAMFS_ALLOC_UNIT == 0
    }

    /// First AU index and AU count spanned by this extent.
    ///
    /// The count rounds the length up, so a partial trailing unit is
    /// counted whole.
    #[must_use]
    pub fn au_span(self) -> (u64, u64) {
        (
            self.offset / FAMFS_ALLOC_UNIT,
            self.len.div_ceil(FAMFS_ALLOC_UNIT),
        )
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, +{:#x})", self.offset, self.len)
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Bounds-checked byte codec helpers ───────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(
    data: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_fixed<const N: usize>(
    data: &mut [u8],
    offset: usize,
    value: &[u8; N],
) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, N)?.copy_from_slice(value);
    Ok(())
}

/// Decode a NUL-padded fixed-width string field.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// Encode `value` into a NUL-padded field of width `width` at `offset`.
///
/// Fails if the string (without its terminator) does not fit.
pub fn write_nul_padded(
    data: &mut [u8],
    offset: usize,
    width: usize,
    value: &str,
    field: &'static str,
) -> Result<(), ParseError> {
    let bytes = value.as_bytes();
    if bytes.len() >= width {
        return Err(ParseError::InvalidField {
            field,
            reason: "string too long for field",
        });
    }
    let slot = ensure_slice_mut(data, offset, width)?;
    slot.fill(0);
    slot[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

// ── Alignment math ──────────────────────────────────────────────────────────

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Round a byte size up to a whole number of allocation units.
///
/// Returns `None` on overflow.
#[must_use]
pub fn round_to_alloc_unit(size: u64) -> Option<u64> {
    align_up(size, FAMFS_ALLOC_UNIT)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_constants_are_ascii_tags() {
        assert_eq!(FAMFS_SUPER_MAGIC, u64::from_le_bytes(*b"!FAMFSSB"));
        assert_eq!(FAMFS_LOG_MAGIC, u64::from_le_bytes(*b"!FAMFSLG"));
    }

    #[test]
    fn layout_constants_are_au_aligned() {
        assert_eq!(FAMFS_SUPERBLOCK_SIZE % FAMFS_ALLOC_UNIT, 0);
        assert_eq!(FAMFS_LOG_OFFSET % FAMFS_ALLOC_UNIT, 0);
        assert_eq!(FAMFS_LOG_LEN % FAMFS_ALLOC_UNIT, 0);
        assert_eq!(
            reserved_prefix(FAMFS_LOG_OFFSET, FAMFS_LOG_LEN),
            FAMFS_LOG_OFFSET + FAMFS_LOG_LEN
        );
    }

    #[test]
    fn read_write_helpers_round_trip() {
        let mut buf = [0_u8; 16];
        write_le_u16(&mut buf, 0, 0x1234).unwrap();
        write_le_u32(&mut buf, 2, 0x5678_9ABC).unwrap();
        write_le_u64(&mut buf, 6, 0xDEAD_BEEF_CAFE_F00D).unwrap();
        assert_eq!(read_le_u16(&buf, 0).unwrap(), 0x1234);
        assert_eq!(read_le_u32(&buf, 2).unwrap(), 0x5678_9ABC);
        assert_eq!(read_le_u64(&buf, 6).unwrap(), 0xDEAD_BEEF_CAFE_F00D);
    }

    #[test]
    fn read_past_end_is_rejected() {
        let buf = [0_u8; 4];
        assert!(matches!(
            read_le_u64(&buf, 0),
            Err(ParseError::InsufficientData { needed: 8, .. })
        ));
        assert!(read_le_u32(&buf, 1).is_err());
        assert!(ensure_slice(&buf, usize::MAX, 2).is_err());
    }

    #[test]
    fn nul_padded_round_trip() {
        let mut buf = [0xFF_u8; 80];
        write_nul_padded(&mut buf, 0, 80, "dir/file.dat", "relpath").unwrap();
        assert_eq!(trim_nul_padded(&buf), "dir/file.dat");
        // Exactly width-1 bytes fits; width bytes does not.
        let long = "x".repeat(79);
        assert!(write_nul_padded(&mut buf, 0, 80, &long, "relpath").is_ok());
        let too_long = "x".repeat(80);
        assert!(write_nul_padded(&mut buf, 0, 80, &too_long, "relpath").is_err());
    }

    #[test]
    fn extent_au_span() {
        let au = FAMFS_ALLOC_UNIT;
        let e = Extent::new(3 * au, 2 * au);
        assert!(e.is_au_aligned());
        assert_eq!(e.au_span(), (3, 2));
        assert_eq!(e.end(), Some(5 * au));

        // Unaligned length still counts the trailing partial unit.
        let partial = Extent::new(4 * au, au + 1);
        assert_eq!(partial.au_span(), (4, 2));
        assert!(!partial.is_au_aligned());

        let overflow = Extent::new(u64::MAX, 1);
        assert_eq!(overflow.end(), None);
    }

    #[test]
    fn byte_offset_au_conversions() {
        let off = ByteOffset(5 * FAMFS_ALLOC_UNIT + 17);
        assert_eq!(off.au(), AuIndex(5));
        assert!(!off.is_au_aligned());
        assert_eq!(AuIndex(5).to_byte_offset(), Some(ByteOffset(5 * FAMFS_ALLOC_UNIT)));
        assert_eq!(AuIndex(u64::MAX).to_byte_offset(), None);
    }

    #[test]
    fn alignment_math() {
        assert_eq!(align_down(4097, 4096), Some(4096));
        assert_eq!(align_up(4097, 4096), Some(8192));
        assert_eq!(align_up(0, 4096), Some(0));
        assert_eq!(align_up(u64::MAX, 4096), None);
        assert_eq!(align_down(100, 3), None);
        assert_eq!(round_to_alloc_unit(1), Some(FAMFS_ALLOC_UNIT));
        assert_eq!(
            round_to_alloc_unit(FAMFS_ALLOC_UNIT),
            Some(FAMFS_ALLOC_UNIT)
        );
        assert_eq!(
            round_to_alloc_unit(FAMFS_ALLOC_UNIT + 1),
            Some(2 * FAMFS_ALLOC_UNIT)
        );
    }
}
