#![forbid(unsafe_code)]
//! Space accounting and allocation.
//!
//! Famfs keeps no persistent free list. The allocation state is a pure
//! function of the log: scan every file-create record, mark the
//! allocation units its extents claim, and allocate first-fit out of
//! whatever remains. The bitmap is rebuilt for every allocation and
//! thrown away afterwards; it is never shared and never persisted.
//!
//! The builder doubles as the fsck core loop: a bit that is already set
//! when a second extent claims it is an allocation collision, the
//! canonical corrupted-allocation signal.

use famfs_error::{FamfsError, Result};
use famfs_ondisk::{LogEntryBody, LogEntryIter};
use famfs_types::FAMFS_ALLOC_UNIT;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ── Bitmap primitive ────────────────────────────────────────────────────────

/// Densely packed bit array over allocation units.
///
/// No internal locking; callers provide ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: Vec<u8>,
    nbits: u64,
}

impl Bitmap {
    /// Create a zeroed bitmap over `nbits` bits.
    #[must_use]
    pub fn new(nbits: u64) -> Self {
        let nbytes = usize::try_from(nbits.div_ceil(8)).expect("bitmap size fits memory");
        Self {
            bits: vec![0_u8; nbytes],
            nbits,
        }
    }

    /// Number of bits in the map.
    #[must_use]
    pub fn nbits(&self) -> u64 {
        self.nbits
    }

    /// Get bit `idx`; out-of-range reads as set so nothing is ever
    /// allocated past the end of the device.
    #[must_use]
    pub fn test(&self, idx: u64) -> bool {
        if idx >= self.nbits {
            return true;
        }
        let byte = (idx / 8) as usize;
        let bit = idx % 8;
        (self.bits[byte] >> bit) & 1 == 1
    }

    /// Set bit `idx`; out-of-range is ignored.
    pub fn set(&mut self, idx: u64) {
        if idx >= self.nbits {
            return;
        }
        let byte = (idx / 8) as usize;
        let bit = idx % 8;
        self.bits[byte] |= 1 << bit;
    }

    /// Set bit `idx` and report whether it was already set.
    ///
    /// Out-of-range reports as already set.
    pub fn test_and_set(&mut self, idx: u64) -> bool {
        let was_set = self.test(idx);
        self.set(idx);
        was_set
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_set(&self) -> u64 {
        self.bits.iter().map(|b| u64::from(b.count_ones())).sum()
    }
}

// ── Bitmap builder ──────────────────────────────────────────────────────────

/// Counters produced while scanning the log into a bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BitmapReport {
    /// Times a file-create extent claimed an allocation unit that was
    /// already claimed (or lies outside the device).
    pub alloc_errors: u64,
    /// Sum of declared file sizes.
    pub size_total: u64,
    /// Sum of allocation-unit bytes claimed, counting each unit once.
    pub alloc_total: u64,
    /// Number of bits in the produced bitmap.
    pub bitmap_bits: u64,
    /// Entries of reserved or unrecognized kind.
    pub invalid_entries: u64,
}

impl BitmapReport {
    /// `alloc_total / size_total`; how much device space the log claims
    /// per byte of declared file content.
    #[must_use]
    pub fn space_amplification(&self) -> Option<f64> {
        if self.size_total == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)] // diagnostic ratio only
        Some(self.alloc_total as f64 / self.size_total as f64)
    }
}

/// Walk the log and produce the allocation bitmap plus its counters.
///
/// Deterministic: equal log bytes and geometry yield an equal bitmap and
/// equal counters. The bitmap covers every allocation unit of the
/// primary device (absolute indexing: bit `i` is device bytes
/// `[i*AU, (i+1)*AU)`), with the metadata prefix pre-marked because the
/// superblock and log never appear in any log entry.
pub fn build_bitmap(
    log: &[u8],
    device_size: u64,
    log_offset: u64,
    log_len: u64,
) -> Result<(Bitmap, BitmapReport)> {
    let nbits = device_size.div_ceil(FAMFS_ALLOC_UNIT);
    let mut bitmap = Bitmap::new(nbits);
    let mut report = BitmapReport {
        bitmap_bits: nbits,
        ..BitmapReport::default()
    };

    // Superblock and log are implicitly allocated.
    let reserved_aus = (log_offset + log_len).div_ceil(FAMFS_ALLOC_UNIT);
    for au in 0..reserved_aus {
        bitmap.set(au);
    }

    for entry in LogEntryIter::new(log)? {
        let entry = entry?;
        match entry.body {
            LogEntryBody::FileCreate(fc) => {
                report.size_total += fc.size;
                for ext in &fc.extents {
                    let (first_au, n_aus) = ext.au_span();
                    for au in first_au..first_au + n_aus {
                        if au >= nbits {
                            warn!(index = entry.index, au, "extent past end of device");
                            report.alloc_errors += 1;
                            continue;
                        }
                        if bitmap.test_and_set(au) {
                            report.alloc_errors += 1;
                        } else {
                            // Double allocations are not counted twice.
                            report.alloc_total += FAMFS_ALLOC_UNIT;
                        }
                    }
                }
            }
            // Directories consume no space.
            LogEntryBody::Mkdir(_) => {}
            LogEntryBody::Unknown { kind } => {
                warn!(index = entry.index, kind, "invalid log entry");
                report.invalid_entries += 1;
            }
        }
    }

    debug!(
        bits = nbits,
        set = bitmap.count_set(),
        errors = report.alloc_errors,
        "built allocation bitmap"
    );
    Ok((bitmap, report))
}

// ── First-fit allocator ─────────────────────────────────────────────────────

/// Allocate `size` bytes of contiguous allocation units, first-fit.
///
/// Returns the byte offset of the allocation. The offset is always a
/// non-zero allocation-unit multiple: unit 0 holds the superblock and is
/// pre-marked in every bitmap the builder produces. On failure the
/// bitmap is unchanged.
pub fn alloc_contiguous(bitmap: &mut Bitmap, size: u64) -> Result<u64> {
    if size == 0 {
        return Err(FamfsError::InvalidArg("allocation size is zero".to_owned()));
    }
    let want = size.div_ceil(FAMFS_ALLOC_UNIT);
    let nbits = bitmap.nbits();

    let mut i = 0_u64;
    'scan: while i < nbits {
        if bitmap.test(i) {
            i += 1;
            continue;
        }
        if want > nbits - i {
            // Not enough room left anywhere.
            break;
        }
        for j in i..i + want {
            if bitmap.test(j) {
                i = j + 1;
                continue 'scan;
            }
        }
        for j in i..i + want {
            bitmap.set(j);
        }
        let offset = i * FAMFS_ALLOC_UNIT;
        debug!(offset, aus = want, "allocated extent");
        return Ok(offset);
    }

    Err(FamfsError::OutOfSpace { requested: size })
}
