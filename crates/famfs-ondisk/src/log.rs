#![forbid(unsafe_code)]
//! Append-only log codec.
//!
//! The log region starts with a 64-byte header followed by fixed-stride
//! 256-byte entry slots. `next_index` and `next_seqnum` only ever grow;
//! a slot is immutable once written. Replay and the bitmap builder read
//! entries `0..next_index` in order and treat anything they cannot
//! decode as an invalid entry rather than a fatal error, so one corrupt
//! record never hides the rest of the namespace.

use famfs_error::{FamfsError, Result};
use famfs_types::{
    Extent, FAMFS_LOG_MAGIC, FAMFS_MAX_EXTENTS, FAMFS_MAX_PATHLEN, read_fixed, read_le_u32,
    read_le_u64, trim_nul_padded, u64_to_usize, write_le_u32, write_le_u64, write_nul_padded,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Bytes of log region occupied by the header.
pub const LOG_HEADER_SIZE: usize = 64;

/// Fixed stride of one log entry slot.
pub const LOG_ENTRY_SIZE: usize = 256;

/// File-create entries are readable and writable from every host.
pub const FC_ALL_HOSTS_RW: u32 = 0x2;

const KIND_FILE_CREATE: u32 = 1;
const KIND_MKDIR: u32 = 2;

const HDR_OFF_MAGIC: usize = 0x00;
const HDR_OFF_LOG_LEN: usize = 0x08;
const HDR_OFF_LAST_INDEX: usize = 0x10;
const HDR_OFF_NEXT_INDEX: usize = 0x18;
const HDR_OFF_NEXT_SEQNUM: usize = 0x20;

const ENT_OFF_SEQNUM: usize = 0x00;
const ENT_OFF_KIND: usize = 0x08;

const FC_OFF_SIZE: usize = 0x10;
const FC_OFF_FLAGS: usize = 0x18;
const FC_OFF_MODE: usize = 0x1C;
const FC_OFF_UID: usize = 0x20;
const FC_OFF_GID: usize = 0x24;
const FC_OFF_EXT_COUNT: usize = 0x28;
const FC_OFF_RELPATH: usize = 0x30;
const FC_OFF_EXTENTS: usize = 0x80;
const FC_EXTENT_STRIDE: usize = 0x10;

const MD_OFF_MODE: usize = 0x10;
const MD_OFF_UID: usize = 0x14;
const MD_OFF_GID: usize = 0x18;
const MD_OFF_RELPATH: usize = 0x20;

/// A relative path as the log schema requires it: non-empty, not
/// starting with `/`, and short enough for the fixed-width field.
#[must_use]
pub fn path_is_relative(path: &str) -> bool {
    !path.is_empty() && !path.starts_with('/') && path.len() < FAMFS_MAX_PATHLEN
}

// ── Header ──────────────────────────────────────────────────────────────────

/// Parsed log header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogHeader {
    pub log_len: u64,
    pub last_index: u64,
    pub next_index: u64,
    pub next_seqnum: u64,
}

impl LogHeader {
    /// Parse and sanity-check the header of a mapped log region.
    pub fn parse(log: &[u8]) -> Result<Self> {
        let magic = read_le_u64(log, HDR_OFF_MAGIC)?;
        if magic != FAMFS_LOG_MAGIC {
            return Err(FamfsError::LogCorrupt(format!(
                "bad log magic {magic:#x}"
            )));
        }

        let header = Self {
            log_len: read_le_u64(log, HDR_OFF_LOG_LEN)?,
            last_index: read_le_u64(log, HDR_OFF_LAST_INDEX)?,
            next_index: read_le_u64(log, HDR_OFF_NEXT_INDEX)?,
            next_seqnum: read_le_u64(log, HDR_OFF_NEXT_SEQNUM)?,
        };

        let capacity = header.last_index.checked_add(1).ok_or_else(|| {
            FamfsError::LogCorrupt("last_index at integer limit".to_owned())
        })?;
        if header.next_index > capacity {
            return Err(FamfsError::LogCorrupt(format!(
                "next_index {} beyond capacity {capacity}",
                header.next_index
            )));
        }
        let needed = (LOG_HEADER_SIZE as u64)
            .saturating_add(capacity.saturating_mul(LOG_ENTRY_SIZE as u64));
        if needed > header.log_len || header.log_len > log.len() as u64 {
            return Err(FamfsError::LogCorrupt(format!(
                "entry array ({needed} bytes) does not fit log region ({} bytes)",
                header.log_len
            )));
        }
        Ok(header)
    }

    /// Total number of entry slots.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.last_index + 1
    }

    /// Whether no free slot remains.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.next_index > self.last_index
    }

    /// Bytes of the region currently in use (header plus written slots).
    #[must_use]
    pub fn bytes_in_use(&self) -> u64 {
        LOG_HEADER_SIZE as u64 + self.next_index * LOG_ENTRY_SIZE as u64
    }
}

/// Initialize an empty log in `log` (mkfs write-side).
///
/// `log_len` is the on-media region length recorded in the header; the
/// slot capacity is derived from it.
pub fn format_log(log: &mut [u8], log_len: u64) -> Result<()> {
    let usable = log_len.saturating_sub(LOG_HEADER_SIZE as u64);
    let capacity = usable / LOG_ENTRY_SIZE as u64;
    if capacity == 0 {
        return Err(FamfsError::InvalidArg(format!(
            "log length {log_len} too small for any entry"
        )));
    }
    if log_len > log.len() as u64 {
        return Err(FamfsError::InvalidArg(format!(
            "log length {log_len} exceeds mapped region of {} bytes",
            log.len()
        )));
    }

    write_le_u64(log, HDR_OFF_MAGIC, FAMFS_LOG_MAGIC)?;
    write_le_u64(log, HDR_OFF_LOG_LEN, log_len)?;
    write_le_u64(log, HDR_OFF_LAST_INDEX, capacity - 1)?;
    write_le_u64(log, HDR_OFF_NEXT_INDEX, 0)?;
    write_le_u64(log, HDR_OFF_NEXT_SEQNUM, 0)?;
    debug!(capacity, log_len, "formatted log");
    Ok(())
}

// ── Entries ─────────────────────────────────────────────────────────────────

/// File-create record: the only way a file comes into existence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCreate {
    pub relpath: String,
    pub size: u64,
    pub flags: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub extents: Vec<Extent>,
}

/// Directory-create record; consumes no device space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MkdirEntry {
    pub relpath: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Decoded body of one log slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntryBody {
    FileCreate(FileCreate),
    Mkdir(MkdirEntry),
    /// Reserved or unrecognized kinds (including the reserved access
    /// records); consumers count these as invalid and move on.
    Unknown { kind: u32 },
}

/// One decoded log slot with its position and stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub seqnum: u64,
    pub body: LogEntryBody,
}

fn slot_range(index: u64) -> Result<(usize, usize)> {
    let idx = u64_to_usize(index, "log_index")?;
    let start = LOG_HEADER_SIZE + idx * LOG_ENTRY_SIZE;
    Ok((start, start + LOG_ENTRY_SIZE))
}

/// Decode the slot at `index`. The caller is responsible for only asking
/// for indexes below `next_index`.
pub fn read_entry(log: &[u8], index: u64) -> Result<LogEntry> {
    let (start, end) = slot_range(index)?;
    if end > log.len() {
        return Err(FamfsError::LogCorrupt(format!(
            "entry {index} extends past mapped region"
        )));
    }
    let slot = &log[start..end];

    let seqnum = read_le_u64(slot, ENT_OFF_SEQNUM)?;
    let kind = read_le_u32(slot, ENT_OFF_KIND)?;
    let body = match kind {
        KIND_FILE_CREATE => {
            let ext_count = read_le_u32(slot, FC_OFF_EXT_COUNT)?;
            if ext_count == 0 || ext_count as usize > FAMFS_MAX_EXTENTS {
                LogEntryBody::Unknown { kind }
            } else {
                let mut extents = Vec::with_capacity(ext_count as usize);
                for i in 0..ext_count as usize {
                    let base = FC_OFF_EXTENTS + i * FC_EXTENT_STRIDE;
                    extents.push(Extent {
                        offset: read_le_u64(slot, base)?,
                        len: read_le_u64(slot, base + 8)?,
                    });
                }
                LogEntryBody::FileCreate(FileCreate {
                    relpath: trim_nul_padded(&read_fixed::<FAMFS_MAX_PATHLEN>(
                        slot,
                        FC_OFF_RELPATH,
                    )?),
                    size: read_le_u64(slot, FC_OFF_SIZE)?,
                    flags: read_le_u32(slot, FC_OFF_FLAGS)?,
                    mode: read_le_u32(slot, FC_OFF_MODE)?,
                    uid: read_le_u32(slot, FC_OFF_UID)?,
                    gid: read_le_u32(slot, FC_OFF_GID)?,
                    extents,
                })
            }
        }
        KIND_MKDIR => LogEntryBody::Mkdir(MkdirEntry {
            relpath: trim_nul_padded(&read_fixed::<FAMFS_MAX_PATHLEN>(slot, MD_OFF_RELPATH)?),
            mode: read_le_u32(slot, MD_OFF_MODE)?,
            uid: read_le_u32(slot, MD_OFF_UID)?,
            gid: read_le_u32(slot, MD_OFF_GID)?,
        }),
        other => LogEntryBody::Unknown { kind: other },
    };

    Ok(LogEntry {
        index,
        seqnum,
        body,
    })
}

/// Restartable iterator over the populated slots `0..next_index`.
pub struct LogEntryIter<'a> {
    log: &'a [u8],
    next: u64,
    limit: u64,
}

impl<'a> LogEntryIter<'a> {
    /// Parse the header and iterate the populated prefix of the log.
    pub fn new(log: &'a [u8]) -> Result<Self> {
        let header = LogHeader::parse(log)?;
        Ok(Self {
            log,
            next: 0,
            limit: header.next_index,
        })
    }
}

impl Iterator for LogEntryIter<'_> {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.limit {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(read_entry(self.log, index))
    }
}

// ── Append ──────────────────────────────────────────────────────────────────

fn validate_body(body: &LogEntryBody) -> Result<()> {
    match body {
        LogEntryBody::FileCreate(fc) => {
            if !path_is_relative(&fc.relpath) {
                return Err(FamfsError::PathNotRelative(fc.relpath.clone()));
            }
            if fc.extents.is_empty() || fc.extents.len() > FAMFS_MAX_EXTENTS {
                return Err(FamfsError::InvalidArg(format!(
                    "extent count {} out of range",
                    fc.extents.len()
                )));
            }
            let mut backing = 0_u64;
            for ext in &fc.extents {
                if ext.offset == 0 || !ext.is_au_aligned() {
                    return Err(FamfsError::InvalidArg(format!(
                        "extent {ext} is not an aligned non-zero device range"
                    )));
                }
                backing = backing.saturating_add(ext.len);
            }
            if fc.size > backing {
                return Err(FamfsError::InvalidArg(format!(
                    "declared size {} exceeds {backing} bytes of extents",
                    fc.size
                )));
            }
            Ok(())
        }
        LogEntryBody::Mkdir(md) => {
            if !path_is_relative(&md.relpath) {
                return Err(FamfsError::PathNotRelative(md.relpath.clone()));
            }
            Ok(())
        }
        LogEntryBody::Unknown { kind } => Err(FamfsError::InvalidArg(format!(
            "cannot append entry of kind {kind}"
        ))),
    }
}

fn encode_body(slot: &mut [u8], body: &LogEntryBody) -> Result<()> {
    match body {
        LogEntryBody::FileCreate(fc) => {
            write_le_u32(slot, ENT_OFF_KIND, KIND_FILE_CREATE)?;
            write_le_u64(slot, FC_OFF_SIZE, fc.size)?;
            write_le_u32(slot, FC_OFF_FLAGS, fc.flags)?;
            write_le_u32(slot, FC_OFF_MODE, fc.mode)?;
            write_le_u32(slot, FC_OFF_UID, fc.uid)?;
            write_le_u32(slot, FC_OFF_GID, fc.gid)?;
            write_le_u32(slot, FC_OFF_EXT_COUNT, fc.extents.len() as u32)?;
            write_nul_padded(slot, FC_OFF_RELPATH, FAMFS_MAX_PATHLEN, &fc.relpath, "relpath")?;
            for (i, ext) in fc.extents.iter().enumerate() {
                let base = FC_OFF_EXTENTS + i * FC_EXTENT_STRIDE;
                write_le_u64(slot, base, ext.offset)?;
                write_le_u64(slot, base + 8, ext.len)?;
            }
        }
        LogEntryBody::Mkdir(md) => {
            write_le_u32(slot, ENT_OFF_KIND, KIND_MKDIR)?;
            write_le_u32(slot, MD_OFF_MODE, md.mode)?;
            write_le_u32(slot, MD_OFF_UID, md.uid)?;
            write_le_u32(slot, MD_OFF_GID, md.gid)?;
            write_nul_padded(slot, MD_OFF_RELPATH, FAMFS_MAX_PATHLEN, &md.relpath, "relpath")?;
        }
        LogEntryBody::Unknown { .. } => unreachable!("rejected by validate_body"),
    }
    Ok(())
}

/// Append one entry to a writable log mapping.
///
/// The entry is stamped with the current `next_seqnum`, copied into slot
/// `next_index`, and both counters advance. A failure leaves the log
/// unchanged. Returns the assigned sequence number.
///
/// Not re-entrant: the caller serializes appends externally; the one
/// write-authority host for the filesystem is the only legal writer.
pub fn append_entry(log: &mut [u8], body: &LogEntryBody) -> Result<u64> {
    let header = LogHeader::parse(log)?;
    if header.is_full() {
        return Err(FamfsError::LogFull);
    }
    validate_body(body)?;

    let (start, end) = slot_range(header.next_index)?;
    if end > log.len() {
        return Err(FamfsError::LogCorrupt(format!(
            "slot {} extends past mapped region",
            header.next_index
        )));
    }

    let seqnum = header.next_seqnum;
    {
        let slot = &mut log[start..end];
        slot.fill(0);
        write_le_u64(slot, ENT_OFF_SEQNUM, seqnum)?;
        encode_body(slot, body)?;
    }

    write_le_u64(log, HDR_OFF_NEXT_SEQNUM, seqnum + 1)?;
    write_le_u64(log, HDR_OFF_NEXT_INDEX, header.next_index + 1)?;
    debug!(index = header.next_index, seqnum, "appended log entry");
    Ok(seqnum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use famfs_types::FAMFS_ALLOC_UNIT;

    const AU: u64 = FAMFS_ALLOC_UNIT;

    fn small_log(capacity: u64) -> Vec<u8> {
        let len = LOG_HEADER_SIZE as u64 + capacity * LOG_ENTRY_SIZE as u64;
        let mut log = vec![0_u8; len as usize];
        format_log(&mut log, len).unwrap();
        log
    }

    fn fc(relpath: &str, size: u64, offset: u64) -> LogEntryBody {
        LogEntryBody::FileCreate(FileCreate {
            relpath: relpath.to_owned(),
            size,
            flags: FC_ALL_HOSTS_RW,
            mode: 0o644,
            uid: 0,
            gid: 0,
            extents: vec![Extent::new(offset, AU)],
        })
    }

    fn md(relpath: &str) -> LogEntryBody {
        LogEntryBody::Mkdir(MkdirEntry {
            relpath: relpath.to_owned(),
            mode: 0o755,
            uid: 500,
            gid: 500,
        })
    }

    #[test]
    fn format_yields_empty_log() {
        let log = small_log(4);
        let header = LogHeader::parse(&log).unwrap();
        assert_eq!(header.capacity(), 4);
        assert_eq!(header.next_index, 0);
        assert_eq!(header.next_seqnum, 0);
        assert!(!header.is_full());
        assert_eq!(header.bytes_in_use(), LOG_HEADER_SIZE as u64);
        assert_eq!(LogEntryIter::new(&log).unwrap().count(), 0);
    }

    #[test]
    fn format_rejects_tiny_region() {
        let mut log = vec![0_u8; LOG_HEADER_SIZE];
        assert!(format_log(&mut log, LOG_HEADER_SIZE as u64).is_err());
    }

    #[test]
    fn append_round_trips_file_create() {
        let mut log = small_log(4);
        let body = fc("dir/a.dat", AU - 17, 5 * AU);
        append_entry(&mut log, &body).unwrap();

        let entry = read_entry(&log, 0).unwrap();
        assert_eq!(entry.seqnum, 0);
        match entry.body {
            LogEntryBody::FileCreate(got) => {
                assert_eq!(got.relpath, "dir/a.dat");
                assert_eq!(got.size, AU - 17);
                assert_eq!(got.flags, FC_ALL_HOSTS_RW);
                assert_eq!(got.mode, 0o644);
                assert_eq!(got.extents, vec![Extent::new(5 * AU, AU)]);
            }
            other => panic!("expected FileCreate, got {other:?}"),
        }
    }

    #[test]
    fn append_round_trips_mkdir() {
        let mut log = small_log(4);
        append_entry(&mut log, &md("subdir")).unwrap();
        let entry = read_entry(&log, 0).unwrap();
        match entry.body {
            LogEntryBody::Mkdir(got) => {
                assert_eq!(got.relpath, "subdir");
                assert_eq!(got.mode, 0o755);
                assert_eq!((got.uid, got.gid), (500, 500));
            }
            other => panic!("expected Mkdir, got {other:?}"),
        }
    }

    #[test]
    fn seqnums_strictly_increase_with_index() {
        let mut log = small_log(8);
        for i in 0..5 {
            let seq = append_entry(&mut log, &fc(&format!("f{i}"), AU, (5 + i) * AU)).unwrap();
            assert_eq!(seq, i);
        }
        let entries: Vec<_> = LogEntryIter::new(&log)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 5);
        for pair in entries.windows(2) {
            assert!(pair[0].seqnum < pair[1].seqnum);
        }
    }

    #[test]
    fn append_to_full_log_leaves_counters_unchanged() {
        let mut log = small_log(2);
        append_entry(&mut log, &md("a")).unwrap();
        append_entry(&mut log, &md("b")).unwrap();

        let before = LogHeader::parse(&log).unwrap();
        assert!(before.is_full());

        let err = append_entry(&mut log, &md("c")).unwrap_err();
        assert!(matches!(err, FamfsError::LogFull));

        let after = LogHeader::parse(&log).unwrap();
        assert_eq!(after, before);
    }

    #[test]
    fn append_rejects_bad_bodies() {
        let mut log = small_log(4);
        // Absolute path.
        assert!(matches!(
            append_entry(&mut log, &fc("/abs", AU, 5 * AU)),
            Err(FamfsError::PathNotRelative(_))
        ));
        // Zero-offset extent (only the superblock lives there).
        assert!(matches!(
            append_entry(&mut log, &fc("f", AU, 0)),
            Err(FamfsError::InvalidArg(_))
        ));
        // Unaligned extent.
        assert!(matches!(
            append_entry(&mut log, &fc("f", AU, 5 * AU + 512)),
            Err(FamfsError::InvalidArg(_))
        ));
        // Declared size larger than the extent list backs.
        assert!(matches!(
            append_entry(&mut log, &fc("f", 2 * AU + 1, 5 * AU)),
            Err(FamfsError::InvalidArg(_))
        ));
        // Nothing landed.
        assert_eq!(LogHeader::parse(&log).unwrap().next_index, 0);
    }

    #[test]
    fn bad_magic_is_log_corrupt() {
        let mut log = small_log(2);
        log[0] ^= 0x5A;
        assert!(matches!(
            LogHeader::parse(&log),
            Err(FamfsError::LogCorrupt(_))
        ));
        assert!(matches!(
            append_entry(&mut log, &md("x")),
            Err(FamfsError::LogCorrupt(_))
        ));
    }

    #[test]
    fn corrupt_next_index_is_detected() {
        let mut log = small_log(2);
        write_le_u64(&mut log, HDR_OFF_NEXT_INDEX, 3).unwrap();
        assert!(matches!(
            LogHeader::parse(&log),
            Err(FamfsError::LogCorrupt(_))
        ));
    }

    #[test]
    fn unknown_kind_decodes_as_unknown() {
        let mut log = small_log(2);
        append_entry(&mut log, &md("d")).unwrap();
        // Overwrite the kind tag with the reserved access kind.
        let start = LOG_HEADER_SIZE + ENT_OFF_KIND;
        log[start..start + 4].copy_from_slice(&3_u32.to_le_bytes());
        let entry = read_entry(&log, 0).unwrap();
        assert_eq!(entry.body, LogEntryBody::Unknown { kind: 3 });
    }

    #[test]
    fn iterator_is_restartable() {
        let mut log = small_log(4);
        append_entry(&mut log, &md("a")).unwrap();
        append_entry(&mut log, &md("b")).unwrap();
        let first = LogEntryIter::new(&log).unwrap().count();
        let second = LogEntryIter::new(&log).unwrap().count();
        assert_eq!(first, 2);
        assert_eq!(first, second);
    }
}
