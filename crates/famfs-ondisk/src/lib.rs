#![forbid(unsafe_code)]
//! On-media metadata formats for famfs.
//!
//! A famfs device carries a fixed little-endian layout: the superblock at
//! offset 0, followed by an append-only log of fixed-stride records. The
//! two regions together form an implicitly allocated prefix that never
//! appears in any log entry. Everything here operates on plain byte
//! slices so the same codec serves raw device mappings, meta-file
//! mappings, and in-memory test images.

pub mod log;
pub mod superblock;

pub use log::{
    FC_ALL_HOSTS_RW, FileCreate, LOG_ENTRY_SIZE, LOG_HEADER_SIZE, LogEntry, LogEntryBody,
    LogEntryIter, LogHeader, MkdirEntry, append_entry, format_log, path_is_relative, read_entry,
};
pub use superblock::{DaxDevice, SUPERBLOCK_STRUCT_SIZE, Superblock, has_superblock_magic};
