//! # Region - sector-allocated record container
//!
//! A region file stores up to 1024 independently sized, compressed records
//! ("chunks"), one per slot of a 32 × 32 grid. Records live in whole 4096-byte
//! sectors so they can be rewritten in place; free sectors are tracked by the
//! [`allocator`] crate.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ SECTOR 0: SLOT TABLE                                           │
//! │                                                               │
//! │ 1024 × u32 BE, index = (z & 31) * 32 + (x & 31)                │
//! │ entry = (start_sector << 8) | sector_count, 0 = empty          │
//! ├───────────────────────────────────────────────────────────────┤
//! │ SECTOR 1: TIMESTAMP TABLE                                      │
//! │                                                               │
//! │ 1024 × u32 BE epoch seconds, same index order                  │
//! ├───────────────────────────────────────────────────────────────┤
//! │ SECTORS 2..: RECORDS                                           │
//! │                                                               │
//! │ length (u32 BE, = 1 + compressed_len) | codec tag (u8)         │
//! │ compressed bytes | zero padding to the next sector boundary    │
//! │                                                               │
//! │ ... one record per occupied slot, in any physical order ...    │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! A record spans at most 255 sectors (the count is one byte of the slot
//! entry), so the largest framed record is 1,044,480 bytes.
//!
//! ## Access paths
//!
//! | Type            | Use                                                    |
//! |-----------------|--------------------------------------------------------|
//! | [`RegionStore`] | random-access get / put / remove with sector reuse     |
//! | [`RegionWriter`]| forward-only bulk generation, headers written at close |
//! | [`RegionScan`]  | read every record once in ascending file order         |
//!
//! None of these types synchronise internally, and nothing prevents two
//! writers from opening the same file. There is no write-ahead log: a crash
//! in the middle of an update can leave the file inconsistent.

pub mod cursor;
pub mod format;
mod scan;
mod store;
mod writer;

use codec::CodecError;
use std::io;
use thiserror::Error;

pub use allocator::{SectorAllocator, SectorBlock, HEADER_SECTORS, SLOT_COUNT};
pub use codec::Codec;
pub use cursor::{ByteCursor, ByteCursorMut};
pub use format::{
    coordinates_of, frame_record, pack_slot_entry, slot_index_of, unframe_record,
    unpack_slot_entry, RegionHeader, HEADER_BYTES, MAX_RECORD_BYTES, MAX_RECORD_SECTORS,
    SECTOR_BYTES,
};
pub use scan::{RegionScan, ScanEntry};
pub use store::RegionStore;
pub use writer::RegionWriter;

/// Errors returned by region operations.
#[derive(Debug, Error)]
pub enum RegionError {
    /// Slot index outside `0..1024`.
    #[error("slot index {0} out of range (0..{max})", max = SLOT_COUNT)]
    OutOfRange(usize),

    /// The streaming writer already wrote this slot.
    #[error("slot {0} has already been written")]
    AlreadyWritten(usize),

    /// The framed record needs more sectors than a slot entry can describe.
    #[error("record needs {sectors} sectors, limit is {max}", max = MAX_RECORD_SECTORS)]
    RecordTooLarge { sectors: usize },

    /// The record carries a codec tag this build does not know.
    #[error("unsupported codec tag {0}")]
    UnsupportedCodec(u8),

    /// Fewer bytes were available than the layout requires.
    #[error("truncated data at offset {offset}: needed {needed} bytes")]
    Truncated { offset: u64, needed: usize },

    /// The header tables could not be used.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// A record's length prefix disagrees with its slot entry.
    #[error("corrupt record at offset {offset}: {reason}")]
    CorruptRecord { offset: u64, reason: String },

    /// The start sector does not fit the 24-bit field of a slot entry.
    #[error("start sector {0} exceeds the 24-bit slot entry field")]
    SectorOverflow(u32),

    /// Compression or decompression of the payload failed.
    #[error(transparent)]
    Codec(CodecError),

    /// The store or writer was used after `close()`.
    #[error("region is closed")]
    Closed,

    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<CodecError> for RegionError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Unsupported(tag) => RegionError::UnsupportedCodec(tag),
            other => RegionError::Codec(other),
        }
    }
}

impl From<allocator::SyncError> for RegionError {
    fn from(e: allocator::SyncError) -> Self {
        RegionError::InvalidHeader(e.to_string())
    }
}

/// Result alias for region operations.
pub type Result<T> = std::result::Result<T, RegionError>;

#[cfg(test)]
mod tests;
