//! Region binary layout: slot addressing, slot entries, record framing and
//! the two header tables.
//!
//! Everything here is pure except [`RegionHeader::read_from`],
//! [`RegionHeader::write_to`] and the crate-internal record reader, which
//! take an explicit handle.
//!
//! ## Record frame
//!
//! ```text
//! [length: u32 BE][codec tag: u8][compressed bytes ...][zero pad to 4096]
//! ```
//!
//! `length` counts the tag byte plus the compressed bytes, not itself.

use allocator::{SectorBlock, HEADER_SECTORS, SLOT_COUNT};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use codec::Codec;
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::warn;

use crate::cursor::{ByteCursor, ByteCursorMut};
use crate::{RegionError, Result};

/// Size of one sector in bytes.
pub const SECTOR_BYTES: usize = 4096;

/// Size of the slot table plus the timestamp table.
pub const HEADER_BYTES: usize = HEADER_SECTORS as usize * SECTOR_BYTES;

/// Largest sector count a slot entry can hold.
pub const MAX_RECORD_SECTORS: u32 = 255;

/// Largest framed record, padding included.
pub const MAX_RECORD_BYTES: usize = MAX_RECORD_SECTORS as usize * SECTOR_BYTES;

/// Largest start sector a slot entry can hold (24 bits).
pub const MAX_START_SECTOR: u32 = 0x00FF_FFFF;

/// Bytes of the big-endian length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Length prefix plus codec tag.
pub const RECORD_OVERHEAD: usize = LENGTH_PREFIX_BYTES + 1;

/// Slots per row of the grid.
pub const GRID_WIDTH: i32 = 32;

// -------------------- Slot addressing --------------------

/// Slot index for the low five bits of `(x, z)`.
#[must_use]
pub fn slot_index_of(x: i32, z: i32) -> usize {
    ((z & 31) * GRID_WIDTH + (x & 31)) as usize
}

/// Local `(x, z)` of a slot, each in `0..32`. Inverse of [`slot_index_of`].
#[must_use]
pub fn coordinates_of(index: usize) -> (i32, i32) {
    ((index & 31) as i32, ((index >> 5) & 31) as i32)
}

/// Fails with [`RegionError::OutOfRange`] unless `index < 1024`.
pub fn check_index(index: usize) -> Result<()> {
    if index < SLOT_COUNT {
        Ok(())
    } else {
        Err(RegionError::OutOfRange(index))
    }
}

// -------------------- Slot entries --------------------

/// Packs `(start, count)` into a slot entry.
///
/// # Errors
///
/// [`RegionError::RecordTooLarge`] if `count > 255`,
/// [`RegionError::SectorOverflow`] if `start` does not fit 24 bits.
pub fn pack_slot_entry(start: u32, count: u32) -> Result<u32> {
    if count > MAX_RECORD_SECTORS {
        return Err(RegionError::RecordTooLarge {
            sectors: count as usize,
        });
    }
    if start > MAX_START_SECTOR {
        return Err(RegionError::SectorOverflow(start));
    }
    Ok((start << 8) | count)
}

/// Unpacks a slot entry into `(start, count)`; `None` for the empty entry.
#[must_use]
pub fn unpack_slot_entry(entry: u32) -> Option<(u32, u32)> {
    SectorBlock::from_slot_entry(entry).map(|b| (b.start, b.count))
}

// -------------------- Record framing --------------------

/// Sectors needed to hold `framed_len` bytes.
#[must_use]
pub fn sectors_for(framed_len: usize) -> usize {
    framed_len.div_ceil(SECTOR_BYTES)
}

/// Frames `compressed` as `[length][tag][bytes]`, without padding.
///
/// # Errors
///
/// [`RegionError::RecordTooLarge`] when the framed record needs more than
/// 255 sectors.
pub fn frame_record(codec_tag: u8, compressed: &[u8]) -> Result<Vec<u8>> {
    let framed_len = RECORD_OVERHEAD + compressed.len();
    let sectors = sectors_for(framed_len);
    if sectors > MAX_RECORD_SECTORS as usize {
        return Err(RegionError::RecordTooLarge { sectors });
    }

    let mut framed = Vec::with_capacity(sectors * SECTOR_BYTES);
    framed.write_u32::<BigEndian>((compressed.len() + 1) as u32)?;
    framed.write_u8(codec_tag)?;
    framed.extend_from_slice(compressed);
    Ok(framed)
}

/// Splits a framed record into `(tag, compressed)`. Bytes past the declared
/// length (sector padding) are ignored.
pub fn unframe_record(bytes: &[u8]) -> Result<(u8, &[u8])> {
    let mut cur = ByteCursor::new(bytes);
    let length = cur.read_u32()? as usize;
    if length == 0 {
        return Err(RegionError::CorruptRecord {
            offset: 0,
            reason: "zero length record has no codec tag".to_string(),
        });
    }
    let tag = cur.read_u8()?;
    let compressed = cur.read_bytes(length - 1)?;
    Ok((tag, compressed))
}

/// Zero-fills `buf` up to the next sector boundary.
pub fn pad_to_sector(buf: &mut Vec<u8>) {
    let padded = sectors_for(buf.len()) * SECTOR_BYTES;
    buf.resize(padded, 0);
}

/// Reads, unframes and decompresses the record stored in `block`.
pub(crate) fn read_record<R: Read + Seek>(r: &mut R, block: SectorBlock) -> Result<(Codec, Vec<u8>)> {
    let offset = block.start as u64 * SECTOR_BYTES as u64;
    r.seek(SeekFrom::Start(offset))?;

    let length = r
        .read_u32::<BigEndian>()
        .map_err(|e| eof_as_truncated(e, offset, LENGTH_PREFIX_BYTES))? as usize;
    let capacity = (block.count as usize * SECTOR_BYTES).saturating_sub(LENGTH_PREFIX_BYTES);
    if length == 0 || length > capacity {
        return Err(RegionError::CorruptRecord {
            offset,
            reason: format!(
                "length {} does not fit {} sector(s)",
                length, block.count
            ),
        });
    }

    let mut framed = vec![0u8; LENGTH_PREFIX_BYTES + length];
    framed[..LENGTH_PREFIX_BYTES].copy_from_slice(&(length as u32).to_be_bytes());
    r.read_exact(&mut framed[LENGTH_PREFIX_BYTES..])
        .map_err(|e| eof_as_truncated(e, offset, LENGTH_PREFIX_BYTES + length))?;

    let (tag, compressed) = unframe_record(&framed)?;
    let codec = Codec::from_tag(tag)?;
    let payload = codec.decompress(compressed)?;
    Ok((codec, payload))
}

fn eof_as_truncated(e: io::Error, offset: u64, needed: usize) -> RegionError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        RegionError::Truncated { offset, needed }
    } else {
        RegionError::Io(e)
    }
}

// -------------------- Header tables --------------------

/// In-memory copy of the slot table and the timestamp table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionHeader {
    slots: Vec<u32>,
    timestamps: Vec<u32>,
}

impl Default for RegionHeader {
    fn default() -> Self {
        Self::empty()
    }
}

impl RegionHeader {
    /// Header with every slot empty.
    pub fn empty() -> Self {
        Self {
            slots: vec![0; SLOT_COUNT],
            timestamps: vec![0; SLOT_COUNT],
        }
    }

    /// Decodes both tables from the first [`HEADER_BYTES`] of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cur = ByteCursor::with_limit(bytes, HEADER_BYTES)?;
        let mut header = Self::empty();
        cur.read_u32_into(&mut header.slots)?;
        cur.read_u32_into(&mut header.timestamps)?;
        Ok(header)
    }

    /// Encodes both tables into [`HEADER_BYTES`] bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; HEADER_BYTES];
        let mut cur = ByteCursorMut::new(&mut bytes);
        cur.write_u32_from(&self.slots)?;
        cur.write_u32_from(&self.timestamps)?;
        Ok(bytes)
    }

    /// Reads the header from the start of `r`.
    ///
    /// Returns `None` when the source holds fewer than [`HEADER_BYTES`]
    /// bytes (a new or empty file).
    pub fn read_from<R: Read + Seek>(r: &mut R) -> Result<Option<Self>> {
        r.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::with_capacity(HEADER_BYTES);
        r.by_ref().take(HEADER_BYTES as u64).read_to_end(&mut bytes)?;
        if bytes.len() < HEADER_BYTES {
            return Ok(None);
        }
        Self::decode(&bytes).map(Some)
    }

    /// Writes both tables at offset 0 of `w`.
    pub fn write_to<W: Write + Seek>(&self, w: &mut W) -> Result<()> {
        w.seek(SeekFrom::Start(0))?;
        w.write_all(&self.encode()?)?;
        Ok(())
    }

    /// The raw slot table.
    #[must_use]
    pub fn slots(&self) -> &[u32] {
        &self.slots
    }

    /// The raw timestamp table.
    #[must_use]
    pub fn timestamps(&self) -> &[u32] {
        &self.timestamps
    }

    /// Raw entry for `index`. Panics if `index >= 1024`.
    #[must_use]
    pub fn entry(&self, index: usize) -> u32 {
        self.slots[index]
    }

    /// Sector span of the record in `index`, if the slot is occupied.
    #[must_use]
    pub fn block(&self, index: usize) -> Option<SectorBlock> {
        SectorBlock::from_slot_entry(self.slots[index]).filter(is_usable)
    }

    /// Stored timestamp for `index`; meaningful only while occupied.
    #[must_use]
    pub fn timestamp(&self, index: usize) -> u32 {
        self.timestamps[index]
    }

    /// Records an occupied slot.
    pub fn set(&mut self, index: usize, entry: u32, timestamp: u32) {
        self.slots[index] = entry;
        self.timestamps[index] = timestamp;
    }

    /// Empties a slot. The timestamp is left as it was.
    pub fn clear(&mut self, index: usize) {
        self.slots[index] = 0;
    }

    /// Occupied slots in index order.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, SectorBlock)> + '_ {
        (0..SLOT_COUNT).filter_map(|i| self.block(i).map(|b| (i, b)))
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn occupied_count(&self) -> usize {
        self.occupied().count()
    }

    /// Clears entries that cannot describe a record (zero sectors, or a start
    /// inside the header). Returns how many were cleared.
    pub fn clear_invalid_entries(&mut self) -> usize {
        let mut cleared = 0;
        for index in 0..SLOT_COUNT {
            let entry = self.slots[index];
            if let Some(block) = SectorBlock::from_slot_entry(entry) {
                if !is_usable(&block) {
                    warn!(index, start = block.start, count = block.count, "clearing invalid slot entry");
                    self.slots[index] = 0;
                    cleared += 1;
                }
            }
        }
        cleared
    }

    /// Clears entries whose sectors overlap an earlier record.
    ///
    /// Records are visited by start sector (ties by slot index); the first
    /// record to claim a sector keeps it and every later record touching one
    /// of its sectors is cleared. Returns how many were cleared.
    pub fn clear_overlapping_entries(&mut self) -> usize {
        let mut records: Vec<(SectorBlock, usize)> =
            self.occupied().map(|(index, block)| (block, index)).collect();
        records.sort_unstable_by_key(|&(block, index)| (block.start, index));

        let mut claimed_to = HEADER_SECTORS;
        let mut cleared = 0;
        for (block, index) in records {
            if block.start < claimed_to {
                warn!(index, start = block.start, count = block.count, "clearing overlapping slot entry");
                self.slots[index] = 0;
                cleared += 1;
            } else {
                claimed_to = block.end();
            }
        }
        cleared
    }
}

fn is_usable(block: &SectorBlock) -> bool {
    block.count > 0 && block.start >= HEADER_SECTORS
}
