use allocator::{SectorAllocator, SectorBlock};
use codec::{Codec, DEFAULT_LEVEL};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, trace, warn};

use crate::format::{
    check_index, frame_record, pack_slot_entry, pad_to_sector, read_record, sectors_for,
    RegionHeader, SECTOR_BYTES,
};
use crate::scan::RegionScan;
use crate::{RegionError, Result};

/// Random-access region store.
///
/// Holds the open handle, an in-memory copy of both header tables and a
/// [`SectorAllocator`] kept in step with the slot table. Records can be read,
/// replaced and removed in any order; replaced or removed records give their
/// sectors back to the allocator for reuse.
///
/// Header changes are kept in memory until [`flush`](RegionStore::flush) or
/// [`close`](RegionStore::close). Dropping an unclosed store flushes the
/// header on a best-effort basis.
///
/// # Durability
///
/// There is no journal. A crash between writing a record and flushing the
/// header leaves the header pointing at whatever the sectors held before, and
/// sectors allocated by an unflushed `put` are leaked until the next open.
pub struct RegionStore<F: Read + Write + Seek = File> {
    file: Option<F>,
    header: RegionHeader,
    allocator: SectorAllocator,
    compression_level: u32,
    /// In-memory header differs from what is on disk.
    dirty: bool,
}

impl RegionStore<File> {
    /// Opens (or creates) the region file at `path` for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "opening region file");
        Self::from_handle(file)
    }
}

impl<F: Read + Write + Seek> RegionStore<F> {
    /// Wraps an already open handle.
    ///
    /// A handle shorter than the two header sectors is treated as a new,
    /// empty region; its header is written on the next flush.
    pub fn from_handle(mut file: F) -> Result<Self> {
        let (mut header, fresh) = match RegionHeader::read_from(&mut file)? {
            Some(header) => (header, false),
            None => (RegionHeader::empty(), true),
        };
        let cleared = header.clear_invalid_entries() + header.clear_overlapping_entries();

        let mut allocator = SectorAllocator::new();
        allocator.sync(header.slots())?;

        debug!(
            occupied = header.occupied_count(),
            frontier = allocator.frontier(),
            free_sectors = allocator.free_sectors(),
            fresh,
            "region loaded"
        );

        Ok(Self {
            file: Some(file),
            header,
            allocator,
            compression_level: DEFAULT_LEVEL,
            dirty: fresh || cleared > 0,
        })
    }

    /// Every slot accessor fails with [`RegionError::Closed`] once closed.
    fn ensure_open(&self) -> Result<()> {
        if self.file.is_none() {
            return Err(RegionError::Closed);
        }
        Ok(())
    }

    fn handle(&mut self) -> Result<&mut F> {
        self.file.as_mut().ok_or(RegionError::Closed)
    }

    /// Reads the record in `index`.
    ///
    /// Returns `Ok(None)` for an empty slot, otherwise the decompressed
    /// payload and its stored timestamp.
    ///
    /// # Errors
    ///
    /// [`RegionError::OutOfRange`] for `index >= 1024`,
    /// [`RegionError::UnsupportedCodec`] for an unknown codec tag, and
    /// [`RegionError::Truncated`] / [`RegionError::Io`] for read failures,
    /// and [`RegionError::Closed`] after [`close`](RegionStore::close), even
    /// for an empty slot.
    pub fn get(&mut self, index: usize) -> Result<Option<(Vec<u8>, u32)>> {
        check_index(index)?;
        self.ensure_open()?;
        let Some(block) = self.header.block(index) else {
            return Ok(None);
        };
        let timestamp = self.header.timestamp(index);
        let file = self.handle()?;
        let (_codec, payload) = read_record(file, block)?;
        trace!(index, start = block.start, bytes = payload.len(), "read record");
        Ok(Some((payload, timestamp)))
    }

    /// Stores `payload` in `index`, replacing any previous record.
    ///
    /// The payload is compressed and framed before anything is touched, so a
    /// [`RegionError::RecordTooLarge`] failure leaves the slot and the file
    /// unchanged. Otherwise the old record's sectors are released first and
    /// may be reused by the new record.
    ///
    /// If writing the new record fails, its sectors go back to the allocator.
    /// The old record is restored when the new one was placed elsewhere in
    /// the file; when the two spans overlap the old bytes may already be
    /// damaged, so the slot is left empty.
    pub fn put(&mut self, index: usize, payload: &[u8], timestamp: u32, codec: Codec) -> Result<()> {
        check_index(index)?;
        self.ensure_open()?;

        let compressed = codec.compress_with_level(payload, self.compression_level)?;
        let mut framed = frame_record(codec.tag(), &compressed)?;
        let sectors = sectors_for(framed.len()) as u32;
        pad_to_sector(&mut framed);

        let previous = self.header.block(index).map(|old| {
            (old, self.header.entry(index), self.header.timestamp(index))
        });
        if let Some((old, _, _)) = previous {
            self.allocator.release(old);
            self.header.clear(index);
            self.dirty = true;
        }

        let block = self.allocator.allocate(sectors);
        let written = pack_slot_entry(block.start, block.count).and_then(|entry| {
            let file = self.handle()?;
            file.seek(SeekFrom::Start(block.start as u64 * SECTOR_BYTES as u64))?;
            file.write_all(&framed)?;
            Ok(entry)
        });
        let entry = match written {
            Ok(entry) => entry,
            Err(e) => {
                self.abandon_write(index, block, previous);
                return Err(e);
            }
        };

        self.header.set(index, entry, timestamp);
        self.dirty = true;
        trace!(
            index,
            start = block.start,
            sectors,
            codec = codec.name(),
            "wrote record"
        );
        Ok(())
    }

    /// Undoes the bookkeeping of a `put` whose record never made it to disk.
    fn abandon_write(
        &mut self,
        index: usize,
        block: SectorBlock,
        previous: Option<(SectorBlock, u32, u32)>,
    ) {
        self.allocator.release(block);
        let Some((old, entry, timestamp)) = previous else {
            return;
        };
        let overlaps = old.start < block.end() && block.start < old.end();
        if !overlaps && self.allocator.reserve(old) {
            self.header.set(index, entry, timestamp);
            warn!(index, start = old.start, "record write failed, kept previous record");
        } else {
            warn!(index, start = old.start, "record write failed, previous record dropped");
        }
    }

    /// Empties `index`, returning its sectors to the allocator.
    ///
    /// Returns `true` if the slot was occupied. The timestamp entry is left
    /// as it was.
    pub fn remove(&mut self, index: usize) -> Result<bool> {
        check_index(index)?;
        self.ensure_open()?;
        match self.header.block(index) {
            Some(block) => {
                self.allocator.release(block);
                self.header.clear(index);
                self.dirty = true;
                trace!(index, start = block.start, count = block.count, "removed record");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Returns `true` if `index` holds a record.
    pub fn contains(&self, index: usize) -> Result<bool> {
        check_index(index)?;
        self.ensure_open()?;
        Ok(self.header.block(index).is_some())
    }

    /// Stored timestamp of an occupied slot.
    pub fn timestamp(&self, index: usize) -> Result<Option<u32>> {
        check_index(index)?;
        self.ensure_open()?;
        Ok(self
            .header
            .block(index)
            .map(|_| self.header.timestamp(index)))
    }

    /// Sector span of the record in `index`.
    pub fn block(&self, index: usize) -> Result<Option<SectorBlock>> {
        check_index(index)?;
        self.ensure_open()?;
        Ok(self.header.block(index))
    }

    /// Iterates every record in ascending file order.
    ///
    /// Uses the in-memory header, so records written since the last flush
    /// are included.
    pub fn scan(&mut self) -> Result<RegionScan<&mut F>> {
        let file = self.file.as_mut().ok_or(RegionError::Closed)?;
        Ok(RegionScan::from_header(&self.header, file))
    }

    /// Rewrites both header sectors and flushes the handle.
    pub fn flush(&mut self) -> Result<()> {
        let file = self.file.as_mut().ok_or(RegionError::Closed)?;
        self.header.write_to(file)?;
        file.flush()?;
        self.dirty = false;
        Ok(())
    }

    /// Flushes the header and releases the handle. Later operations fail
    /// with [`RegionError::Closed`]; closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let result = self.flush();
        self.file = None;
        debug!(occupied = self.header.occupied_count(), "region closed");
        result
    }

    /// Flushes the header and hands back the underlying handle.
    pub fn into_inner(mut self) -> Result<F> {
        self.flush()?;
        self.file.take().ok_or(RegionError::Closed)
    }

    /// Sets the level used for deflate-based codecs on later `put`s.
    pub fn set_compression_level(&mut self, level: u32) {
        self.compression_level = level;
    }

    #[must_use]
    pub fn compression_level(&self) -> u32 {
        self.compression_level
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.header.occupied_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// The allocator's current view of the file.
    #[must_use]
    pub fn allocator(&self) -> &SectorAllocator {
        &self.allocator
    }

    /// The in-memory header tables.
    #[must_use]
    pub fn header(&self) -> &RegionHeader {
        &self.header
    }
}

impl<F: Read + Write + Seek> fmt::Debug for RegionStore<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionStore")
            .field("occupied", &self.header.occupied_count())
            .field("frontier", &self.allocator.frontier())
            .field("free_blocks", &self.allocator.free_blocks().len())
            .field("free_sectors", &self.allocator.free_sectors())
            .field("dirty", &self.dirty)
            .field("closed", &self.file.is_none())
            .finish()
    }
}

impl<F: Read + Write + Seek> Drop for RegionStore<F> {
    fn drop(&mut self) {
        if self.file.is_some() && self.dirty {
            if let Err(e) = self.flush() {
                warn!(error = %e, "failed to write region header on drop");
            }
        }
    }
}
