use allocator::{HEADER_SECTORS, SLOT_COUNT};
use codec::{Codec, DEFAULT_LEVEL};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, trace, warn};

use crate::format::{
    check_index, frame_record, pack_slot_entry, pad_to_sector, sectors_for, RegionHeader,
    HEADER_BYTES, SECTOR_BYTES,
};
use crate::{RegionError, Result};

/// Forward-only region writer for bulk generation.
///
/// Records are appended back to back starting at sector 2; there is no
/// allocator and no way to revisit a slot. The only backwards seek is the
/// header patch in [`close`](RegionWriter::close).
///
/// Until `close` runs, the header sectors on disk are zeros and the file
/// reads as an empty region. Dropping the writer without closing it loses the
/// header (a warning is logged).
///
/// # Example
///
/// ```rust,no_run
/// use region::{Codec, RegionWriter};
///
/// let mut w = RegionWriter::create("r.0.0.mca").unwrap();
/// w.write(0, b"chunk data", 1_700_000_000, Codec::Zlib).unwrap();
/// w.close().unwrap();
/// ```
pub struct RegionWriter<W: Write + Seek = File> {
    out: Option<BufWriter<W>>,
    header: RegionHeader,
    written: Vec<bool>,
    /// Next free sector; always the end of the last record written.
    cursor: u32,
    /// Bytes emitted so far, including the zeroed header.
    position: u64,
    compression_level: u32,
}

impl RegionWriter<File> {
    /// Creates (or truncates) the file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "streaming region writer created");
        Self::new(file)
    }
}

impl<W: Write + Seek> RegionWriter<W> {
    /// Starts a region on `inner`, zero-filling the two header sectors.
    pub fn new(inner: W) -> Result<Self> {
        let mut out = BufWriter::new(inner);
        out.seek(SeekFrom::Start(0))?;
        out.write_all(&[0u8; HEADER_BYTES])?;
        Ok(Self {
            out: Some(out),
            header: RegionHeader::empty(),
            written: vec![false; SLOT_COUNT],
            cursor: HEADER_SECTORS,
            position: HEADER_BYTES as u64,
            compression_level: DEFAULT_LEVEL,
        })
    }

    /// Appends the record for `index`.
    ///
    /// # Errors
    ///
    /// - [`RegionError::Closed`] after [`close`](RegionWriter::close).
    /// - [`RegionError::OutOfRange`] for `index >= 1024`.
    /// - [`RegionError::AlreadyWritten`] if `index` was written before; the
    ///   earlier record is untouched.
    /// - [`RegionError::RecordTooLarge`] if the record needs over 255 sectors.
    pub fn write(&mut self, index: usize, payload: &[u8], timestamp: u32, codec: Codec) -> Result<()> {
        if self.out.is_none() {
            return Err(RegionError::Closed);
        }
        check_index(index)?;
        if self.written[index] {
            return Err(RegionError::AlreadyWritten(index));
        }

        let compressed = codec.compress_with_level(payload, self.compression_level)?;
        let mut framed = frame_record(codec.tag(), &compressed)?;
        let sectors = sectors_for(framed.len()) as u32;
        let entry = pack_slot_entry(self.cursor, sectors)?;
        pad_to_sector(&mut framed);

        debug_assert_eq!(
            self.position,
            self.cursor as u64 * SECTOR_BYTES as u64,
            "write cursor is not sector aligned"
        );

        let out = self.out.as_mut().ok_or(RegionError::Closed)?;
        out.write_all(&framed)?;

        self.header.set(index, entry, timestamp);
        self.written[index] = true;
        trace!(index, start = self.cursor, sectors, "appended record");
        self.cursor += sectors;
        self.position += framed.len() as u64;
        Ok(())
    }

    /// Writes both header tables at offset 0 and finalizes the file.
    ///
    /// Later calls to [`write`](RegionWriter::write) fail with
    /// [`RegionError::Closed`]; closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        self.finalize().map(|_| ())
    }

    /// Finalizes the file and hands back the underlying handle.
    pub fn finish(mut self) -> Result<W> {
        let out = self.finalize()?.ok_or(RegionError::Closed)?;
        out.into_inner().map_err(|e| RegionError::Io(e.into_error()))
    }

    fn finalize(&mut self) -> Result<Option<BufWriter<W>>> {
        let Some(mut out) = self.out.take() else {
            return Ok(None);
        };
        self.header.write_to(&mut out)?;
        out.flush()?;
        debug!(
            records = self.len(),
            sectors = self.cursor,
            "streaming region writer closed"
        );
        Ok(Some(out))
    }

    /// Sets the level used for deflate-based codecs on later writes.
    pub fn set_compression_level(&mut self, level: u32) {
        self.compression_level = level;
    }

    /// Number of records written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.written.iter().filter(|&&w| w).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `index` has been written.
    #[must_use]
    pub fn is_written(&self, index: usize) -> bool {
        self.written.get(index).copied().unwrap_or(false)
    }

    /// Sector where the next record will start.
    #[must_use]
    pub fn cursor_sector(&self) -> u32 {
        self.cursor
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.out.is_none()
    }
}

impl<W: Write + Seek> Drop for RegionWriter<W> {
    fn drop(&mut self) {
        if self.out.is_some() {
            warn!(
                records = self.len(),
                "region writer dropped without close; header tables were not written"
            );
        }
    }
}
