//! Locality-ordered scan over every record of a region.
//!
//! Slot order says nothing about where a record sits in the file, since
//! records are placed wherever the allocator found room. The scan sorts the
//! occupied slots by start sector so a full pass is one run of ascending
//! reads.

use allocator::SectorBlock;
use codec::Codec;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use tracing::debug;

use crate::format::{coordinates_of, read_record, RegionHeader};
use crate::Result;

/// One record produced by [`RegionScan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    /// Slot index.
    pub index: usize,
    /// Local x of the slot (`0..32`).
    pub x: i32,
    /// Local z of the slot (`0..32`).
    pub z: i32,
    /// Codec the record was stored with.
    pub codec: Codec,
    /// Decompressed payload.
    pub payload: Vec<u8>,
    /// Stored timestamp, epoch seconds.
    pub timestamp: u32,
    /// Where the record lives in the file.
    pub block: SectorBlock,
}

#[derive(Debug, Clone, Copy)]
struct PendingRecord {
    index: usize,
    block: SectorBlock,
    timestamp: u32,
}

/// Forward-only iterator over the occupied slots of a region, in ascending
/// start-sector order.
///
/// Yields `Result<ScanEntry>`; a failed record does not end the scan.
pub struct RegionScan<R: Read + Seek> {
    reader: R,
    pending: std::vec::IntoIter<PendingRecord>,
}

impl RegionScan<BufReader<File>> {
    /// Opens the region file at `path` read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> RegionScan<R> {
    /// Reads both header sectors from `reader` and prepares the scan.
    ///
    /// A source shorter than the header scans as an empty region.
    pub fn new(mut reader: R) -> Result<Self> {
        let header = RegionHeader::read_from(&mut reader)?.unwrap_or_default();
        Ok(Self::from_header(&header, reader))
    }

    /// Prepares a scan from an already decoded header.
    pub fn from_header(header: &RegionHeader, reader: R) -> Self {
        let mut pending: Vec<PendingRecord> = header
            .occupied()
            .map(|(index, block)| PendingRecord {
                index,
                block,
                timestamp: header.timestamp(index),
            })
            .collect();
        // Stable sort: ties (which only a damaged table has) keep index order.
        pending.sort_by_key(|p| p.block.start);
        debug!(records = pending.len(), "region scan prepared");

        Self {
            reader,
            pending: pending.into_iter(),
        }
    }

    /// Records not yet yielded.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Reads the next record, or `Ok(None)` once every slot was visited.
    pub fn next_entry(&mut self) -> Result<Option<ScanEntry>> {
        let Some(next) = self.pending.next() else {
            return Ok(None);
        };
        let (codec, payload) = read_record(&mut self.reader, next.block)?;
        let (x, z) = coordinates_of(next.index);
        Ok(Some(ScanEntry {
            index: next.index,
            x,
            z,
            codec,
            payload,
            timestamp: next.timestamp,
            block: next.block,
        }))
    }

    /// Collects all remaining records, stopping at the first error.
    pub fn collect_all(&mut self) -> Result<Vec<ScanEntry>> {
        let mut out = Vec::with_capacity(self.remaining());
        while let Some(entry) = self.next_entry()? {
            out.push(entry);
        }
        Ok(out)
    }
}

impl<R: Read + Seek> Iterator for RegionScan<R> {
    type Item = Result<ScanEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }
}
