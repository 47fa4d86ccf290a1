//! # Sector Allocator
//!
//! In-memory free-space tracker for a region file. The file is treated as a
//! linear address space of fixed 4096-byte **sectors**; sectors 0 and 1 hold
//! the two header tables and are never handed out.
//!
//! The allocator performs no I/O. The region store owns one and keeps it in
//! step with its slot table: [`SectorAllocator::sync`] rebuilds the state from
//! a table snapshot, and [`allocate`](SectorAllocator::allocate) /
//! [`release`](SectorAllocator::release) update it as records move.
//!
//! ## Layout
//!
//! ```text
//!  0   1   2                                   frontier
//! ┌───┬───┬──────┬──────┬──────┬──────┬───────┐
//! │hdr│hdr│ used │ free │ used │ free │ used  │  (nothing beyond)
//! └───┴───┴──────┴──────┴──────┴──────┴───────┘
//! ```
//!
//! The free list is kept sorted by start sector, and neighbouring free blocks
//! are always merged. Free space that reaches the append frontier is never
//! tracked as a block: the frontier is pulled back instead.
//!
//! ## Example
//!
//! ```rust
//! use allocator::{SectorAllocator, SectorBlock};
//!
//! let mut alloc = SectorAllocator::new();
//! let a = alloc.allocate(3);
//! assert_eq!(a, SectorBlock::new(2, 3));
//! alloc.release(a);
//! assert_eq!(alloc.frontier(), 2);
//! ```

use thiserror::Error;

/// Number of slots in a region's slot table.
pub const SLOT_COUNT: usize = 1024;

/// Sectors reserved at the start of every region for the slot and
/// timestamp tables.
pub const HEADER_SECTORS: u32 = 2;

/// A half-open span of sectors `[start, start + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectorBlock {
    /// First sector of the span.
    pub start: u32,
    /// Number of sectors in the span.
    pub count: u32,
}

impl SectorBlock {
    pub const fn new(start: u32, count: u32) -> Self {
        Self { start, count }
    }

    /// One past the last sector of the span.
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.start + self.count
    }

    /// Returns `true` if the two spans touch without overlapping.
    #[must_use]
    pub const fn is_adjacent(&self, other: &SectorBlock) -> bool {
        self.end() == other.start || other.end() == self.start
    }

    /// Decodes a packed slot-table entry: `(start << 8) | count`.
    ///
    /// Returns `None` for the empty entry `0`.
    #[must_use]
    pub const fn from_slot_entry(entry: u32) -> Option<SectorBlock> {
        if entry == 0 {
            None
        } else {
            Some(SectorBlock::new(entry >> 8, entry & 0xFF))
        }
    }
}

/// Errors returned by [`SectorAllocator::sync`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    /// The slot table snapshot did not have exactly [`SLOT_COUNT`] entries.
    #[error("slot table has {0} entries, expected {expected}", expected = SLOT_COUNT)]
    InvalidTableLength(usize),
}

/// First-fit sector allocator with merge-on-release and tail shrinking.
///
/// Not thread-safe; the owning store mutates it through `&mut self`.
///
/// Releasing a block that was never allocated (or releasing twice) corrupts
/// the free list. Release builds do not check this. Debug builds keep a
/// bitmap of live sectors and panic on such a release.
#[derive(Debug, Clone)]
pub struct SectorAllocator {
    /// Free spans, sorted by start, pairwise disjoint and non-adjacent.
    free: Vec<SectorBlock>,
    /// First sector not claimed by any allocated or free block.
    frontier: u32,
    #[cfg(debug_assertions)]
    live: LiveSectors,
}

impl Default for SectorAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SectorAllocator {
    /// Creates an allocator for an empty region (frontier at sector 2).
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            frontier: HEADER_SECTORS,
            #[cfg(debug_assertions)]
            live: LiveSectors::default(),
        }
    }

    /// Builds an allocator directly from a free list and frontier.
    ///
    /// `free` is sorted by start but otherwise taken as-is (adjacent blocks
    /// are not merged), so callers can reproduce any bookkeeping state.
    /// Every sector in `[2, frontier)` not covered by `free` is considered
    /// allocated.
    pub fn from_parts(mut free: Vec<SectorBlock>, frontier: u32) -> Self {
        free.sort_unstable();
        #[cfg(debug_assertions)]
        let live = {
            let mut live = LiveSectors::default();
            let mut cursor = HEADER_SECTORS;
            for block in &free {
                if block.start > cursor {
                    live.mark(SectorBlock::new(cursor, block.start - cursor));
                }
                cursor = cursor.max(block.end());
            }
            if frontier > cursor {
                live.mark(SectorBlock::new(cursor, frontier - cursor));
            }
            live
        };
        Self {
            free,
            frontier,
            #[cfg(debug_assertions)]
            live,
        }
    }

    /// Rebuilds the allocator state from a slot table snapshot.
    ///
    /// Every non-zero entry is decoded into a used block. The gaps between
    /// sector 2 and the first used block, and between consecutive used
    /// blocks, become the free list. The frontier is the end of the last used
    /// block, or 2 for an empty table.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidTableLength`] if `slot_table` does not
    /// have exactly [`SLOT_COUNT`] entries. The previous state is kept.
    pub fn sync(&mut self, slot_table: &[u32]) -> Result<(), SyncError> {
        if slot_table.len() != SLOT_COUNT {
            return Err(SyncError::InvalidTableLength(slot_table.len()));
        }

        let mut used: Vec<SectorBlock> = slot_table
            .iter()
            .filter_map(|&entry| SectorBlock::from_slot_entry(entry))
            .filter(|block| block.count > 0)
            .collect();
        used.sort_unstable();

        self.free.clear();
        #[cfg(debug_assertions)]
        {
            self.live = LiveSectors::default();
        }

        let mut cursor = HEADER_SECTORS;
        for block in &used {
            if block.start > cursor {
                self.free.push(SectorBlock::new(cursor, block.start - cursor));
            }
            // Overlapping entries in a damaged table must not move the
            // cursor backwards.
            cursor = cursor.max(block.end());
            #[cfg(debug_assertions)]
            self.live.mark(*block);
        }
        self.frontier = cursor;
        Ok(())
    }

    /// Allocates `n` contiguous sectors.
    ///
    /// Takes the first free block (lowest start) with at least `n` sectors,
    /// consuming it from the front. When nothing fits, the span is appended
    /// at the frontier and the frontier advances. Allocation never fails.
    pub fn allocate(&mut self, n: u32) -> SectorBlock {
        debug_assert!(n > 0, "allocation of zero sectors");

        let block = match self.free.iter().position(|b| b.count >= n) {
            Some(pos) => {
                let candidate = self.free[pos];
                if candidate.count == n {
                    self.free.remove(pos);
                } else {
                    self.free[pos] = SectorBlock::new(candidate.start + n, candidate.count - n);
                }
                SectorBlock::new(candidate.start, n)
            }
            None => {
                let block = SectorBlock::new(self.frontier, n);
                self.frontier += n;
                block
            }
        };

        #[cfg(debug_assertions)]
        self.live.mark(block);
        block
    }

    /// Returns `block` to the free list.
    ///
    /// The block is merged with a free neighbour on either side. If the result
    /// touches the frontier it is dropped and the frontier moves down to its
    /// start, repeating while the new last free block also touches it.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if any sector of `block` is not currently
    /// allocated.
    pub fn release(&mut self, block: SectorBlock) {
        if block.count == 0 {
            return;
        }
        #[cfg(debug_assertions)]
        self.live.unmark(block);

        let pos = self.free.partition_point(|b| b.start < block.start);
        let mut merged = block;
        let mut insert_at = pos;

        if pos < self.free.len() && self.free[pos].start == merged.end() {
            merged.count += self.free[pos].count;
            self.free.remove(pos);
        }
        if pos > 0 && self.free[pos - 1].end() == merged.start {
            let left = self.free.remove(pos - 1);
            merged = SectorBlock::new(left.start, left.count + merged.count);
            insert_at = pos - 1;
        }
        self.free.insert(insert_at, merged);

        self.shrink_tail();
    }

    /// Marks the exact span `block` as allocated again.
    ///
    /// The span must be entirely free: either inside one free block (which
    /// is split around it) or at or beyond the frontier (the frontier moves
    /// up to its end and any gap before it becomes free). Returns `false`
    /// and changes nothing if any sector of `block` is in use.
    pub fn reserve(&mut self, block: SectorBlock) -> bool {
        if block.count == 0 {
            return true;
        }

        if block.start >= self.frontier {
            if block.start > self.frontier {
                self.free
                    .push(SectorBlock::new(self.frontier, block.start - self.frontier));
            }
            self.frontier = block.end();
        } else {
            let Some(pos) = self
                .free
                .iter()
                .position(|b| b.start <= block.start && block.end() <= b.end())
            else {
                return false;
            };
            let host = self.free.remove(pos);
            let mut at = pos;
            if host.start < block.start {
                self.free
                    .insert(at, SectorBlock::new(host.start, block.start - host.start));
                at += 1;
            }
            if block.end() < host.end() {
                self.free
                    .insert(at, SectorBlock::new(block.end(), host.end() - block.end()));
            }
        }

        #[cfg(debug_assertions)]
        self.live.mark(block);
        true
    }

    /// Pulls the frontier back over every free block that ends on it.
    fn shrink_tail(&mut self) {
        while let Some(last) = self.free.last().copied() {
            if last.end() != self.frontier {
                break;
            }
            self.free.pop();
            self.frontier = last.start;
        }
    }

    /// First sector not claimed by any allocated or free block.
    #[must_use]
    pub fn frontier(&self) -> u32 {
        self.frontier
    }

    /// The free list, sorted by start sector.
    #[must_use]
    pub fn free_blocks(&self) -> &[SectorBlock] {
        &self.free
    }

    /// Total number of sectors on the free list.
    #[must_use]
    pub fn free_sectors(&self) -> u32 {
        self.free.iter().map(|b| b.count).sum()
    }
}

/// Debug-only bitmap of sectors handed out by the allocator.
#[cfg(debug_assertions)]
#[derive(Debug, Clone, Default)]
struct LiveSectors {
    words: Vec<u64>,
}

#[cfg(debug_assertions)]
impl LiveSectors {
    fn is_set(&self, sector: u32) -> bool {
        let (word, bit) = (sector as usize / 64, sector % 64);
        self.words.get(word).is_some_and(|w| w & (1u64 << bit) != 0)
    }

    fn mark(&mut self, block: SectorBlock) {
        for sector in block.start..block.end() {
            let (word, bit) = (sector as usize / 64, sector % 64);
            if word >= self.words.len() {
                self.words.resize(word + 1, 0);
            }
            self.words[word] |= 1u64 << bit;
        }
    }

    fn unmark(&mut self, block: SectorBlock) {
        for sector in block.start..block.end() {
            assert!(
                self.is_set(sector),
                "release of sector {} which is not allocated (block {:?})",
                sector,
                block
            );
            self.words[sector as usize / 64] &= !(1u64 << (sector % 64));
        }
    }
}
