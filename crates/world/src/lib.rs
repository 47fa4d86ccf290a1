//! # World - chunk storage over a directory of region files
//!
//! Maps chunk coordinates onto region files and keeps a bounded set of
//! [`RegionStore`]s open.
//!
//! ```text
//! chunk (cx, cz)
//!   |  region = (cx >> 5, cz >> 5)
//!   |  slot   = (cz & 31) * 32 + (cx & 31)
//!   v
//! <dir>/r.<rx>.<rz>.mca  ──>  RegionStore (cached, at most max_open)
//! ```
//!
//! Reads never create files: a chunk in a region with no file on disk is
//! simply absent. The first write to a region creates its file.
//!
//! | Module         | Purpose                                              |
//! |----------------|------------------------------------------------------|
//! | [`lib.rs`]     | `RegionDirectory`, open-store cache, `Debug`, `Drop` |
//! | [`compaction`] | Offline repacking of a region file (temp + rename)   |
mod compaction;

pub use compaction::{compact_region_file, compact_region_file_with_level, CompactionStats};

use anyhow::{Context, Result};
use codec::Codec;
use config::RegionConfig;
use region::{slot_index_of, RegionStore, ScanEntry};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Extension of region files.
pub const REGION_EXTENSION: &str = "mca";

/// Suffix of half-written compaction output.
pub(crate) const TMP_SUFFIX: &str = ".mca.tmp";

/// Region coordinates `(rx, rz)`.
pub type RegionPos = (i32, i32);

/// Region that holds chunk `(cx, cz)`.
#[must_use]
pub fn region_of(cx: i32, cz: i32) -> RegionPos {
    (cx >> 5, cz >> 5)
}

/// File name of region `(rx, rz)`.
#[must_use]
pub fn region_file_name(rx: i32, rz: i32) -> String {
    format!("r.{}.{}.{}", rx, rz, REGION_EXTENSION)
}

/// Parses `r.<rx>.<rz>.mca` back into region coordinates.
#[must_use]
pub fn parse_region_file_name(name: &str) -> Option<RegionPos> {
    let rest = name.strip_prefix("r.")?;
    let rest = rest.strip_suffix(REGION_EXTENSION)?.strip_suffix('.')?;
    let (rx, rz) = rest.split_once('.')?;
    Some((rx.parse().ok()?, rz.parse().ok()?))
}

/// A directory of region files addressed by chunk coordinates.
///
/// Stores are opened on demand and cached. When more than `max_open` stores
/// would be open, the one opened longest ago is flushed and closed first.
pub struct RegionDirectory {
    dir: PathBuf,
    open: HashMap<RegionPos, RegionStore>,
    /// Open regions, oldest first.
    order: VecDeque<RegionPos>,
    max_open: usize,
    codec: Codec,
    compression_level: u32,
}

impl std::fmt::Debug for RegionDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionDirectory")
            .field("dir", &self.dir)
            .field("codec", &self.codec)
            .field("compression_level", &self.compression_level)
            .field("max_open", &self.max_open)
            .field("open_regions", &self.order)
            .finish()
    }
}

impl RegionDirectory {
    /// Opens the directory named by `config`, creating it if needed.
    pub fn open(config: &RegionConfig) -> Result<Self> {
        Self::new(
            &config.dir,
            config.codec,
            config.compression_level,
            config.max_open_regions,
        )
    }

    /// Opens `dir` with explicit settings.
    ///
    /// Leftover `.mca.tmp` files from an interrupted compaction are removed.
    pub fn new<P: AsRef<Path>>(
        dir: P,
        codec: Codec,
        compression_level: u32,
        max_open: usize,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create region dir {}", dir.display()))?;
        Self::cleanup_tmp_files(&dir);

        info!(
            dir = %dir.display(),
            codec = codec.name(),
            level = compression_level,
            max_open,
            "region directory opened"
        );

        Ok(Self {
            dir,
            open: HashMap::new(),
            order: VecDeque::new(),
            max_open: max_open.max(1),
            codec,
            compression_level,
        })
    }

    fn cleanup_tmp_files(dir: &Path) {
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let p = entry.path();
                if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
                    if name.ends_with(TMP_SUFFIX) {
                        warn!(path = %p.display(), "removing leftover compaction output");
                        let _ = std::fs::remove_file(&p);
                    }
                }
            }
        }
    }

    /// Path of the file backing region `(rx, rz)`.
    #[must_use]
    pub fn region_path(&self, rx: i32, rz: i32) -> PathBuf {
        self.dir.join(region_file_name(rx, rz))
    }

    /// Returns the store for `pos`, opening it if needed.
    ///
    /// With `create == false` a region without a file yields `None` and
    /// nothing is created.
    fn store(&mut self, pos: RegionPos, create: bool) -> Result<Option<&mut RegionStore>> {
        if !self.open.contains_key(&pos) {
            let path = self.region_path(pos.0, pos.1);
            if !create && !path.exists() {
                return Ok(None);
            }
            while self.open.len() >= self.max_open {
                self.evict_oldest()?;
            }

            let mut store = RegionStore::open(&path)
                .with_context(|| format!("failed to open region {}", path.display()))?;
            store.set_compression_level(self.compression_level);
            debug!(rx = pos.0, rz = pos.1, open = self.open.len() + 1, "region cached");
            self.open.insert(pos, store);
            self.order.push_back(pos);
        }
        Ok(self.open.get_mut(&pos))
    }

    fn evict_oldest(&mut self) -> Result<()> {
        let Some(pos) = self.order.pop_front() else {
            return Ok(());
        };
        if let Some(mut store) = self.open.remove(&pos) {
            debug!(rx = pos.0, rz = pos.1, "evicting region");
            store
                .close()
                .with_context(|| format!("failed to close region ({}, {})", pos.0, pos.1))?;
        }
        Ok(())
    }

    /// Removes `pos` from the cache and closes its store.
    fn close_region(&mut self, pos: RegionPos) -> Result<()> {
        self.order.retain(|p| *p != pos);
        if let Some(mut store) = self.open.remove(&pos) {
            store
                .close()
                .with_context(|| format!("failed to close region ({}, {})", pos.0, pos.1))?;
        }
        Ok(())
    }

    /// Reads chunk `(cx, cz)`: its payload and stored timestamp.
    pub fn get_chunk(&mut self, cx: i32, cz: i32) -> Result<Option<(Vec<u8>, u32)>> {
        let Some(store) = self.store(region_of(cx, cz), false)? else {
            return Ok(None);
        };
        let found = store
            .get(slot_index_of(cx, cz))
            .with_context(|| format!("failed to read chunk ({}, {})", cx, cz))?;
        Ok(found)
    }

    /// Writes chunk `(cx, cz)` with the configured codec, creating the
    /// region file on first use.
    pub fn put_chunk(&mut self, cx: i32, cz: i32, payload: &[u8], timestamp: u32) -> Result<()> {
        let codec = self.codec;
        let store = self
            .store(region_of(cx, cz), true)?
            .context("region store unavailable")?;
        store
            .put(slot_index_of(cx, cz), payload, timestamp, codec)
            .with_context(|| format!("failed to write chunk ({}, {})", cx, cz))
    }

    /// Deletes chunk `(cx, cz)`. Returns `true` if it existed.
    pub fn remove_chunk(&mut self, cx: i32, cz: i32) -> Result<bool> {
        let Some(store) = self.store(region_of(cx, cz), false)? else {
            return Ok(false);
        };
        store
            .remove(slot_index_of(cx, cz))
            .with_context(|| format!("failed to delete chunk ({}, {})", cx, cz))
    }

    pub fn contains_chunk(&mut self, cx: i32, cz: i32) -> Result<bool> {
        match self.store(region_of(cx, cz), false)? {
            Some(store) => Ok(store.contains(slot_index_of(cx, cz))?),
            None => Ok(false),
        }
    }

    /// Reads every chunk of region `(rx, rz)` in file order.
    pub fn scan_region(&mut self, rx: i32, rz: i32) -> Result<Vec<ScanEntry>> {
        let Some(store) = self.store((rx, rz), false)? else {
            return Ok(Vec::new());
        };
        let entries = store
            .scan()?
            .collect_all()
            .with_context(|| format!("failed to scan region ({}, {})", rx, rz))?;
        Ok(entries)
    }

    /// Region coordinates of every region file in the directory, sorted.
    pub fn list_regions(&self) -> Result<Vec<RegionPos>> {
        let mut regions: Vec<RegionPos> = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(parse_region_file_name))
            .collect();
        // stores opened but not yet flushed may have no file yet
        for pos in self.open.keys() {
            if !regions.contains(pos) {
                regions.push(*pos);
            }
        }
        regions.sort_unstable();
        Ok(regions)
    }

    /// Repacks region `(rx, rz)` in place at the directory's compression
    /// level. Returns `None` if the region has no file.
    pub fn compact_region(&mut self, rx: i32, rz: i32) -> Result<Option<CompactionStats>> {
        self.close_region((rx, rz))?;
        let path = self.region_path(rx, rz);
        if !path.exists() {
            return Ok(None);
        }
        let stats = compact_region_file_with_level(&path, &path, self.compression_level)?;
        Ok(Some(stats))
    }

    /// Writes the header of every open store.
    pub fn flush_all(&mut self) -> Result<()> {
        for (pos, store) in self.open.iter_mut() {
            store
                .flush()
                .with_context(|| format!("failed to flush region ({}, {})", pos.0, pos.1))?;
        }
        Ok(())
    }

    /// Flushes and closes every open store.
    ///
    /// Every store is closed even if an earlier one fails; the first error
    /// is returned.
    pub fn close_all(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(pos) = self.order.pop_front() {
            if let Some(mut store) = self.open.remove(&pos) {
                if let Err(e) = store.close() {
                    warn!(rx = pos.0, rz = pos.1, error = %e, "failed to close region");
                    first_err.get_or_insert(
                        anyhow::Error::new(e)
                            .context(format!("failed to close region ({}, {})", pos.0, pos.1)),
                    );
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn codec(&self) -> Codec {
        self.codec
    }

    #[must_use]
    pub fn compression_level(&self) -> u32 {
        self.compression_level
    }

    /// Number of stores currently open.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    #[must_use]
    pub fn max_open(&self) -> usize {
        self.max_open
    }
}

/// Best-effort close on drop. Errors are logged by `close_all`.
impl Drop for RegionDirectory {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}
