/// Compaction: repacks a region file so its records sit back to back.
///
/// Random-access rewrites leave holes wherever a record shrank or moved.
/// Compaction streams every record through [`RegionScan`] (file order) into
/// a [`RegionWriter`], so the output has no free sectors at all. Each record
/// keeps its codec and timestamp, and is re-compressed at the requested
/// level (the codec default unless one is given). The result is written to a temp file,
/// synced, and renamed over the destination.
use anyhow::{Context, Result};
use codec::DEFAULT_LEVEL;
use region::{RegionScan, RegionWriter, SECTOR_BYTES};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::TMP_SUFFIX;

/// Outcome of one compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionStats {
    /// Records copied.
    pub records: usize,
    /// File size before, in sectors (rounded up).
    pub sectors_before: u64,
    /// File size after, in sectors.
    pub sectors_after: u64,
}

impl CompactionStats {
    /// Sectors given back by the compaction.
    #[must_use]
    pub fn reclaimed(&self) -> u64 {
        self.sectors_before.saturating_sub(self.sectors_after)
    }
}

fn tmp_path_for(dst: &Path) -> PathBuf {
    let mut name = dst
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(TMP_SUFFIX);
    dst.with_file_name(name)
}

/// Rewrites region file `src` into `dst` with every record packed
/// contiguously. `src` and `dst` may be the same path.
///
/// Records are re-compressed at [`DEFAULT_LEVEL`]; see
/// [`compact_region_file_with_level`].
///
/// # Errors
///
/// Fails if any record cannot be read or written; the temp file is removed
/// and `dst` is left untouched.
pub fn compact_region_file<P1: AsRef<Path>, P2: AsRef<Path>>(
    src: P1,
    dst: P2,
) -> Result<CompactionStats> {
    compact_region_file_with_level(src, dst, DEFAULT_LEVEL)
}

/// Like [`compact_region_file`], re-compressing deflate-based records at
/// `level`.
pub fn compact_region_file_with_level<P1: AsRef<Path>, P2: AsRef<Path>>(
    src: P1,
    dst: P2,
    level: u32,
) -> Result<CompactionStats> {
    let src = src.as_ref();
    let dst = dst.as_ref();
    let tmp_path = tmp_path_for(dst);

    let size = std::fs::metadata(src)
        .with_context(|| format!("failed to stat {}", src.display()))?
        .len();
    let sectors_before = size.div_ceil(SECTOR_BYTES as u64);

    let result = copy_records(src, &tmp_path, level);
    let (records, sectors_after) = match result {
        Ok(done) => done,
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
    };

    std::fs::rename(&tmp_path, dst)
        .with_context(|| format!("failed to move compacted region to {}", dst.display()))?;

    // Fsync the parent directory so the rename survives a crash.
    if let Some(parent) = dst.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    let stats = CompactionStats {
        records,
        sectors_before,
        sectors_after,
    };
    info!(
        path = %dst.display(),
        records,
        sectors_before,
        sectors_after,
        level,
        "region compacted"
    );
    Ok(stats)
}

/// Streams every record of `src` into a new file at `tmp_path`.
fn copy_records(src: &Path, tmp_path: &Path, level: u32) -> Result<(usize, u64)> {
    let scan = RegionScan::open(src)
        .with_context(|| format!("failed to open {} for compaction", src.display()))?;
    let mut writer = RegionWriter::create(tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;
    writer.set_compression_level(level);

    let mut records = 0usize;
    for entry in scan {
        let entry = entry.with_context(|| format!("failed to read record from {}", src.display()))?;
        writer
            .write(entry.index, &entry.payload, entry.timestamp, entry.codec)
            .with_context(|| format!("failed to copy slot {}", entry.index))?;
        records += 1;
    }

    let sectors_after = u64::from(writer.cursor_sector());
    let file = writer.finish()?;
    file.sync_all()?;
    Ok((records, sectors_after))
}
