//! # Config - runtime settings for region storage
//!
//! Settings are read from environment variables, falling back to defaults
//! when a variable is missing or cannot be parsed:
//!
//! ```text
//! REGION_DIR       Directory holding r.<x>.<z>.mca files (default: "data/region")
//! REGION_CODEC     Codec for new records: none | gzip | zlib (default: "zlib")
//! REGION_LEVEL     Compression level 0-9                 (default: 6)
//! REGION_MAX_OPEN  Region files kept open at once        (default: 16)
//! ```

use codec::{Codec, DEFAULT_LEVEL, MAX_LEVEL};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

pub const ENV_DIR: &str = "REGION_DIR";
pub const ENV_CODEC: &str = "REGION_CODEC";
pub const ENV_LEVEL: &str = "REGION_LEVEL";
pub const ENV_MAX_OPEN: &str = "REGION_MAX_OPEN";

/// Default directory for region files.
pub const DEFAULT_DIR: &str = "data/region";

/// Default number of region files held open by a directory.
pub const DEFAULT_MAX_OPEN: usize = 16;

/// Settings shared by the region directory and the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionConfig {
    /// Directory containing the region files.
    pub dir: PathBuf,
    /// Codec applied to newly written records.
    pub codec: Codec,
    /// Compression level for the deflate-based codecs.
    pub compression_level: u32,
    /// Maximum number of region files kept open at once (at least 1).
    pub max_open_regions: usize,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_DIR),
            codec: Codec::Zlib,
            compression_level: DEFAULT_LEVEL,
            max_open_regions: DEFAULT_MAX_OPEN,
        }
    }
}

impl RegionConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let dir = lookup(ENV_DIR)
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.dir);
        let codec = parse_or(&lookup, ENV_CODEC, defaults.codec);

        let mut compression_level = parse_or(&lookup, ENV_LEVEL, defaults.compression_level);
        if compression_level > MAX_LEVEL {
            warn!(level = compression_level, "{} above {}, clamping", ENV_LEVEL, MAX_LEVEL);
            compression_level = MAX_LEVEL;
        }

        let mut max_open_regions = parse_or(&lookup, ENV_MAX_OPEN, defaults.max_open_regions);
        if max_open_regions == 0 {
            warn!("{} must be at least 1, using 1", ENV_MAX_OPEN);
            max_open_regions = 1;
        }

        Self {
            dir,
            codec,
            compression_level,
            max_open_regions,
        }
    }
}

/// Parses `key` with `FromStr`, logging and falling back to `default` when
/// the value is malformed.
fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(value = %raw, "invalid {}, using default", key);
                default
            }
        },
        None => default,
    }
}
