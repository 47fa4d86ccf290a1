//! # CLI - interactive shell over a region directory
//!
//! Reads commands from stdin, runs them against a [`RegionDirectory`], and
//! prints results to stdout. Works interactively or with commands piped in.
//!
//! ## Commands
//!
//! ```text
//! PUT cx cz text...   Store text as the payload of chunk (cx, cz)
//! GET cx cz           Print a chunk's payload (or "(nil)")
//! DEL cx cz           Delete a chunk
//! SCAN rx rz          List every chunk of region (rx, rz) in file order
//! COMPACT rx rz       Repack region (rx, rz) without free sectors
//! REGIONS             List region files in the directory
//! FLUSH               Write the header of every open region
//! STATS               Print directory debug info
//! EXIT / QUIT         Close all regions and exit
//! ```
//!
//! ## Configuration
//!
//! ```text
//! REGION_DIR       Region directory                  (default: "data/region")
//! REGION_CODEC     none | gzip | zlib                (default: "zlib")
//! REGION_LEVEL     Compression level 0-9             (default: 6)
//! REGION_MAX_OPEN  Region files kept open at once    (default: 16)
//! RUST_LOG         Log filter, written to stderr     (default: "warn")
//! ```
//!
//! ## Example
//!
//! ```text
//! $ cargo run -p cli
//! region shell started (dir=data/region, codec=zlib, level=6, max_open=16)
//! > PUT 3 -2 hello world
//! OK
//! > GET 3 -2
//! hello world
//! > EXIT
//! bye
//! ```

use anyhow::Result;
use config::RegionConfig;
use std::io::{self, BufRead, Write};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use world::RegionDirectory;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Current time as epoch seconds, saturating at `u32::MAX`.
fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

/// Logs a failed command and prints its `ERR` line.
fn report_failure(cmd: &str, what: &str, e: &anyhow::Error) {
    warn!(command = cmd, error = %format!("{:#}", e), "command failed");
    println!("ERR {} failed: {:#}", what, e);
}

/// Parses the next two whitespace-separated tokens as an `i32` pair.
fn parse_pair<'a, I: Iterator<Item = &'a str>>(parts: &mut I) -> Option<(i32, i32)> {
    let a = parts.next()?.parse().ok()?;
    let b = parts.next()?.parse().ok()?;
    Some((a, b))
}

fn main() -> Result<()> {
    init_logging();

    let config = RegionConfig::from_env();
    let mut world = RegionDirectory::open(&config)?;
    info!(
        dir = %config.dir.display(),
        codec = %config.codec,
        level = config.compression_level,
        max_open = world.max_open(),
        "region directory opened"
    );

    println!(
        "region shell started (dir={}, codec={}, level={}, max_open={})",
        config.dir.display(),
        config.codec,
        config.compression_level,
        world.max_open()
    );
    println!("Commands: PUT cx cz text | GET cx cz | DEL cx cz | SCAN rx rz");
    println!("          COMPACT rx rz | REGIONS | FLUSH | STATS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();

    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        if let Some(cmd) = parts.next() {
            let upper = cmd.to_uppercase();
            debug!(command = %upper, "executing");
            match upper.as_str() {
                "PUT" => match parse_pair(&mut parts) {
                    Some((cx, cz)) => {
                        let text = parts.collect::<Vec<&str>>().join(" ");
                        if text.is_empty() {
                            println!("ERR usage: PUT cx cz text");
                        } else {
                            match world.put_chunk(cx, cz, text.as_bytes(), now_secs()) {
                                Ok(()) => println!("OK"),
                                Err(e) => report_failure(&upper, "put", &e),
                            }
                        }
                    }
                    None => println!("ERR usage: PUT cx cz text"),
                },
                "GET" => match parse_pair(&mut parts) {
                    Some((cx, cz)) => match world.get_chunk(cx, cz) {
                        Ok(Some((data, _ts))) => println!("{}", String::from_utf8_lossy(&data)),
                        Ok(None) => println!("(nil)"),
                        Err(e) => report_failure(&upper, "read", &e),
                    },
                    None => println!("ERR usage: GET cx cz"),
                },
                "DEL" => match parse_pair(&mut parts) {
                    Some((cx, cz)) => match world.remove_chunk(cx, cz) {
                        Ok(true) => println!("OK"),
                        Ok(false) => println!("(nil)"),
                        Err(e) => report_failure(&upper, "del", &e),
                    },
                    None => println!("ERR usage: DEL cx cz"),
                },
                "SCAN" => match parse_pair(&mut parts) {
                    Some((rx, rz)) => match world.scan_region(rx, rz) {
                        Ok(entries) if entries.is_empty() => println!("(empty)"),
                        Ok(entries) => {
                            for e in &entries {
                                println!(
                                    "{} {} [{} @{}] -> {}",
                                    rx * 32 + e.x,
                                    rz * 32 + e.z,
                                    e.codec,
                                    e.block.start,
                                    String::from_utf8_lossy(&e.payload)
                                );
                            }
                            println!("({} entries)", entries.len());
                        }
                        Err(e) => report_failure(&upper, "scan", &e),
                    },
                    None => println!("ERR usage: SCAN rx rz"),
                },
                "COMPACT" => match parse_pair(&mut parts) {
                    Some((rx, rz)) => match world.compact_region(rx, rz) {
                        Ok(Some(stats)) => println!(
                            "OK (records={}, sectors {} -> {})",
                            stats.records, stats.sectors_before, stats.sectors_after
                        ),
                        Ok(None) => println!("(no region)"),
                        Err(e) => report_failure(&upper, "compact", &e),
                    },
                    None => println!("ERR usage: COMPACT rx rz"),
                },
                "REGIONS" => match world.list_regions() {
                    Ok(regions) if regions.is_empty() => println!("(empty)"),
                    Ok(regions) => {
                        for (rx, rz) in &regions {
                            println!("{}", world::region_file_name(*rx, *rz));
                        }
                        println!("({} regions)", regions.len());
                    }
                    Err(e) => report_failure(&upper, "list", &e),
                },
                "FLUSH" => match world.flush_all() {
                    Ok(()) => println!("OK (open={})", world.open_count()),
                    Err(e) => report_failure(&upper, "flush", &e),
                },
                "STATS" => {
                    println!("{:?}", world);
                }
                "EXIT" | "QUIT" => {
                    println!("bye");
                    break;
                }
                other => {
                    debug!(command = other, "unknown command");
                    println!("unknown command: {}", other);
                }
            }
        }

        print!("> ");
        io::stdout().flush().ok();
    }

    world.close_all()?;
    info!(open_regions = world.open_count(), "shell exiting");
    Ok(())
}
