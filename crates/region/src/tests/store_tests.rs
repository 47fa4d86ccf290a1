use super::{memory_handle, noise, payload};
use crate::format::{pack_slot_entry, RegionHeader, HEADER_BYTES, MAX_RECORD_BYTES, SECTOR_BYTES};
use crate::{Codec, RegionError, RegionStore, SectorBlock};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use tempfile::tempdir;

type MemStore = RegionStore<Cursor<Vec<u8>>>;

/// Handle that reads and seeks normally but fails every write.
struct FailingWrites(Cursor<Vec<u8>>);

impl Read for FailingWrites {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Seek for FailingWrites {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

impl Write for FailingWrites {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::other("disk full"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Two one-sector records: slot 0 at sector 2, slot 1 at sector 3.
fn two_record_store_failing_writes() -> RegionStore<FailingWrites> {
    let mut store = new_store();
    store.put(0, b"first", 10, Codec::Uncompressed).unwrap();
    store.put(1, b"second", 20, Codec::Uncompressed).unwrap();
    let bytes = store.into_inner().unwrap().into_inner();
    RegionStore::from_handle(FailingWrites(Cursor::new(bytes))).unwrap()
}

/// Uncompressed payload that frames into exactly three sectors.
fn three_sector_payload() -> Vec<u8> {
    noise(21, 3 * SECTOR_BYTES - 100)
}

fn new_store() -> MemStore {
    RegionStore::from_handle(memory_handle()).unwrap()
}

/// Closes the store and reopens it from the bytes it produced.
fn reopen(store: MemStore) -> MemStore {
    let bytes = store.into_inner().unwrap().into_inner();
    RegionStore::from_handle(Cursor::new(bytes)).unwrap()
}

// -------------------- Open --------------------

#[test]
fn new_handle_opens_empty() {
    let store = new_store();
    assert!(store.is_empty());
    assert_eq!(store.allocator().frontier(), 2);
    assert!(store.allocator().free_blocks().is_empty());
}

#[test]
fn flush_of_new_store_writes_zeroed_header() {
    let store = new_store();
    let bytes = store.into_inner().unwrap().into_inner();
    assert_eq!(bytes.len(), HEADER_BYTES);
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn open_syncs_allocator_from_header() {
    let mut header = RegionHeader::empty();
    header.set(0, pack_slot_entry(5, 1).unwrap(), 0);
    header.set(1, pack_slot_entry(2, 1).unwrap(), 0);
    header.set(32, pack_slot_entry(3, 2).unwrap(), 0);
    header.set(33, pack_slot_entry(18, 1).unwrap(), 0);
    header.set(64, pack_slot_entry(9, 4).unwrap(), 0);

    let mut bytes = header.encode().unwrap();
    bytes.resize(19 * SECTOR_BYTES, 0);
    let store = RegionStore::from_handle(Cursor::new(bytes)).unwrap();

    assert_eq!(store.len(), 5);
    assert_eq!(store.allocator().frontier(), 19);
    assert_eq!(
        store.allocator().free_blocks(),
        &[SectorBlock::new(6, 3), SectorBlock::new(13, 5)]
    );
}

#[test]
fn open_clears_entries_pointing_into_header() {
    let mut header = RegionHeader::empty();
    header.set(7, (1 << 8) | 1, 0);
    let store = RegionStore::from_handle(Cursor::new(header.encode().unwrap())).unwrap();
    assert!(store.is_empty());
    assert!(!store.contains(7).unwrap());
}

#[test]
fn open_clears_overlapping_entries() {
    let mut header = RegionHeader::empty();
    header.set(0, pack_slot_entry(2, 2).unwrap(), 0);
    header.set(1, pack_slot_entry(3, 1).unwrap(), 0);
    let mut bytes = header.encode().unwrap();
    bytes.resize(4 * SECTOR_BYTES, 0);

    let mut store = RegionStore::from_handle(Cursor::new(bytes)).unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(store.block(0).unwrap(), Some(SectorBlock::new(2, 2)));
    assert!(!store.contains(1).unwrap());
    assert_eq!(store.allocator().frontier(), 4);

    // releasing what is left must not touch sectors claimed twice
    assert!(store.remove(0).unwrap());
    assert!(!store.remove(1).unwrap());
    assert_eq!(store.allocator().frontier(), 2);

    let store = reopen(store);
    assert!(store.is_empty());
}

// -------------------- Get / put --------------------

#[test]
fn put_then_get() {
    let mut store = new_store();
    let data = payload(1, 3_000);
    store.put(5, &data, 1_234, Codec::Zlib).unwrap();

    let (back, ts) = store.get(5).unwrap().unwrap();
    assert_eq!(back, data);
    assert_eq!(ts, 1_234);
    assert!(store.contains(5).unwrap());
    assert_eq!(store.timestamp(5).unwrap(), Some(1_234));
}

#[test]
fn get_empty_slot_is_none() {
    let mut store = new_store();
    assert!(store.get(0).unwrap().is_none());
    assert_eq!(store.timestamp(0).unwrap(), None);
}

#[test]
fn out_of_range_index_is_an_error() {
    let mut store = new_store();
    assert!(matches!(store.get(1024), Err(RegionError::OutOfRange(1024))));
    assert!(matches!(
        store.put(4096, b"x", 0, Codec::Uncompressed),
        Err(RegionError::OutOfRange(4096))
    ));
    assert!(matches!(store.remove(1024), Err(RegionError::OutOfRange(_))));
    assert!(matches!(store.contains(2000), Err(RegionError::OutOfRange(_))));
}

#[test]
fn every_codec_round_trips() {
    let mut store = new_store();
    for (i, codec) in Codec::ALL.into_iter().enumerate() {
        store.put(i, &payload(i as u8, 5_000), i as u32, codec).unwrap();
    }
    for (i, _) in Codec::ALL.into_iter().enumerate() {
        let (back, _) = store.get(i).unwrap().unwrap();
        assert_eq!(back, payload(i as u8, 5_000));
    }
}

#[test]
fn empty_payload_round_trips() {
    let mut store = new_store();
    store.put(3, b"", 0, Codec::Uncompressed).unwrap();
    let (back, _) = store.get(3).unwrap().unwrap();
    assert!(back.is_empty());
    assert_eq!(store.block(3).unwrap(), Some(SectorBlock::new(2, 1)));
}

#[test]
fn records_are_sector_aligned_and_padded() {
    let mut store = new_store();
    store.put(0, &noise(1, 5_000), 0, Codec::Uncompressed).unwrap();
    store.put(1, b"tiny", 0, Codec::Uncompressed).unwrap();

    assert_eq!(store.block(0).unwrap(), Some(SectorBlock::new(2, 2)));
    assert_eq!(store.block(1).unwrap(), Some(SectorBlock::new(4, 1)));

    let bytes = store.into_inner().unwrap().into_inner();
    assert_eq!(bytes.len(), 5 * SECTOR_BYTES);

    let second = &bytes[4 * SECTOR_BYTES..];
    assert_eq!(&second[..9], &[0, 0, 0, 5, 0, b't', b'i', b'n', b'y']);
    assert!(second[9..].iter().all(|&b| b == 0));
}

#[test]
fn data_survives_reopen() {
    let mut store = new_store();
    for i in (0..1024).step_by(37) {
        store.put(i, &payload(i as u8, 100 + i * 7), i as u32 * 10, Codec::Gzip).unwrap();
    }
    let mut store = reopen(store);
    for i in (0..1024).step_by(37) {
        let (back, ts) = store.get(i).unwrap().unwrap();
        assert_eq!(back, payload(i as u8, 100 + i * 7));
        assert_eq!(ts, i as u32 * 10);
    }
}

// -------------------- Rewrite & sector reuse --------------------

#[test]
fn overwrite_same_size_reuses_sectors() {
    let mut store = new_store();
    store.put(0, b"first", 1, Codec::Uncompressed).unwrap();
    store.put(1, b"other", 1, Codec::Uncompressed).unwrap();
    store.put(0, b"second", 2, Codec::Uncompressed).unwrap();

    assert_eq!(store.block(0).unwrap(), Some(SectorBlock::new(2, 1)));
    assert_eq!(store.allocator().frontier(), 4);
    assert_eq!(store.get(0).unwrap().unwrap(), (b"second".to_vec(), 2));
}

#[test]
fn growing_record_moves_and_frees_old_sectors() {
    let mut store = new_store();
    store.put(0, b"small", 0, Codec::Uncompressed).unwrap();
    store.put(1, b"pinned", 0, Codec::Uncompressed).unwrap();
    store.put(0, &noise(9, 3 * SECTOR_BYTES), 0, Codec::Uncompressed).unwrap();

    assert_eq!(store.block(0).unwrap(), Some(SectorBlock::new(4, 4)));
    assert_eq!(store.allocator().free_blocks(), &[SectorBlock::new(2, 1)]);

    // the freed sector is handed to the next small record
    store.put(2, b"fits", 0, Codec::Uncompressed).unwrap();
    assert_eq!(store.block(2).unwrap(), Some(SectorBlock::new(2, 1)));
    assert!(store.allocator().free_blocks().is_empty());
}

#[test]
fn shrinking_tail_record_pulls_frontier_back() {
    let mut store = new_store();
    store.put(0, b"head", 0, Codec::Uncompressed).unwrap();
    store.put(1, &noise(3, 4 * SECTOR_BYTES), 0, Codec::Uncompressed).unwrap();
    assert_eq!(store.allocator().frontier(), 8);

    store.put(1, b"short", 0, Codec::Uncompressed).unwrap();
    assert_eq!(store.block(1).unwrap(), Some(SectorBlock::new(3, 1)));
    assert_eq!(store.allocator().frontier(), 4);
    assert!(store.allocator().free_blocks().is_empty());
}

#[test]
fn many_rewrites_keep_file_bounded() {
    let mut store = new_store();
    for round in 0..50u32 {
        for i in 0..16usize {
            let len = 500 + ((round as usize * 31 + i * 17) % 9_000);
            store.put(i, &noise(u64::from(round) * 100 + i as u64, len), round, Codec::Uncompressed).unwrap();
        }
    }
    let live: u32 = (0..16usize)
        .map(|i| store.block(i).unwrap().unwrap().count)
        .sum();
    let alloc = store.allocator();
    assert_eq!(alloc.frontier() - 2, live + alloc.free_sectors());
    for i in 0..16usize {
        let len = 500 + ((49 * 31 + i * 17) % 9_000);
        assert_eq!(store.get(i).unwrap().unwrap().0, noise(4_900 + i as u64, len));
    }
}

// -------------------- Remove --------------------

#[test]
fn remove_frees_slot_and_keeps_timestamp() {
    let mut store = new_store();
    store.put(10, b"gone soon", 77, Codec::Zlib).unwrap();
    assert!(store.remove(10).unwrap());
    assert!(!store.remove(10).unwrap());

    assert!(store.get(10).unwrap().is_none());
    assert_eq!(store.header().timestamp(10), 77);
    assert_eq!(store.allocator().frontier(), 2);
}

#[test]
fn remove_all_reclaims_everything() {
    let mut store = new_store();
    for i in 0..64usize {
        store.put(i * 16, &noise(i as u64, 100 + i * 200), 0, Codec::Uncompressed).unwrap();
    }
    for i in (0..64usize).rev().step_by(2).chain((0..64usize).step_by(2)) {
        store.remove(i * 16).unwrap();
    }
    assert!(store.is_empty());
    assert_eq!(store.allocator().frontier(), 2);
    assert!(store.allocator().free_blocks().is_empty());
}

#[test]
fn remove_persists_after_reopen() {
    let mut store = new_store();
    store.put(1, b"a", 0, Codec::Uncompressed).unwrap();
    store.put(2, b"b", 0, Codec::Uncompressed).unwrap();
    store.remove(1).unwrap();
    let mut store = reopen(store);
    assert!(store.get(1).unwrap().is_none());
    assert_eq!(store.get(2).unwrap().unwrap().0, b"b");
    assert_eq!(store.allocator().free_blocks(), &[SectorBlock::new(2, 1)]);
}

// -------------------- Limits & failures --------------------

#[test]
fn record_too_large_leaves_slot_untouched() {
    let mut store = new_store();
    store.put(0, b"keep me", 5, Codec::Uncompressed).unwrap();
    let before = store.allocator().clone();

    let huge = noise(11, MAX_RECORD_BYTES);
    match store.put(0, &huge, 6, Codec::Uncompressed) {
        Err(RegionError::RecordTooLarge { sectors }) => assert_eq!(sectors, 256),
        other => panic!("expected RecordTooLarge, got {:?}", other),
    }

    assert_eq!(store.get(0).unwrap().unwrap(), (b"keep me".to_vec(), 5));
    assert_eq!(store.allocator().frontier(), before.frontier());
    assert_eq!(store.allocator().free_blocks(), before.free_blocks());
}

#[test]
fn compressible_payload_larger_than_limit_is_accepted() {
    let mut store = new_store();
    let big = vec![0u8; 2 * MAX_RECORD_BYTES];
    store.put(0, &big, 0, Codec::Zlib).unwrap();
    assert_eq!(store.get(0).unwrap().unwrap().0, big);
}

#[test]
fn unknown_codec_tag_is_reported() {
    let mut store = new_store();
    store.put(4, b"data", 0, Codec::Uncompressed).unwrap();
    let mut bytes = store.into_inner().unwrap().into_inner();
    bytes[2 * SECTOR_BYTES + 4] = 99;

    let mut store = RegionStore::from_handle(Cursor::new(bytes)).unwrap();
    assert!(matches!(store.get(4), Err(RegionError::UnsupportedCodec(99))));
}

#[test]
fn truncated_file_is_reported() {
    let mut store = new_store();
    store.put(0, &noise(5, 6_000), 0, Codec::Uncompressed).unwrap();
    let mut bytes = store.into_inner().unwrap().into_inner();
    bytes.truncate(2 * SECTOR_BYTES + 100);

    let mut store = RegionStore::from_handle(Cursor::new(bytes)).unwrap();
    assert!(matches!(store.get(0), Err(RegionError::Truncated { .. })));
}

#[test]
fn length_larger_than_sectors_is_corrupt() {
    let mut store = new_store();
    store.put(0, b"data", 0, Codec::Uncompressed).unwrap();
    let mut bytes = store.into_inner().unwrap().into_inner();
    bytes[2 * SECTOR_BYTES..2 * SECTOR_BYTES + 4].copy_from_slice(&10_000u32.to_be_bytes());

    let mut store = RegionStore::from_handle(Cursor::new(bytes)).unwrap();
    assert!(matches!(store.get(0), Err(RegionError::CorruptRecord { .. })));
}

#[test]
fn failed_write_keeps_previous_record() {
    let mut store = two_record_store_failing_writes();

    // slot 0 moves to the frontier, away from its old sector
    let result = store.put(0, &three_sector_payload(), 11, Codec::Uncompressed);
    assert!(matches!(result, Err(RegionError::Io(_))));

    assert_eq!(store.get(0).unwrap().unwrap(), (b"first".to_vec(), 10));
    assert_eq!(store.block(0).unwrap(), Some(SectorBlock::new(2, 1)));
    assert_eq!(store.allocator().frontier(), 4);
    assert!(store.allocator().free_blocks().is_empty());

    // a failed write into an empty slot gives its sectors back too
    assert!(store.put(2, b"third", 30, Codec::Uncompressed).is_err());
    assert!(!store.contains(2).unwrap());
    assert_eq!(store.allocator().frontier(), 4);
    assert_eq!(store.len(), 2);
}

#[test]
fn failed_write_over_own_sectors_empties_slot() {
    let mut store = two_record_store_failing_writes();

    // slot 1 is the tail record, so the new span starts on its old sector
    assert!(store.put(1, &three_sector_payload(), 21, Codec::Uncompressed).is_err());

    assert!(!store.contains(1).unwrap());
    assert_eq!(store.get(1).unwrap(), None);
    assert_eq!(store.allocator().frontier(), 3);
    assert!(store.allocator().free_blocks().is_empty());
    assert_eq!(store.get(0).unwrap().unwrap(), (b"first".to_vec(), 10));

    // the freed sectors are reusable and nothing was leaked
    assert!(store.remove(0).unwrap());
    assert_eq!(store.allocator().frontier(), 2);
}

// -------------------- Close --------------------

#[test]
fn operations_after_close_fail() {
    let mut store = new_store();
    store.put(0, b"x", 0, Codec::Uncompressed).unwrap();
    store.close().unwrap();
    assert!(store.is_closed());

    assert!(matches!(store.put(1, b"y", 0, Codec::Uncompressed), Err(RegionError::Closed)));
    assert!(matches!(store.get(0), Err(RegionError::Closed)));
    // empty slots report the closed store too, not an empty result
    assert!(matches!(store.get(5), Err(RegionError::Closed)));
    assert!(matches!(store.contains(0), Err(RegionError::Closed)));
    assert!(matches!(store.timestamp(0), Err(RegionError::Closed)));
    assert!(matches!(store.block(0), Err(RegionError::Closed)));
    assert!(matches!(store.remove(0), Err(RegionError::Closed)));
    assert!(matches!(store.flush(), Err(RegionError::Closed)));
    // closing again is harmless
    store.close().unwrap();
}

#[test]
fn file_backed_store_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("r.0.0.mca");

    {
        let mut store = RegionStore::open(&path).unwrap();
        store.put(0, &payload(3, 20_000), 100, Codec::Gzip).unwrap();
        store.put(1023, b"last slot", 200, Codec::Zlib).unwrap();
        store.close().unwrap();
    }

    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len % SECTOR_BYTES as u64, 0);

    let mut store = RegionStore::open(&path).unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(store.get(0).unwrap().unwrap(), (payload(3, 20_000), 100));
    assert_eq!(store.get(1023).unwrap().unwrap(), (b"last slot".to_vec(), 200));
}

#[test]
fn drop_flushes_header() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("r.1.1.mca");

    {
        let mut store = RegionStore::open(&path).unwrap();
        store.put(42, b"written before drop", 9, Codec::Zlib).unwrap();
        // no close
    }

    let mut store = RegionStore::open(&path).unwrap();
    assert_eq!(store.get(42).unwrap().unwrap().0, b"written before drop");
}

#[test]
fn compression_level_is_applied() {
    let mut store = new_store();
    store.set_compression_level(0);
    assert_eq!(store.compression_level(), 0);
    let data = vec![b'a'; 50_000];
    store.put(0, &data, 0, Codec::Zlib).unwrap();
    // stored blocks at level 0 are not smaller than the input
    assert!(store.block(0).unwrap().unwrap().count >= 12);
    assert_eq!(store.get(0).unwrap().unwrap().0, data);
}
