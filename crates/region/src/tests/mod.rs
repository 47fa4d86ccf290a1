mod store_tests;

use std::io::Cursor;

/// Deterministic, mildly compressible payload of `len` bytes.
pub(crate) fn payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i % 251) as u8).wrapping_mul(if i % 7 == 0 { 3 } else { 1 }))
        .collect()
}

/// Pseudo-random bytes that do not compress.
pub(crate) fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

pub(crate) fn memory_handle() -> Cursor<Vec<u8>> {
    Cursor::new(Vec::new())
}
