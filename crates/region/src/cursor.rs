//! Bounds-checked big-endian cursors over byte buffers.
//!
//! A cursor is a `(buffer, position, limit)` triple. Reads and writes advance
//! the position and fail with [`RegionError::Truncated`] instead of panicking
//! when they would cross the limit.

use byteorder::{BigEndian, ByteOrder};

use crate::{RegionError, Result};

/// Read cursor over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    limit: usize,
}

impl<'a> ByteCursor<'a> {
    /// Cursor over the whole of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            limit: buf.len(),
        }
    }

    /// Cursor over `buf[..limit]`.
    pub fn with_limit(buf: &'a [u8], limit: usize) -> Result<Self> {
        if limit > buf.len() {
            return Err(RegionError::Truncated {
                offset: 0,
                needed: limit,
            });
        }
        Ok(Self { buf, pos: 0, limit })
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes left before the limit.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(RegionError::Truncated {
                offset: self.pos as u64,
                needed: n,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    /// Borrows the next `n` bytes without copying.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Fills `out` with consecutive `u32` values.
    pub fn read_u32_into(&mut self, out: &mut [u32]) -> Result<()> {
        let bytes = self.take(out.len() * 4)?;
        BigEndian::read_u32_into(bytes, out);
        Ok(())
    }
}

/// Write cursor over a borrowed mutable byte slice.
#[derive(Debug)]
pub struct ByteCursorMut<'a> {
    buf: &'a mut [u8],
    pos: usize,
    limit: usize,
}

impl<'a> ByteCursorMut<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        let limit = buf.len();
        Self { buf, pos: 0, limit }
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    fn reserve(&mut self, n: usize) -> Result<&mut [u8]> {
        if n > self.remaining() {
            return Err(RegionError::Truncated {
                offset: self.pos as u64,
                needed: n,
            });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&mut self.buf[start..start + n])
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.reserve(1)?[0] = v;
        Ok(())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        BigEndian::write_u32(self.reserve(4)?, v);
        Ok(())
    }

    pub fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.reserve(src.len())?.copy_from_slice(src);
        Ok(())
    }

    /// Writes every value of `src` as consecutive `u32`s.
    pub fn write_u32_from(&mut self, src: &[u32]) -> Result<()> {
        BigEndian::write_u32_into(src, self.reserve(src.len() * 4)?);
        Ok(())
    }
}
