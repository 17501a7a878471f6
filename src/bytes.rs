//! Bounds-checked little-endian access to on-disk buffers.
//!
//! Every structure in this crate is decoded through a `ByteView`, so a bogus
//! offset or length coming from a damaged record turns into an
//! `OutOfBounds` error instead of a panic.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{DirTreeError, Result};

#[derive(Debug, Clone, Copy)]
pub struct ByteView<'a> {
    buf: &'a [u8],
}

impl<'a> ByteView<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.buf
    }

    /// `len` bytes starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        let end = offset.checked_add(len).ok_or(DirTreeError::OutOfBounds {
            offset,
            len,
            size: self.buf.len(),
        })?;
        self.buf.get(offset..end).ok_or(DirTreeError::OutOfBounds {
            offset,
            len,
            size: self.buf.len(),
        })
    }

    /// A narrower view covering `len` bytes at `offset`.
    pub fn sub(&self, offset: usize, len: usize) -> Result<ByteView<'a>> {
        self.slice(offset, len).map(ByteView::new)
    }

    /// Everything from `offset` to the end of the buffer.
    pub fn tail(&self, offset: usize) -> Result<ByteView<'a>> {
        self.sub(offset, self.buf.len().saturating_sub(offset))
    }

    pub fn u8_at(&self, offset: usize) -> Result<u8> {
        Ok(self.slice(offset, 1)?[0])
    }

    pub fn u16_at(&self, offset: usize) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.slice(offset, 2)?))
    }

    pub fn u32_at(&self, offset: usize) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.slice(offset, 4)?))
    }

    pub fn u64_at(&self, offset: usize) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.slice(offset, 8)?))
    }

    /// Little-endian unsigned integer of 1..=8 bytes.
    pub fn uint_at(&self, offset: usize, nbytes: usize) -> Result<u64> {
        if nbytes == 0 {
            return Ok(0);
        }
        if nbytes > 8 {
            return Err(DirTreeError::Decode(format!(
                "{nbytes}-byte integer does not fit in 64 bits"
            )));
        }
        Ok(LittleEndian::read_uint(self.slice(offset, nbytes)?, nbytes))
    }

    /// Little-endian two's complement integer of 1..=8 bytes, sign-extended.
    pub fn int_at(&self, offset: usize, nbytes: usize) -> Result<i64> {
        if nbytes == 0 {
            return Ok(0);
        }
        if nbytes > 8 {
            return Err(DirTreeError::Decode(format!(
                "{nbytes}-byte integer does not fit in 64 bits"
            )));
        }
        Ok(LittleEndian::read_int(self.slice(offset, nbytes)?, nbytes))
    }

    /// UTF-16LE string of `units` code units. Unpaired surrogates are replaced.
    pub fn utf16_at(&self, offset: usize, units: usize) -> Result<String> {
        let raw = self.slice(offset, units * 2)?;
        let wide: Vec<u16> = raw
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&wide))
    }
}
