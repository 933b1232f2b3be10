//! Little-endian primitives over `bytes`.
//!
//! Every read is bounds-checked: a short buffer yields [`Truncated`] with the
//! offset where the read started, never a panic.

use bytes::{Buf, BufMut, BytesMut};

use crate::world::entity::{Bounds, Location};
use crate::world::serial::Serial;

/// Not enough bytes left for a read starting at this offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncated(pub usize);

pub type DecodeResult<T> = Result<T, Truncated>;

#[derive(Debug, Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn serial(&mut self, v: Serial) {
        self.u32(v.raw());
    }

    /// NUL-terminated string. Interior NULs would end the string early on
    /// read, so they are dropped.
    pub fn cstr(&mut self, v: &str) {
        for byte in v.bytes().filter(|b| *b != 0) {
            self.buf.put_u8(byte);
        }
        self.buf.put_u8(0);
    }

    pub fn location(&mut self, v: Location) {
        self.u16(v.x);
        self.u16(v.y);
        self.i8(v.z);
    }

    pub fn bounds(&mut self, v: Bounds) {
        self.u16(v.x);
        self.u16(v.y);
        self.i8(v.z);
        self.u16(v.width);
        self.u16(v.height);
        self.u16(v.depth);
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }
}

pub struct Reader<'a> {
    buf: &'a [u8],
    total: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            total: buf.len(),
        }
    }

    /// Offset of the next unread byte.
    pub fn position(&self) -> usize {
        self.total - self.buf.remaining()
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn need(&self, n: usize) -> DecodeResult<()> {
        if self.buf.remaining() < n {
            Err(Truncated(self.position()))
        } else {
            Ok(())
        }
    }

    pub fn u8(&mut self) -> DecodeResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn i8(&mut self) -> DecodeResult<i8> {
        self.need(1)?;
        Ok(self.buf.get_i8())
    }

    pub fn u16(&mut self) -> DecodeResult<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn u32(&mut self) -> DecodeResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn u64(&mut self) -> DecodeResult<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn serial(&mut self) -> DecodeResult<Serial> {
        self.u32().map(Serial::new)
    }

    /// NUL-terminated string; invalid UTF-8 is replaced rather than rejected.
    pub fn cstr(&mut self) -> DecodeResult<String> {
        let end = self
            .buf
            .iter()
            .position(|b| *b == 0)
            .ok_or(Truncated(self.position()))?;
        let text = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.advance(end + 1);
        Ok(text)
    }

    pub fn location(&mut self) -> DecodeResult<Location> {
        self.need(5)?;
        Ok(Location {
            x: self.buf.get_u16_le(),
            y: self.buf.get_u16_le(),
            z: self.buf.get_i8(),
        })
    }

    pub fn bounds(&mut self) -> DecodeResult<Bounds> {
        self.need(11)?;
        Ok(Bounds {
            x: self.buf.get_u16_le(),
            y: self.buf.get_u16_le(),
            z: self.buf.get_i8(),
            width: self.buf.get_u16_le(),
            height: self.buf.get_u16_le(),
            depth: self.buf.get_u16_le(),
        })
    }

    pub fn bytes(&mut self, n: usize) -> DecodeResult<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn skip(&mut self, n: usize) -> DecodeResult<()> {
        self.need(n)?;
        self.buf.advance(n);
        Ok(())
    }
}
