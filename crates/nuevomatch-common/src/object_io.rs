//! Binary container reader and packer
//!
//! Precompiled classifiers are packed host-native: scalars are written in
//! native byte order and the blob is not portable across endianness or word
//! size. Nested objects are length-prefixed with a `u32` byte count so a
//! reader can hand out bounded sub-readers without copying.

use crate::error::{ReadError, ReadResult};
use byteorder::{ByteOrder, NativeEndian};

/// Cursor over a packed byte buffer
#[derive(Debug, Clone)]
pub struct ObjectReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ObjectReader<'a> {
    /// Wrap a byte buffer
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Total buffer size in bytes
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Bytes consumed so far
    #[inline(always)]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whether the cursor reached the end of the buffer
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The whole underlying buffer, independent of the cursor
    #[inline(always)]
    pub fn buffer(&self) -> &'a [u8] {
        self.buf
    }

    #[inline]
    fn take(&mut self, len: usize) -> ReadResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(ReadError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Read a native-endian `u32`
    #[inline]
    pub fn read_u32(&mut self) -> ReadResult<u32> {
        Ok(NativeEndian::read_u32(self.take(4)?))
    }

    /// Read a native-endian `i32`
    #[inline]
    pub fn read_i32(&mut self) -> ReadResult<i32> {
        Ok(NativeEndian::read_i32(self.take(4)?))
    }

    /// Read a native-endian `f32`
    #[inline]
    pub fn read_f32(&mut self) -> ReadResult<f32> {
        Ok(NativeEndian::read_f32(self.take(4)?))
    }

    /// Read a single byte
    #[inline]
    pub fn read_u8(&mut self) -> ReadResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a raw byte slice
    #[inline]
    pub fn read_bytes(&mut self, len: usize) -> ReadResult<&'a [u8]> {
        self.take(len)
    }

    /// Read a `u32` length prefix and return a reader over the nested object
    pub fn sub_reader(&mut self) -> ReadResult<ObjectReader<'a>> {
        let declared = self.read_u32()? as usize;
        if declared > self.remaining() {
            return Err(ReadError::BadLengthPrefix {
                declared,
                available: self.remaining(),
            });
        }
        Ok(ObjectReader::new(self.take(declared)?))
    }
}

/// Growable buffer for packing binary objects
#[derive(Debug, Default, Clone)]
pub struct ObjectPacker {
    buf: Vec<u8>,
}

impl ObjectPacker {
    /// Create an empty packer
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes packed so far
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been packed yet
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append a native-endian `u32`
    #[inline]
    pub fn push_u32(&mut self, value: u32) {
        let mut raw = [0u8; 4];
        NativeEndian::write_u32(&mut raw, value);
        self.buf.extend_from_slice(&raw);
    }

    /// Append a native-endian `i32`
    #[inline]
    pub fn push_i32(&mut self, value: i32) {
        let mut raw = [0u8; 4];
        NativeEndian::write_i32(&mut raw, value);
        self.buf.extend_from_slice(&raw);
    }

    /// Append a native-endian `f32`
    #[inline]
    pub fn push_f32(&mut self, value: f32) {
        let mut raw = [0u8; 4];
        NativeEndian::write_f32(&mut raw, value);
        self.buf.extend_from_slice(&raw);
    }

    /// Append a single byte
    #[inline]
    pub fn push_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Append raw bytes verbatim
    #[inline]
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Append another packer's contents as a length-prefixed nested object
    pub fn push_object(&mut self, object: &ObjectPacker) {
        self.push_u32(object.buf.len() as u32);
        self.buf.extend_from_slice(&object.buf);
    }

    /// Borrow the packed bytes
    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Take ownership of the packed bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
