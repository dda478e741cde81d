// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 wire codec.
//!
//! Primitives are big-endian fixed-width integers. Sized buffers carry a
//! `u16` length prefix, lists a `u32` count prefix, and sized structures a
//! `u16` byte-size prefix delimiting an inner window. Tagged unions carry no
//! discriminant of their own; the selector is a sibling field of the
//! enclosing structure and is consumed by that structure's codec.

use crate::error::{Error, Result};

/// Upper bound on any single sized field or list payload (64 KiB).
pub const MAX_FIELD_SIZE: usize = 64 * 1024;

/// Upper bound on list element counts.
pub const MAX_LIST_COUNT: usize = 16 * 1024;

/// Growable big-endian writer for building TPM wire data.
///
/// Marshalling a well-formed value never fails; constraint violations
/// (oversized buffers) are programmer errors and panic.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Write a `TPM2B` sized buffer. A nil and an empty slice both encode
    /// as `0x0000`.
    pub fn put_tpm2b(&mut self, data: &[u8]) {
        assert!(data.len() <= u16::MAX as usize, "TPM2B payload too large");
        self.put_u16(data.len() as u16);
        self.put_bytes(data);
    }

    /// Write a sized structure: `u16 size || marshalled value`. `None`
    /// encodes as `0x0000`.
    pub fn put_sized<T: Marshal>(&mut self, value: Option<&T>) {
        match value {
            None => self.put_u16(0),
            Some(v) => {
                let inner = v.to_bytes();
                self.put_tpm2b(&inner);
            }
        }
    }

    /// Write a `u32`-count-prefixed list.
    pub fn put_list<T: Marshal>(&mut self, items: &[T]) {
        self.put_u32(items.len() as u32);
        for item in items {
            item.marshal(self);
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Backpatch a `u32` at a known offset (used for size fields).
    pub fn update_u32(&mut self, pos: usize, v: u32) {
        self.data[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }
}

/// Bounded big-endian reader over received TPM wire data.
#[derive(Debug)]
pub struct ResponseBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn underflow(&self, what: &str) -> Error {
        Error::unmarshal(format!(
            "short buffer reading {} ({} byte(s) remaining)",
            what,
            self.remaining()
        ))
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(self.underflow("u8"));
        }
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.get_array::<2>("u16")?;
        Ok(u16::from_be_bytes(b))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.get_array::<4>("u32")?;
        Ok(u32::from_be_bytes(b))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.get_array::<8>("u64")?;
        Ok(u64::from_be_bytes(b))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let b = self.get_array::<4>("i32")?;
        Ok(i32::from_be_bytes(b))
    }

    fn get_array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        if self.remaining() < N {
            return Err(self.underflow(what));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        if self.remaining() < len {
            return Err(self.underflow("byte block"));
        }
        let v = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(v)
    }

    /// Read a `TPM2B` sized buffer.
    pub fn get_tpm2b(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        if size > MAX_FIELD_SIZE {
            return Err(Error::unmarshal(format!("oversize buffer ({} bytes)", size)));
        }
        self.get_bytes(size)
    }

    /// Read a sized structure window. Returns `None` for a zero size.
    /// Trailing bytes left inside the window by the inner codec are an
    /// error.
    pub fn get_sized<T: Unmarshal>(&mut self) -> Result<Option<T>> {
        let window = self.get_tpm2b()?;
        if window.is_empty() {
            return Ok(None);
        }
        let mut inner = ResponseBuffer::new(&window);
        let value = T::unmarshal(&mut inner)?;
        if inner.remaining() != 0 {
            return Err(Error::unmarshal(format!(
                "{} trailing byte(s) in sized field",
                inner.remaining()
            )));
        }
        Ok(Some(value))
    }

    /// Read a `u32` list count, bounded by [`MAX_LIST_COUNT`].
    pub fn get_list_count(&mut self) -> Result<usize> {
        let count = self.get_u32()? as usize;
        if count > MAX_LIST_COUNT {
            return Err(Error::unmarshal(format!("oversize list ({} entries)", count)));
        }
        Ok(count)
    }

    pub fn get_list<T: Unmarshal>(&mut self) -> Result<Vec<T>> {
        let count = self.get_list_count()?;
        let mut out = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            out.push(T::unmarshal(self)?);
        }
        Ok(out)
    }

    /// Consume and return the rest of the buffer verbatim.
    pub fn get_remaining(&mut self) -> Vec<u8> {
        let v = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        v
    }
}

/// Types that can be serialized to the TPM wire format.
pub trait Marshal {
    fn marshal(&self, buf: &mut CommandBuffer);

    /// Marshal into a fresh byte vector. Never fails for well-formed
    /// values.
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        self.marshal(&mut buf);
        buf.into_vec()
    }

    /// Whether this value marshals as a `u16`-size-prefixed buffer. The
    /// dispatcher uses this to decide if a leading command parameter is
    /// eligible for session-based parameter encryption.
    fn is_sized_buffer(&self) -> bool {
        false
    }
}

/// Types that can be deserialized from the TPM wire format.
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self>;

    /// Unmarshal a value that must consume the entire input.
    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(data);
        let v = Self::unmarshal(&mut buf)?;
        if buf.remaining() != 0 {
            return Err(Error::unmarshal(format!(
                "{} trailing byte(s)",
                buf.remaining()
            )));
        }
        Ok(v)
    }
}

impl Marshal for u8 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u8(*self);
    }
}

impl Marshal for u16 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(*self);
    }
}

impl Marshal for u32 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(*self);
    }
}

impl Marshal for u64 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u64(*self);
    }
}

impl Marshal for i32 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_i32(*self);
    }
}

impl Marshal for bool {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u8(u8::from(*self));
    }
}

impl Unmarshal for u8 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u8()
    }
}

impl Unmarshal for u16 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u16()
    }
}

impl Unmarshal for u32 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u32()
    }
}

impl Unmarshal for u64 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u64()
    }
}

impl Unmarshal for i32 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_i32()
    }
}

impl Unmarshal for bool {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(buf.get_u8()? != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_round_trip() {
        let mut buf = CommandBuffer::new();
        buf.put_u8(0xAB);
        buf.put_u16(0x1234);
        buf.put_u32(0xDEADBEEF);
        buf.put_u64(0x0102030405060708);
        buf.put_i32(-42);

        let bytes = buf.into_vec();
        let mut r = ResponseBuffer::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), 0xAB);
        assert_eq!(r.get_u16().unwrap(), 0x1234);
        assert_eq!(r.get_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(r.get_u64().unwrap(), 0x0102030405060708);
        assert_eq!(r.get_i32().unwrap(), -42);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn tpm2b_empty_and_nonempty() {
        let mut buf = CommandBuffer::new();
        buf.put_tpm2b(&[]);
        buf.put_tpm2b(b"abc");
        assert_eq!(buf.as_bytes(), &[0, 0, 0, 3, b'a', b'b', b'c']);

        let bytes = buf.into_vec();
        let mut r = ResponseBuffer::new(&bytes);
        assert_eq!(r.get_tpm2b().unwrap(), Vec::<u8>::new());
        assert_eq!(r.get_tpm2b().unwrap(), b"abc".to_vec());
    }

    #[test]
    fn short_buffer_is_an_error() {
        let mut r = ResponseBuffer::new(&[0x01]);
        let err = r.get_u32().unwrap_err();
        assert!(err.to_string().contains("short buffer"));
    }

    #[test]
    fn sized_window_rejects_trailing_bytes() {
        // a u16 value inside a 4-byte window leaves 2 trailing bytes
        let data = [0x00, 0x04, 0xAA, 0xBB, 0xCC, 0xDD];
        let mut r = ResponseBuffer::new(&data);
        let err = r.get_sized::<u16>().unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn sized_window_null_value() {
        let data = [0x00, 0x00];
        let mut r = ResponseBuffer::new(&data);
        assert_eq!(r.get_sized::<u16>().unwrap(), None);
    }

    #[test]
    fn list_round_trip() {
        let mut buf = CommandBuffer::new();
        buf.put_list(&[1u32, 2, 3]);
        let bytes = buf.into_vec();
        let mut r = ResponseBuffer::new(&bytes);
        assert_eq!(r.get_list::<u32>().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn oversize_list_rejected() {
        let mut buf = CommandBuffer::new();
        buf.put_u32(u32::MAX);
        let bytes = buf.into_vec();
        let mut r = ResponseBuffer::new(&bytes);
        assert!(r.get_list::<u32>().is_err());
    }

    #[test]
    fn from_bytes_rejects_trailing() {
        assert!(u16::from_bytes(&[0x00, 0x01, 0x02]).is_err());
        assert_eq!(u16::from_bytes(&[0x00, 0x01]).unwrap(), 1);
    }
}
