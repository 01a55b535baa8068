//! Internal: Declare the Reader type for tunnel-bytes

use crate::{Error, Readable, Result};
use arrayref::array_ref;

/// A cursor for decoding messages from a slice of bytes.
///
/// The methods here never panic, with one exception: [`Reader::extract`]
/// and [`Reader::extract_n`] will panic if the underlying
/// [`Readable::take_from`] panics.
///
/// # Examples
///
/// ```
/// use tunnel_bytes::{Reader, Result};
/// // circuit id, kind, body length
/// let hdr = [0x00, 0x00, 0x00, 0x2a, 0x05, 0x00, 0x03, 1, 2, 3];
/// let mut r = Reader::from_slice(&hdr[..]);
/// assert_eq!(r.take_u32()?, 42);
/// assert_eq!(r.take_u8()?, 5);
/// let len = r.take_u16()? as usize;
/// assert_eq!(r.take(len)?, &[1, 2, 3]);
/// r.should_be_exhausted()?;
/// # Result::Ok(())
/// ```
pub struct Reader<'a> {
    /// The underlying slice that we're reading from
    b: &'a [u8],
    /// The next position in the slice that we intend to read from.
    off: usize,
}

impl<'a> Reader<'a> {
    /// Construct a new Reader from a slice of bytes.
    pub fn from_slice(slice: &'a [u8]) -> Self {
        Reader { b: slice, off: 0 }
    }
    /// Construct a new Reader from a 'Bytes' object.
    pub fn from_bytes(b: &'a bytes::Bytes) -> Self {
        Self::from_slice(b.as_ref())
    }
    /// Return the total length of the slice in this reader, including
    /// consumed bytes and remaining bytes.
    pub fn total_len(&self) -> usize {
        self.b.len()
    }
    /// Return the number of bytes that have not yet been read.
    pub fn remaining(&self) -> usize {
        self.b.len() - self.off
    }
    /// Consume this reader, and return the bytes it did not consume.
    pub fn into_rest(self) -> &'a [u8] {
        &self.b[self.off..]
    }
    /// Return the number of bytes that have already been read.
    pub fn consumed(&self) -> usize {
        self.off
    }
    /// Skip `n` bytes.
    ///
    /// Returns Err(Error::Truncated) if there were not enough bytes to
    /// skip.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        if n > self.remaining() {
            return Err(Error::Truncated);
        }
        self.off += n;
        Ok(())
    }
    /// Return Err(Error::ExtraneousBytes) unless this reader is out of
    /// bytes.
    pub fn should_be_exhausted(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::ExtraneousBytes);
        }
        Ok(())
    }
    /// Truncate this reader, so that no more than `n` bytes remain.
    pub fn truncate(&mut self, n: usize) {
        if n < self.remaining() {
            self.b = &self.b[..self.off + n];
        }
    }
    /// Return the next `n` bytes without consuming them.
    pub fn peek(&self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Truncated);
        }
        Ok(&self.b[self.off..(n + self.off)])
    }
    /// Consume and return the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let b = self.peek(n)?;
        self.advance(n)?;
        Ok(b)
    }
    /// Consume and return every byte that is left.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = &self.b[self.off..];
        self.off = self.b.len();
        rest
    }
    /// Try to consume and return a u8.
    pub fn take_u8(&mut self) -> Result<u8> {
        let b = self.take(1)?;
        Ok(b[0])
    }
    /// Try to consume and return a big-endian u16.
    pub fn take_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes(*array_ref![b, 0, 2]))
    }
    /// Try to consume and return a big-endian u32.
    pub fn take_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes(*array_ref![b, 0, 4]))
    }
    /// Try to consume and return a big-endian u64.
    pub fn take_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes(*array_ref![b, 0, 8]))
    }
    /// Try to consume and return a big-endian u128.
    pub fn take_u128(&mut self) -> Result<u128> {
        let b = self.take(16)?;
        Ok(u128::from_be_bytes(*array_ref![b, 0, 16]))
    }
    /// Consume a u8 length, then that many bytes.
    pub fn take_u8_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.take_u8()?;
        self.take(len.into())
    }
    /// Consume a big-endian u16 length, then that many bytes.
    ///
    /// Handshake messages and data payloads inside cell bodies are
    /// encoded this way.
    pub fn take_u16_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.take_u16()?;
        self.take(len.into())
    }
    /// Consume bytes up to the first `term`, and return them without the
    /// terminator.  The terminator itself is consumed.
    pub fn take_until(&mut self, term: u8) -> Result<&'a [u8]> {
        let pos = self.b[self.off..]
            .iter()
            .position(|b| *b == term)
            .ok_or(Error::Truncated)?;
        let result = self.take(pos)?;
        self.advance(1)?;
        Ok(result)
    }
    /// Try to decode and remove a Readable from this reader.
    ///
    /// On failure, consumes nothing.
    pub fn extract<E: Readable>(&mut self) -> Result<E> {
        let off_orig = self.off;
        let result = E::take_from(self);
        if result.is_err() {
            self.off = off_orig;
        }
        result
    }
    /// Try to decode and remove `n` Readables from this reader.
    ///
    /// On failure, consumes nothing.
    pub fn extract_n<E: Readable>(&mut self, n: usize) -> Result<Vec<E>> {
        let mut result = Vec::new();
        let off_orig = self.off;
        for _ in 0..n {
            match E::take_from(self) {
                Ok(item) => result.push(item),
                Err(e) => {
                    self.off = off_orig;
                    return Err(e);
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn read_ints() {
        let bytes = b"\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0a\x0b\x0c\x0d\x0e\x0f\x10";
        let mut r = Reader::from_slice(&bytes[..]);
        assert_eq!(r.take_u8().unwrap(), 1);
        assert_eq!(r.take_u16().unwrap(), 0x0203);
        assert_eq!(r.take_u32().unwrap(), 0x0405_0607);
        assert_eq!(r.take_u64().unwrap(), 0x0809_0a0b_0c0d_0e0f);
        assert_eq!(r.consumed(), 15);
        assert_eq!(r.remaining(), 1);
        assert_eq!(r.take_u16(), Err(Error::Truncated));
        // a failed read consumes nothing
        assert_eq!(r.remaining(), 1);
        assert_eq!(r.take_rest(), &[0x10]);
        assert!(r.should_be_exhausted().is_ok());
    }

    #[test]
    fn truncate_and_peek() {
        let mut r = Reader::from_slice(b"cookie jar");
        r.truncate(6);
        assert_eq!(r.peek(6).unwrap(), b"cookie");
        assert_eq!(r.peek(7), Err(Error::Truncated));
        assert_eq!(r.take(6).unwrap(), b"cookie");
        assert_eq!(r.should_be_exhausted(), Ok(()));
    }

    #[test]
    fn until() {
        let mut r = Reader::from_slice(b"tracker.example\0rest");
        assert_eq!(r.take_until(0).unwrap(), b"tracker.example");
        assert_eq!(r.take_until(0), Err(Error::Truncated));
        assert_eq!(r.into_rest(), b"rest");
    }

    #[test]
    fn prefixed_truncated() {
        let mut r = Reader::from_slice(&[0x00, 0x05, 1, 2]);
        assert_eq!(r.take_u16_prefixed(), Err(Error::Truncated));
        let mut r = Reader::from_slice(&[3, 9, 8, 7]);
        assert_eq!(r.take_u8_prefixed().unwrap(), &[9, 8, 7]);
    }

    #[test]
    fn extract_rewinds() {
        /// Two u16 values; fails if the second one is missing.
        #[derive(Debug)]
        struct Pair(u16, u16);
        impl Readable for Pair {
            fn take_from(r: &mut Reader<'_>) -> Result<Self> {
                Ok(Pair(r.take_u16()?, r.take_u16()?))
            }
        }
        let mut r = Reader::from_slice(&[0, 1, 0, 2, 0, 3, 0]);
        let p: Pair = r.extract().unwrap();
        assert_eq!((p.0, p.1), (1, 2));
        assert!(r.extract::<Pair>().is_err());
        assert_eq!(r.remaining(), 3);

        let mut r = Reader::from_slice(&[0, 1, 0, 2, 0, 3]);
        assert!(r.extract_n::<Pair>(2).is_err());
        assert_eq!(r.consumed(), 0);
    }
}
