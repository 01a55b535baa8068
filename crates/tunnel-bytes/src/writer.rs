//! Internal: Declare the Writer type for tunnel-bytes

use crate::{Error, Result, Writeable, WriteableOnce};

/// A byte-oriented trait for writing to small arrays.
///
/// Unlike std::io::Write, this trait's methods are not allowed to
/// fail.  It's not for IO.
///
/// Most code will want to use the fact that `Vec<u8>` implements this
/// trait.
pub trait Writer {
    /// Append a slice to the end of this writer.
    fn write_all(&mut self, b: &[u8]);

    /// Append a single u8 to this writer.
    fn write_u8(&mut self, x: u8) {
        self.write_all(&[x])
    }
    /// Append a single u16 to this writer, encoded in big-endian order.
    fn write_u16(&mut self, x: u16) {
        self.write_all(&x.to_be_bytes())
    }
    /// Append a single u32 to this writer, encoded in big-endian order.
    fn write_u32(&mut self, x: u32) {
        self.write_all(&x.to_be_bytes())
    }
    /// Append a single u64 to this writer, encoded in big-endian order.
    fn write_u64(&mut self, x: u64) {
        self.write_all(&x.to_be_bytes())
    }
    /// Append a single u128 to this writer, encoded in big-endian order.
    fn write_u128(&mut self, x: u128) {
        self.write_all(&x.to_be_bytes())
    }
    /// Write `n` bytes of zero padding.
    fn write_zeros(&mut self, n: usize) {
        let v = vec![0_u8; n];
        self.write_all(&v[..])
    }
    /// Write a u8 length, followed by `b`.
    ///
    /// Fails with [`Error::BadLength`] if `b` does not fit.
    fn write_u8_prefixed(&mut self, b: &[u8]) -> Result<()> {
        if b.len() > u8::MAX as usize {
            return Err(Error::BadLength(b.len()));
        }
        self.write_u8(b.len() as u8);
        self.write_all(b);
        Ok(())
    }
    /// Write a big-endian u16 length, followed by `b`.
    ///
    /// Fails with [`Error::BadLength`] if `b` does not fit.
    fn write_u16_prefixed(&mut self, b: &[u8]) -> Result<()> {
        if b.len() > u16::MAX as usize {
            return Err(Error::BadLength(b.len()));
        }
        self.write_u16(b.len() as u16);
        self.write_all(b);
        Ok(())
    }
    /// Encode a Writeable object onto this writer, using its
    /// write_onto method.
    fn write<E: Writeable + ?Sized>(&mut self, e: &E) {
        e.write_onto(self)
    }
    /// Encode a WriteableOnce object onto this writer, using its
    /// write_into method.
    fn write_and_consume<E: WriteableOnce>(&mut self, e: E) {
        e.write_into(self)
    }
}

impl Writer for Vec<u8> {
    fn write_all(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
    fn write_u8(&mut self, byte: u8) {
        self.push(byte);
    }
    fn write_zeros(&mut self, n: usize) {
        let new_len = self.len() + n;
        self.resize(new_len, 0);
    }
}

impl Writer for bytes::BytesMut {
    fn write_all(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}
