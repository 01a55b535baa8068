//! `tunnel-bytes`: Utilities to decode/encode tunnel protocol objects.
//!
//! # Overview
//!
//! Every object that crosses a peer link in the tunnel overlay (cells,
//! handshake messages, data messages, SOCKS headers) is a small
//! byte-oriented structure.  This crate holds the two cursors we use to
//! handle them:
//!
//! * [`Reader`]: A view of a byte slice, from which data can be decoded.
//! * [`Writer`]: Trait to represent a growable buffer of bytes.
//!   (`Vec<u8>` and [`bytes::BytesMut`] implement this.)
//! * [`Writeable`]: Trait for an object that can be encoded onto a [`Writer`]
//! * [`Readable`]: Trait for an object that can be decoded from a [`Reader`].
//!
//! All multi-byte integers are big-endian.
//!
//! Nothing here performs I/O: the bytes are already in memory, and the
//! only failure modes are "not enough bytes" and "bytes that don't make
//! sense".

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![warn(clippy::clone_on_ref_ptr)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::needless_borrow)]
#![deny(clippy::ref_option_ref)]
#![deny(clippy::unnecessary_wraps)]

mod err;
mod impls;
mod reader;
mod writer;

pub use err::Error;
pub use reader::Reader;
pub use writer::Writer;

/// Result type returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Trait for an object that can be encoded onto a Writer by reference.
///
/// Most code won't call this directly, but will use it through
/// [`Writer::write()`].
///
/// # Example
///
/// ```
/// use tunnel_bytes::{Writeable, Writer};
/// struct Cookie(u32);
///
/// impl Writeable for Cookie {
///     fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) {
///         b.write_u32(self.0);
///     }
/// }
///
/// let mut v: Vec<u8> = Vec::new();
/// v.write(&Cookie(0xdead_beef));
/// assert_eq!(v, &[0xde, 0xad, 0xbe, 0xef]);
/// ```
pub trait Writeable {
    /// Encode this object into the writer `b`.
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B);
}

/// Trait for an object that can be encoded and consumed by a Writer.
///
/// Used for objects that own large buffers, so that the writer can
/// absorb them instead of copying.
pub trait WriteableOnce {
    /// Encode this object into the writer `b`, and consume it.
    fn write_into<B: Writer + ?Sized>(self, b: &mut B);
}

impl<W: Writeable> WriteableOnce for W {
    fn write_into<B: Writer + ?Sized>(self, b: &mut B) {
        self.write_onto(b);
    }
}

/// Trait for an object that can be extracted from a Reader.
///
/// Implementations should be cheap: this is a parser, not a place to
/// check authenticators or do other expensive work.
///
/// # Example
///
/// ```
/// use tunnel_bytes::{Readable, Reader, Result};
/// #[derive(Debug, PartialEq)]
/// struct Cookie(u32);
///
/// impl Readable for Cookie {
///     fn take_from(r: &mut Reader<'_>) -> Result<Self> {
///         Ok(Cookie(r.take_u32()?))
///     }
/// }
///
/// let mut r = Reader::from_slice(&[0xde, 0xad, 0xbe, 0xef]);
/// let c: Cookie = r.extract()?;
/// assert_eq!(c, Cookie(0xdead_beef));
/// r.should_be_exhausted()?;
/// # Result::Ok(())
/// ```
pub trait Readable: Sized {
    /// Try to extract an object of this type from a Reader.
    fn take_from(b: &mut Reader<'_>) -> Result<Self>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn writer_ints() {
        let mut v: Vec<u8> = Vec::new();
        v.write_u8(0x57);
        v.write_u16(0x6520);
        v.write_u32(0x68617665);
        v.write_u64(0x2061206d61636869);
        v.write_all(b"nery for ");
        v.write(&[0x72u8, 0x65]);
        v.write_zeros(3);
        assert_eq!(&v[..], &b"We have a machinery for re\0\0\0"[..]);
    }

    #[test]
    fn prefixed_roundtrip() {
        let mut v: Vec<u8> = Vec::new();
        v.write_u16_prefixed(b"handshake").unwrap();
        v.write_u8(7);

        let mut r = Reader::from_slice(&v[..]);
        assert_eq!(r.take_u16_prefixed().unwrap(), b"handshake");
        assert_eq!(r.take_u8().unwrap(), 7);
        assert!(r.should_be_exhausted().is_ok());
    }
}
