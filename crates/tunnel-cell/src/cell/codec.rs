//! Implementation for encoding and decoding of cells.

use super::{Cell, CellKind, CircId, CELL_BODY_LEN, CELL_LEN};
use crate::{Error, Result};
use tunnel_bytes::{Reader, Writer};

/// This object can be used to encode and decode cells.
///
/// The format of every cell is:
///
/// ```ignore
///     u32 circid;
///     u8 kind;
///     u16 len;
///     u8 body[len];
///     u8 padding[CELL_LEN - 7 - len];  // all zero
/// ```
///
/// The codec holds no state: any frame can be decoded in isolation,
/// which is what an unreliable transport needs.
#[derive(Clone, Copy, Debug, Default)]
pub struct CellCodec;

impl CellCodec {
    /// Create a new CellCodec.
    pub fn new() -> Self {
        CellCodec
    }

    /// Write `cell` onto `dst` as exactly [`CELL_LEN`] bytes.
    ///
    /// Fails without writing anything if the body does not fit.
    pub fn write_cell<W: Writer + ?Sized>(&self, cell: &Cell, dst: &mut W) -> Result<()> {
        let len = cell.body.len();
        if len > CELL_BODY_LEN {
            return Err(Error::BodyTooLong(len));
        }
        if cell.circid.is_zero() {
            return Err(Error::ZeroCircId);
        }
        dst.write_u32(cell.circid.into());
        dst.write_u8(cell.kind.into());
        dst.write_u16(len as u16);
        dst.write_all(&cell.body[..]);
        dst.write_zeros(CELL_BODY_LEN - len);
        Ok(())
    }

    /// Encode `cell` into a new buffer.
    pub fn encode(&self, cell: &Cell) -> Result<Vec<u8>> {
        let mut v = Vec::with_capacity(CELL_LEN);
        self.write_cell(cell, &mut v)?;
        Ok(v)
    }

    /// Decode a single frame into a cell.
    ///
    /// The frame must be exactly [`CELL_LEN`] bytes long.  The body is
    /// not interpreted, so cells of unrecognized kinds decode fine; it
    /// is up to the caller to drop them.
    pub fn decode(&self, frame: &[u8]) -> Result<Cell> {
        if frame.len() != CELL_LEN {
            return Err(Error::BadFrameLength(frame.len()));
        }
        let mut r = Reader::from_slice(frame);
        let circid: CircId = r.take_u32()?.into();
        if circid.is_zero() {
            return Err(Error::ZeroCircId);
        }
        let kind: CellKind = r.take_u8()?.into();
        let len = r.take_u16()? as usize;
        if len > CELL_BODY_LEN {
            return Err(Error::BodyTooLong(len));
        }
        let body = r.take(len)?.to_vec();
        Ok(Cell { circid, kind, body })
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use hex_literal::hex;

    #[test]
    fn encode_pads() {
        let codec = CellCodec::new();
        let cell = Cell::new(0xdead_beef.into(), CellKind::PING, vec![0, 7]);
        let v = codec.encode(&cell).unwrap();
        assert_eq!(v.len(), CELL_LEN);
        assert_eq!(&v[..9], &hex!("deadbeef 07 0002 0007")[..]);
        assert!(v[9..].iter().all(|b| *b == 0));
        assert_eq!(codec.decode(&v[..]).unwrap(), cell);
    }

    #[test]
    fn oversized() {
        let codec = CellCodec::new();
        let cell = Cell::new(5.into(), CellKind::DATA, vec![1; CELL_BODY_LEN + 1]);
        assert_eq!(
            codec.encode(&cell),
            Err(Error::BodyTooLong(CELL_BODY_LEN + 1))
        );
        let cell = Cell::new(5.into(), CellKind::DATA, vec![1; CELL_BODY_LEN]);
        let v = codec.encode(&cell).unwrap();
        assert_eq!(v.len(), CELL_LEN);

        // A header that lies about its body length is rejected.
        let mut v = v;
        v[5] = 0xff;
        v[6] = 0xff;
        assert_eq!(codec.decode(&v[..]), Err(Error::BodyTooLong(0xffff)));
    }

    #[test]
    fn bad_frames() {
        let codec = CellCodec::new();
        assert_eq!(codec.decode(&[0; 12]), Err(Error::BadFrameLength(12)));
        let long = vec![0_u8; CELL_LEN + 1];
        assert_eq!(
            codec.decode(&long[..]),
            Err(Error::BadFrameLength(CELL_LEN + 1))
        );
        let zero = vec![0_u8; CELL_LEN];
        assert_eq!(codec.decode(&zero[..]), Err(Error::ZeroCircId));
        let cell = Cell::new(0.into(), CellKind::PING, vec![]);
        assert_eq!(codec.encode(&cell), Err(Error::ZeroCircId));
    }

    #[test]
    fn unknown_kind_still_frames() {
        let codec = CellCodec::new();
        let cell = Cell::new(9.into(), 99.into(), b"mystery".to_vec());
        let v = codec.encode(&cell).unwrap();
        let back = codec.decode(&v[..]).unwrap();
        assert!(!back.kind().is_recognized());
        assert_eq!(back.body(), b"mystery");
    }
}
