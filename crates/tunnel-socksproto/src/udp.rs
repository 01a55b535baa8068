//! The header on datagrams relayed through a UDP association.
//!
//! ```text
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+
//! ```

use crate::msg::SocksAddr;
use crate::{Error, Result};

use tunnel_bytes::{Reader, Writer};

/// A datagram received from (or to be sent to) a SOCKS client on a UDP
/// association.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    /// Where the datagram goes (from the client) or came from (to it).
    pub addr: SocksAddr,
    /// The port at `addr`.
    pub port: u16,
    /// The datagram itself.
    pub payload: &'a [u8],
}

/// Parse a datagram that a SOCKS client sent to its association.
///
/// Fragments are refused with [`Error::Fragmented`]; the caller should
/// drop them.
pub fn decode_udp_datagram(packet: &[u8]) -> Result<UdpDatagram<'_>> {
    let mut r = Reader::from_slice(packet);
    let _reserved = r.take_u16()?;
    let frag = r.take_u8()?;
    if frag != 0 {
        return Err(Error::Fragmented);
    }
    let addr: SocksAddr = r.extract()?;
    let port = r.take_u16()?;
    Ok(UdpDatagram {
        addr,
        port,
        payload: r.into_rest(),
    })
}

/// Encode a datagram to send to a SOCKS client on its association.
pub fn encode_udp_datagram(addr: &SocksAddr, port: u16, payload: &[u8]) -> Vec<u8> {
    let mut w = Vec::with_capacity(payload.len() + 22);
    w.write_u16(0);
    w.write_u8(0);
    w.write(addr);
    w.write_u16(port);
    w.write_all(payload);
    w
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use hex_literal::hex;

    #[test]
    fn decode() {
        let pkt = hex!("0000 00 01 5db8d822 0050 58");
        let d = decode_udp_datagram(&pkt[..]).unwrap();
        assert_eq!(d.addr.to_string(), "93.184.216.34");
        assert_eq!(d.port, 80);
        assert_eq!(d.payload, b"X");

        let back = encode_udp_datagram(&d.addr, d.port, d.payload);
        assert_eq!(&back[..], &pkt[..]);
    }

    #[test]
    fn refuse() {
        let pkt = hex!("0000 01 01 5db8d822 0050 58");
        assert_eq!(decode_udp_datagram(&pkt[..]), Err(Error::Fragmented));
        assert_eq!(decode_udp_datagram(&hex!("0000 00 01 5db8")[..]), Err(Error::Truncated));
    }
}
