//! Encoding and decoding for data messages
//!
//! Data messages are what a DATA cell carries once the terminal hop
//! has removed the last onion layer.  They describe traffic between the
//! circuit originator and the Internet: single UDP datagrams, and TCP
//! streams multiplexed by stream id.

use std::fmt;
use std::net::SocketAddr;

use caret::caret_int;
use tunnel_bytes::{Error, Readable, Reader, Result, Writeable, Writer};

/// A destination (or source) of exit traffic.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TargetAddr {
    /// An IP address and port.
    Ip(SocketAddr),
    /// A hostname and port, to be resolved by the exit.
    Hostname(String, u16),
}

/// Address type tag: IP address.
const TARGET_IP: u8 = 1;
/// Address type tag: hostname.
const TARGET_HOSTNAME: u8 = 3;

impl TargetAddr {
    /// Return the port of this target.
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(a) => a.port(),
            TargetAddr::Hostname(_, p) => *p,
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(a: SocketAddr) -> Self {
        TargetAddr::Ip(a)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(a) => write!(f, "{}", a),
            TargetAddr::Hostname(h, p) => write!(f, "{}:{}", h, p),
        }
    }
}

impl Readable for TargetAddr {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        match r.take_u8()? {
            TARGET_IP => Ok(TargetAddr::Ip(r.extract()?)),
            TARGET_HOSTNAME => {
                let host = r.take_u8_prefixed()?;
                let host = std::str::from_utf8(host)
                    .map_err(|_| Error::BadMessage("hostname not utf-8"))?;
                if host.is_empty() || !host.is_ascii() {
                    return Err(Error::BadMessage("bad hostname"));
                }
                let port = r.take_u16()?;
                Ok(TargetAddr::Hostname(host.to_string(), port))
            }
            _ => Err(Error::BadMessage("unknown target address type")),
        }
    }
}

impl Writeable for TargetAddr {
    fn write_onto<B: Writer + ?Sized>(&self, w: &mut B) {
        match self {
            TargetAddr::Ip(a) => {
                w.write_u8(TARGET_IP);
                w.write(a);
            }
            TargetAddr::Hostname(h, p) => {
                w.write_u8(TARGET_HOSTNAME);
                // Hostnames longer than 255 bytes are rejected by
                // `DataMsg::begin`/`DataMsg::datagram`.
                let h = h.as_bytes();
                let len = std::cmp::min(h.len(), 255);
                w.write_u8(len as u8);
                w.write_all(&h[..len]);
                w.write_u16(*p);
            }
        }
    }
}

/// Identifier for a TCP stream within a circuit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u16);

impl From<u16> for StreamId {
    fn from(v: u16) -> Self {
        StreamId(v)
    }
}
impl From<StreamId> for u16 {
    fn from(id: StreamId) -> u16 {
        id.0
    }
}
impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

caret_int! {
    /// A command byte that identifies the type of a data message.
    pub struct DataCmd(u8) {
        /// One UDP datagram.
        DATAGRAM = 1,
        /// Open a TCP stream.
        BEGIN = 2,
        /// A TCP stream is open.
        CONNECTED = 3,
        /// Bytes on an open stream.
        STREAM_DATA = 4,
        /// Close a stream.
        END = 5,
    }
}

caret_int! {
    /// A declared reason for closing a stream
    pub struct EndReason(u8) {
        /// Closing a stream for an unspecified reason.
        MISC = 1,
        /// The remote side closed the TCP connection.
        DONE = 2,
        /// Remote host refused the connection.
        CONNECTREFUSED = 3,
        /// Couldn't look up the hostname.
        RESOLVEFAILED = 4,
        /// Connection timed out.
        TIMEOUT = 5,
        /// The circuit is going away.
        DESTROY = 6,
        /// The exit won't carry this traffic.
        EXITPOLICY = 7,
    }
}

/// Per-message overhead of [`DataMsg::StreamData`]: command, stream id,
/// and length.
pub const STREAM_DATA_OVERHEAD: usize = 1 + 2 + 2;

/// A single message carried in the plaintext of a DATA cell.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DataMsg {
    /// A UDP datagram to (originator to exit) or from (exit to
    /// originator) `target`.
    Datagram {
        /// Where the datagram goes, or where it came from.
        target: TargetAddr,
        /// The datagram itself.
        payload: Vec<u8>,
    },
    /// Ask the exit to open a TCP connection.
    Begin {
        /// Stream chosen by the originator.
        stream_id: StreamId,
        /// Where to connect.
        target: TargetAddr,
    },
    /// The exit has connected a stream.
    Connected {
        /// The stream that is now open.
        stream_id: StreamId,
    },
    /// Bytes for an open stream.
    StreamData {
        /// The stream these bytes belong to.
        stream_id: StreamId,
        /// The bytes.
        data: Vec<u8>,
    },
    /// Close a stream.
    End {
        /// The stream to close.
        stream_id: StreamId,
        /// Why it is closing.
        reason: EndReason,
    },
}

impl DataMsg {
    /// Return the command for this message.
    pub fn cmd(&self) -> DataCmd {
        match self {
            DataMsg::Datagram { .. } => DataCmd::DATAGRAM,
            DataMsg::Begin { .. } => DataCmd::BEGIN,
            DataMsg::Connected { .. } => DataCmd::CONNECTED,
            DataMsg::StreamData { .. } => DataCmd::STREAM_DATA,
            DataMsg::End { .. } => DataCmd::END,
        }
    }

    /// Encode this message.
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        if let DataMsg::Datagram {
            target: TargetAddr::Hostname(h, _),
            ..
        }
        | DataMsg::Begin {
            target: TargetAddr::Hostname(h, _),
            ..
        } = self
        {
            if h.len() > 255 || h.is_empty() {
                return Err(crate::Error::CantEncode("bad hostname length"));
            }
        }
        let mut w = Vec::new();
        w.write_u8(self.cmd().into());
        match self {
            DataMsg::Datagram { target, payload } => {
                w.write(target);
                w.write_u16_prefixed(&payload[..])?;
            }
            DataMsg::Begin { stream_id, target } => {
                w.write_u16((*stream_id).into());
                w.write(target);
            }
            DataMsg::Connected { stream_id } => {
                w.write_u16((*stream_id).into());
            }
            DataMsg::StreamData { stream_id, data } => {
                w.write_u16((*stream_id).into());
                w.write_u16_prefixed(&data[..])?;
            }
            DataMsg::End { stream_id, reason } => {
                w.write_u16((*stream_id).into());
                w.write_u8((*reason).into());
            }
        }
        Ok(w)
    }

    /// Decode a message from the plaintext of a DATA cell.
    pub fn decode(body: &[u8]) -> crate::Result<Self> {
        let mut r = Reader::from_slice(body);
        let cmd: DataCmd = r.take_u8()?.into();
        let msg = match cmd {
            DataCmd::DATAGRAM => {
                let target = r.extract()?;
                let payload = r.take_u16_prefixed()?.to_vec();
                DataMsg::Datagram { target, payload }
            }
            DataCmd::BEGIN => {
                let stream_id = r.take_u16()?.into();
                let target = r.extract()?;
                DataMsg::Begin { stream_id, target }
            }
            DataCmd::CONNECTED => DataMsg::Connected {
                stream_id: r.take_u16()?.into(),
            },
            DataCmd::STREAM_DATA => {
                let stream_id = r.take_u16()?.into();
                let data = r.take_u16_prefixed()?.to_vec();
                DataMsg::StreamData { stream_id, data }
            }
            DataCmd::END => {
                let stream_id = r.take_u16()?.into();
                let reason = r.take_u8()?.into();
                DataMsg::End { stream_id, reason }
            }
            _ => return Err(Error::BadMessage("unrecognized data message").into()),
        };
        r.should_be_exhausted()?;
        Ok(msg)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use hex_literal::hex;

    #[test]
    fn datagram_layout() {
        let msg = DataMsg::Datagram {
            target: "93.184.216.34:80".parse::<SocketAddr>().unwrap().into(),
            payload: b"X".to_vec(),
        };
        let v = msg.encode().unwrap();
        assert_eq!(&v[..], &hex!("01 01 04 5db8d822 0050 0001 58")[..]);
        assert_eq!(DataMsg::decode(&v[..]).unwrap(), msg);
    }

    #[test]
    fn stream_messages() {
        let begin = DataMsg::Begin {
            stream_id: 3.into(),
            target: TargetAddr::Hostname("tracker.example.org".into(), 6969),
        };
        let v = begin.encode().unwrap();
        assert_eq!(DataMsg::decode(&v[..]).unwrap(), begin);

        let data = DataMsg::StreamData {
            stream_id: 3.into(),
            data: vec![0xab; 100],
        };
        let v = data.encode().unwrap();
        assert_eq!(v.len(), 100 + STREAM_DATA_OVERHEAD);
        assert_eq!(DataMsg::decode(&v[..]).unwrap(), data);

        let end = DataMsg::End {
            stream_id: 3.into(),
            reason: EndReason::DONE,
        };
        assert_eq!(&end.encode().unwrap()[..], &hex!("05 0003 02")[..]);
    }

    #[test]
    fn rejects() {
        // trailing garbage
        assert!(DataMsg::decode(&hex!("03 0001 00")).is_err());
        // unknown command
        assert!(DataMsg::decode(&hex!("7f 0001")).is_err());
        // empty hostname
        assert!(DataMsg::decode(&hex!("02 0001 03 00 0050")).is_err());
        let bad = DataMsg::Begin {
            stream_id: 1.into(),
            target: TargetAddr::Hostname("a".repeat(300), 80),
        };
        assert!(bad.encode().is_err());
    }
}
