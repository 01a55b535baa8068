//! Structures that represent SOCKS messages

use crate::{Error, Result};

use caret::caret_int;
use std::convert::TryFrom;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tunnel_bytes::{Readable, Reader, Writeable, Writer};

/// A completed SOCKS request, as negotiated on a SOCKS connection.
///
/// Once this request is done, we know where to connect.  Don't
/// discard this object immediately: Use it to report success or
/// failure.
#[derive(Clone, Debug)]
pub struct SocksRequest {
    /// The command requested by the SOCKS client.
    cmd: SocksCmd,
    /// The target address.
    addr: SocksAddr,
    /// The target port.
    port: u16,
}

/// An address sent or received as part of a SOCKS handshake
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocksAddr {
    /// A regular DNS hostname.
    Hostname(SocksHostname),
    /// An IP address.
    Ip(IpAddr),
}

/// A hostname for use with SOCKS.  It is limited in length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocksHostname(String);

caret_int! {
    /// Command from the socks client telling us what to do.
    pub struct SocksCmd(u8) {
        /// Connect to a remote TCP address:port.
        CONNECT = 1,
        /// Not supported here.
        BIND = 2,
        /// Relay UDP datagrams.
        UDP_ASSOCIATE = 3,
    }
}

caret_int! {
    /// Possible reply status values from a SOCKS5 handshake.
    ///
    /// Note that the documentation for these values is kind of scant,
    /// and is limited to what the RFC says.
    pub struct SocksStatus(u8) {
        /// RFC 1928: "succeeded"
        SUCCEEDED = 0x00,
        /// RFC 1928: "general SOCKS server failure"
        GENERAL_FAILURE = 0x01,
        /// RFC 1928: "connection not allowable by ruleset"
        NOT_ALLOWED = 0x02,
        /// RFC 1928: "Network unreachable"
        NETWORK_UNREACHABLE = 0x03,
        /// RFC 1928: "Host unreachable"
        HOST_UNREACHABLE = 0x04,
        /// RFC 1928: "Connection refused"
        CONNECTION_REFUSED = 0x05,
        /// RFC 1928: "TTL expired"
        TTL_EXPIRED = 0x06,
        /// RFC 1928: "Command not supported"
        COMMAND_NOT_SUPPORTED = 0x07,
        /// RFC 1928: "Address type not supported"
        ADDRTYPE_NOT_SUPPORTED = 0x08,
    }
}

impl SocksCmd {
    /// Return true if this is a supported command.
    pub(crate) fn recognized(self) -> bool {
        matches!(self, SocksCmd::CONNECT | SocksCmd::UDP_ASSOCIATE)
    }
}

impl TryFrom<String> for SocksHostname {
    type Error = Error;
    fn try_from(s: String) -> Result<SocksHostname> {
        if s.is_empty() || s.len() > 255 {
            Err(Error::Syntax)
        } else {
            Ok(SocksHostname(s))
        }
    }
}

impl AsRef<str> for SocksHostname {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl From<SocksHostname> for String {
    fn from(s: SocksHostname) -> String {
        s.0
    }
}

impl SocksRequest {
    /// Create a SocksRequest with a given set of fields.
    ///
    /// Return an error if the inputs aren't supported or valid.
    pub(crate) fn new(cmd: SocksCmd, addr: SocksAddr, port: u16) -> Result<Self> {
        if !cmd.recognized() {
            return Err(Error::NoSupport);
        }
        // UDP ASSOCIATE requests are allowed to leave the port blank.
        if port == 0 && cmd == SocksCmd::CONNECT {
            return Err(Error::Syntax);
        }

        Ok(SocksRequest { cmd, addr, port })
    }

    /// Return the command that the client requested.
    pub fn command(&self) -> SocksCmd {
        self.cmd
    }

    /// Return the requested port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return the requested address.
    pub fn addr(&self) -> &SocksAddr {
        &self.addr
    }

    /// Format a reply to this request, indicating success or failure.
    ///
    /// `bound` is the address we report as bound: the local end of the
    /// proxied connection for CONNECT, or the relay endpoint for UDP
    /// ASSOCIATE.
    pub fn reply(&self, status: SocksStatus, bound: Option<std::net::SocketAddr>) -> Vec<u8> {
        status_reply(status, bound)
    }
}

/// Format a SOCKS5 reply with a given status.
///
/// With no bound address, report `0.0.0.0:0`.
pub(crate) fn status_reply(status: SocksStatus, bound: Option<std::net::SocketAddr>) -> Vec<u8> {
    let mut w = Vec::new();
    w.write_u8(5);
    w.write_u8(status.into());
    w.write_u8(0); // reserved.
    match bound {
        Some(a) => {
            w.write(&SocksAddr::Ip(a.ip()));
            w.write_u16(a.port());
        }
        None => {
            w.write(&SocksAddr::Ip(Ipv4Addr::UNSPECIFIED.into()));
            w.write_u16(0);
        }
    }
    w
}

impl fmt::Display for SocksAddr {
    /// Format a string (a hostname or IP address) corresponding to this
    /// SocksAddr.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksAddr::Ip(a) => write!(f, "{}", a),
            SocksAddr::Hostname(h) => write!(f, "{}", h.0),
        }
    }
}

/// SOCKS5 address type: IPv4.
const ATYP_V4: u8 = 1;
/// SOCKS5 address type: hostname.
const ATYP_HOSTNAME: u8 = 3;
/// SOCKS5 address type: IPv6.
const ATYP_V6: u8 = 4;

impl Readable for SocksAddr {
    fn take_from(r: &mut Reader<'_>) -> tunnel_bytes::Result<SocksAddr> {
        let atype = r.take_u8()?;
        match atype {
            ATYP_V4 => {
                let ip4: Ipv4Addr = r.extract()?;
                Ok(SocksAddr::Ip(ip4.into()))
            }
            ATYP_HOSTNAME => {
                let hostname = r.take_u8_prefixed()?;
                let hostname = std::str::from_utf8(hostname)
                    .map_err(|_| tunnel_bytes::Error::BadMessage("bad utf8 on hostname"))?
                    .to_string();
                let hostname = SocksHostname::try_from(hostname)
                    .map_err(|_| tunnel_bytes::Error::BadMessage("empty hostname"))?;
                Ok(SocksAddr::Hostname(hostname))
            }
            ATYP_V6 => {
                let ip6: Ipv6Addr = r.extract()?;
                Ok(SocksAddr::Ip(ip6.into()))
            }
            _ => Err(tunnel_bytes::Error::BadMessage("unrecognized address type.")),
        }
    }
}

impl Writeable for SocksAddr {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) {
        match self {
            SocksAddr::Ip(IpAddr::V4(ip)) => {
                w.write_u8(ATYP_V4);
                w.write(ip);
            }
            SocksAddr::Ip(IpAddr::V6(ip)) => {
                w.write_u8(ATYP_V6);
                w.write(ip);
            }
            SocksAddr::Hostname(h) => {
                // SocksHostname is never longer than 255 bytes.
                w.write_u8(ATYP_HOSTNAME);
                w.write_u8(h.0.len() as u8);
                w.write_all(h.0.as_bytes());
            }
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use hex_literal::hex;
    use std::convert::TryInto;

    #[test]
    fn display_sa() {
        let a = SocksAddr::Ip(IpAddr::V4("127.0.0.1".parse().unwrap()));
        assert_eq!(a.to_string(), "127.0.0.1");

        let a = SocksAddr::Ip(IpAddr::V6("f00::9999".parse().unwrap()));
        assert_eq!(a.to_string(), "f00::9999");

        let a = SocksAddr::Hostname("tracker.example.com".to_string().try_into().unwrap());
        assert_eq!(a.to_string(), "tracker.example.com");
    }

    #[test]
    fn ok_request() {
        let localhost_v4 = SocksAddr::Ip(IpAddr::V4("127.0.0.1".parse().unwrap()));
        let r = SocksRequest::new(SocksCmd::CONNECT, localhost_v4.clone(), 1024).unwrap();
        assert_eq!(r.command(), SocksCmd::CONNECT);
        assert_eq!(r.addr(), &localhost_v4);
        assert_eq!(r.port(), 1024);

        let r = SocksRequest::new(SocksCmd::UDP_ASSOCIATE, localhost_v4, 0).unwrap();
        assert_eq!(r.port(), 0);
    }

    #[test]
    fn bad_request() {
        let localhost_v4 = SocksAddr::Ip(IpAddr::V4("127.0.0.1".parse().unwrap()));

        let e = SocksRequest::new(SocksCmd::BIND, localhost_v4.clone(), 1024);
        assert!(matches!(e, Err(Error::NoSupport)));

        let e = SocksRequest::new(SocksCmd::CONNECT, localhost_v4, 0);
        assert!(matches!(e, Err(Error::Syntax)));

        let long: std::result::Result<SocksHostname, _> = "x".repeat(256).try_into();
        assert!(long.is_err());
    }

    #[test]
    fn replies() {
        let r = status_reply(SocksStatus::SUCCEEDED, Some("127.0.0.1:9050".parse().unwrap()));
        assert_eq!(&r[..], &hex!("05 00 00 01 7f000001 235a")[..]);
        let r = status_reply(SocksStatus::GENERAL_FAILURE, None);
        assert_eq!(&r[..], &hex!("05 01 00 01 00000000 0000")[..]);
    }
}
