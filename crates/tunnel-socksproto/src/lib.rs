//! Implements the server side of SOCKS5, as spoken to the tunnel
//! overlay's local proxy ports.
//!
//! SOCKS is an old and somewhat janky protocol for telling a proxy
//! where to connect.  The BitTorrent engines that use the tunnels speak
//! SOCKS5 with no authentication, and use both CONNECT (for TCP peers
//! and trackers) and UDP ASSOCIATE (for uTP, DHT and UDP trackers).
//!
//! This crate tries to hide the actual details of the protocol, and
//! expose a stateful handshake type that eventually provides a
//! [SocksRequest] or a canonical failure reply.  It also encodes and
//! decodes the header that prefixes every datagram on a UDP
//! association.
//!
//! SOCKS5 is specified in [RFC 1928](https://tools.ietf.org/html/rfc1928).
//! Versions 4 and 4a are not accepted.

#![warn(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::await_holding_lock)]
#![warn(unreachable_pub)]

mod err;
mod handshake;
mod msg;
mod udp;

pub use err::Error;
pub use handshake::{Action, SocksHandshake};
pub use msg::{SocksAddr, SocksCmd, SocksHostname, SocksRequest, SocksStatus};
pub use udp::{decode_udp_datagram, encode_udp_datagram, UdpDatagram};

/// A Result type for the tunnel_socksproto crate.
pub type Result<T> = std::result::Result<T, Error>;
