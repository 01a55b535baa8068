//! How we name the peers we talk to.

use std::fmt;
use std::net::SocketAddr;

use tunnel_llcrypto::pk::PeerId;

/// The identity and network address of a peer.
///
/// Both halves are needed to send anything: the address to reach the
/// peer, and the identity to authenticate the handshake against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    /// The peer's long-term identity.
    id: PeerId,
    /// Where the peer can be reached.
    addr: SocketAddr,
}

impl PeerHandle {
    /// Construct a new PeerHandle.
    pub fn new(id: PeerId, addr: SocketAddr) -> Self {
        PeerHandle { id, addr }
    }
    /// Return the identity of this peer.
    pub fn id(&self) -> &PeerId {
        &self.id
    }
    /// Return the network address of this peer.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.id, self.addr)
    }
}
