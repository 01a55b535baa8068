//! Messages sent over peer links
//!
//! A peer link is the (unreliable, datagram) path between two
//! neighbouring peers.  Every datagram on it that belongs to the tunnel
//! protocol is exactly one cell.

pub mod codec;

use caret::caret_int;

/// The total length of every cell on the wire, header included.
pub const CELL_LEN: usize = 1024;

/// The length of the cleartext cell header: circuit id, kind, body
/// length.
pub const CELL_HEADER_LEN: usize = 4 + 1 + 2;

/// The largest body a cell can carry.
pub const CELL_BODY_LEN: usize = CELL_LEN - CELL_HEADER_LEN;

/// Identifier for a circuit on a single peer link.
///
/// Circuit identifiers are chosen by whoever sends the CREATE, and are
/// only unique per link: the same number may name unrelated circuits
/// on links to different peers.  Zero is never a valid circuit id.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CircId(u32);

impl From<u32> for CircId {
    fn from(item: u32) -> Self {
        Self(item)
    }
}
impl From<CircId> for u32 {
    fn from(id: CircId) -> u32 {
        id.0
    }
}
impl std::fmt::Display for CircId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
impl CircId {
    /// Return true if this is the (invalid) zero circuit id.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

caret_int! {
    /// The kind of a cell.  Sent in the clear in every cell header.
    pub struct CellKind(u8) {
        /// Ask a peer to become the first hop of a new circuit.
        CREATE = 1,
        /// A peer's answer to CREATE.
        CREATED = 2,
        /// Ask the terminal hop to extend the circuit by one peer.
        EXTEND = 3,
        /// The terminal hop's answer to EXTEND.
        EXTENDED = 4,
        /// Application data for the terminal hop (or from it).
        DATA = 5,
        /// Tear down a circuit.  Not encrypted; cascades hop by hop.
        DESTROY = 6,
        /// Liveness probe to the terminal hop.
        PING = 7,
        /// Answer to PING.
        PONG = 8,
        /// A hidden service asks the terminal hop to become an
        /// introduction point for an infohash.
        ESTABLISH_INTRO = 9,
        /// Acknowledges ESTABLISH_INTRO.
        INTRO_ESTABLISHED = 10,
        /// A client asks an introduction point to relay a rendezvous
        /// request to a service; also the relayed request itself.
        INTRO = 11,
        /// A client registers a rendezvous cookie.
        RENDEZVOUS1 = 12,
        /// Acknowledges RENDEZVOUS1.
        RENDEZVOUS_ESTABLISHED = 13,
        /// A service joins a registered rendezvous cookie; relayed to
        /// the client once the circuits are spliced.
        RENDEZVOUS2 = 14,
        /// End-to-end sealed data between a hidden swarm client and
        /// service.
        DATA_HIDDEN = 15,
    }
}

impl CellKind {
    /// Return true if this kind is handled per link, without onion
    /// encryption.
    pub fn is_link_level(self) -> bool {
        matches!(self, CellKind::CREATE | CellKind::CREATED | CellKind::DESTROY)
    }
}

/// A cell as it appears on a peer link.
///
/// The body is opaque here: for most kinds it is onion-encrypted and
/// only meaningful to one hop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    /// Circuit identifier on this link.
    circid: CircId,
    /// Kind of this cell.
    kind: CellKind,
    /// Body of this cell, not including padding.
    body: Vec<u8>,
}

impl Cell {
    /// Construct a new cell.
    pub fn new(circid: CircId, kind: CellKind, body: Vec<u8>) -> Self {
        Cell { circid, kind, body }
    }
    /// Return the circuit id for this cell.
    pub fn circid(&self) -> CircId {
        self.circid
    }
    /// Return the kind of this cell.
    pub fn kind(&self) -> CellKind {
        self.kind
    }
    /// Return the body of this cell.
    pub fn body(&self) -> &[u8] {
        &self.body[..]
    }
    /// Consume this cell and return its components.
    pub fn into_parts(self) -> (CircId, CellKind, Vec<u8>) {
        (self.circid, self.kind, self.body)
    }
    /// Return a copy of this cell relabelled for another link.
    pub fn with_circid(self, circid: CircId) -> Self {
        Cell { circid, ..self }
    }
}
