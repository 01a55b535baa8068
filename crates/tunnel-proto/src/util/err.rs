//! Define an error type for the tunnel-proto crate.
use thiserror::Error;

/// An error type for the tunnel-proto crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// An error that occurred in the tunnel_bytes crate while decoding an
    /// object.
    #[error("parsing error: {0}")]
    BytesErr(#[from] tunnel_bytes::Error),
    /// An error occurred in the cell-handling layer.
    #[error("cell encoding error: {0}")]
    CellErr(#[from] tunnel_cell::Error),
    /// A handshake named a key that we don't have.
    #[error("specified key was missing")]
    MissingKey,
    /// We tried to produce too much output for some function.
    #[error("couldn't produce that much output")]
    InvalidOutputLength,
    /// We tried to encrypt a message to a hop that wasn't there.
    #[error("tried to encrypt to nonexistent hop")]
    NoSuchHop,
    /// An onion layer failed to authenticate.
    ///
    /// Either the cell was corrupted, or it was encrypted with keys
    /// we don't share.
    #[error("bad cell authentication")]
    BadCellAuth,
    /// A circuit-extension handshake failed.
    #[error("handshake failed")]
    BadHandshake,
    /// A cell body would not fit in a cell once all layers were added.
    #[error("payload of {0} bytes does not fit in a cell")]
    TooLong(usize),
    /// Can't allocate any more circuit IDs on a link.
    #[error("too many entries in map: can't allocate ID")]
    IdRangeFull,
    /// A peer used a circuit ID that doesn't belong to it.
    #[error("circuit ID {0} is not in the peer's range")]
    BadCircId(u32),
    /// A circuit state change that can't happen.
    #[error("bad circuit state transition: {0}")]
    BadTransition(&'static str),
    /// There was a programming error somewhere in the code.
    #[error("Internal programming error: {0}")]
    Internal(&'static str),
}
