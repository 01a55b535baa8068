//! Define an error type for the tunnel-cell crate.
use crate::cell::CellKind;
use thiserror::Error;

/// An error type for the tunnel-cell crate.
///
/// This type should probably be split into several.  There's more
/// than one kind of error that can occur while doing something with
/// cells.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// An error that occurred in the tunnel_bytes crate while decoding an
    /// object.
    #[error("parsing error: {0}")]
    BytesErr(#[from] tunnel_bytes::Error),
    /// A frame was not exactly one cell long.
    #[error("cell frame has wrong length: {0} bytes")]
    BadFrameLength(usize),
    /// A cell body was longer than a cell can carry.
    #[error("cell body too long: {0} bytes")]
    BodyTooLong(usize),
    /// A cell used the reserved circuit identifier zero.
    #[error("cell uses circuit id zero")]
    ZeroCircId,
    /// A cell had a kind we don't know how to parse.
    #[error("unrecognized cell kind {0}")]
    UnrecognizedKind(CellKind),
    /// We tried to encode something that can't be represented.
    #[error("message can't be encoded: {0}")]
    CantEncode(&'static str),
    /// There was a programming error somewhere in the code.
    #[error("internal programming error: {0}")]
    Internal(&'static str),
}
