//! Internal: declare an Error type for tunnel-bytes

use thiserror::Error;

/// Error type for decoding tunnel protocol objects from bytes.
#[derive(Error, Debug, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    /// We ran out of bytes before the object was complete.
    #[error("object truncated (or not fully present)")]
    Truncated,
    /// The object was complete but there were bytes left over.
    #[error("extra bytes at end of object")]
    ExtraneousBytes,
    /// A length field claimed more bytes than the format allows.
    #[error("declared length {0} is too large")]
    BadLength(usize),
    /// The object was present but not well-formed.
    #[error("bad object: {0}")]
    BadMessage(&'static str),
    /// A programming error inside this crate or its callers.
    #[error("internal programming error")]
    Internal,
}
