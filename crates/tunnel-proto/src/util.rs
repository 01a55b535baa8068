//! Utilities used for the tunnel protocol.

pub(crate) mod err;
