//! Cryptographic functions of the tunnel protocol.
//!
//! There are three sub-modules here:
//!
//!   * `cell` implements the onion layers that protect cell bodies.
//!   * `handshake` implements the circuit-extension handshake.
//!   * `kdf` turns handshake output into key material.

pub mod cell;
pub mod handshake;
pub(crate) mod kdf;
