//! Handshakes, onion cryptography, and circuit bookkeeping for the
//! tunnel overlay.
//!
//! This crate sits between the cell codec (`tunnel-cell`) and the
//! service that drives circuits (`tunnel-service`).  It knows how to
//! turn a one-way-authenticated key exchange into per-hop session keys,
//! how to wrap and unwrap onion layers, and how to keep the tables that
//! a peer needs to play every role on a circuit: originator, relay,
//! and rendezvous splice point.
//!
//! Nothing here does any IO.  Everything is driven by a caller that
//! owns the tables and hands cells in and out.
//!
//! # Limitations
//!
//! Only one handshake is implemented.  The onion layers use an AEAD
//! with an explicit random nonce, so each layer costs
//! [`crypto::cell::LAYER_OVERHEAD`] bytes of every cell.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![warn(clippy::clone_on_ref_ptr)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::implicit_clone)]
#![warn(clippy::needless_borrow)]
#![deny(clippy::ref_option_ref)]

pub mod circmap;
pub mod circuit;
pub mod crypto;
pub mod peer;
pub mod relay;
mod util;

pub use util::err::Error;

use zeroize::Zeroizing;

/// A vector of bytes that gets cleared when it's dropped.
pub type SecretBytes = Zeroizing<Vec<u8>>;

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Largest number of hops that any circuit may have.
pub const MAX_HOPS: usize = 4;
