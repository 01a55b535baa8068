//! Coding and decoding for the cell types that make up the tunnel
//! protocol.
//!
//! # Overview
//!
//! Peers on the overlay talk to each other with fixed-size cells.  Each
//! cell carries a circuit identifier that is meaningful only on the
//! link between two peers, a kind byte, and a body.
//!
//! The kind byte is always in the clear; for every kind except
//! CREATE, CREATED and DESTROY the body is onion-encrypted, and only
//! the hop that terminates the circuit can parse it.  So this crate has
//! two layers:
//!
//! * [`cell`] frames and unframes raw cells ([`cell::Cell`],
//!   [`cell::codec::CellCodec`]) without looking inside bodies.
//! * [`msg`] parses the cleartext body of each kind into a typed
//!   message ([`msg::CellMsg`]).  The plaintext of a DATA cell is
//!   itself a [`datamsg::DataMsg`].
//!
//! Encryption is not handled here; see the `tunnel-proto` crate.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![warn(clippy::clone_on_ref_ptr)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::needless_borrow)]
#![deny(clippy::ref_option_ref)]

pub mod cell;
pub mod datamsg;
mod err;
pub mod msg;

pub use err::Error;

/// An error type for operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;
