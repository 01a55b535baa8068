//! Low-level crypto implementations for the tunnel overlay.
//!
//! This crate doesn't have much of interest: for the most part it
//! just wraps other crates that implement lower-level cryptographic
//! functionality, so that the rest of the workspace names one set of
//! primitives.  A deployment must agree on all of them.
//!
//! Encryption is implemented in `cipher`, digests and key derivation
//! are in `d`, and key agreement plus peer identities are in `pk`.

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

pub mod cipher;
pub mod d;
pub mod pk;
pub mod util;
