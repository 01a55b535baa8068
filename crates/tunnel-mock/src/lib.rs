//! Support for testing the tunnel overlay without a network.
//!
//! This crate should only be used for writing tests.
//!
//! [`net::MockNetwork`] stands in for the community: every node on it
//! runs a real [`TunnelService`](tunnel_service::TunnelService), and
//! packets between nodes are handed over in memory and logged so that
//! tests can look at what went over each link.
//! [`directory::MockDirectory`] stands in for the DHT that hidden swarms
//! publish their introduction points in.

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

pub mod directory;
pub mod net;

pub use directory::MockDirectory;
pub use net::{MockCommunity, MockNetwork, MockNode, ObservedCell};
