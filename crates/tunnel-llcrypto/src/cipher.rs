//! Ciphers used to implement the tunnel protocol.
//!
//! Every onion layer is sealed with AES-256-GCM under an explicit,
//! random 96-bit nonce.  Cells travel over an unreliable datagram
//! transport, so no layer may depend on cipher state carried from one
//! cell to the next.

/// Re-exports of AES-256-GCM.
pub mod aead {
    pub use aes_gcm::aead::{Aead, KeyInit, Payload};
    pub use aes_gcm::{Aes256Gcm, Key, Nonce};

    /// Length of an AES-256-GCM key in bytes.
    pub const KEY_LEN: usize = 32;
    /// Length of the explicit nonce carried with every sealed layer.
    pub const NONCE_LEN: usize = 12;
    /// Length of the authentication tag appended to every sealed layer.
    pub const TAG_LEN: usize = 16;
}
