//! Circuit extension handshake for the tunnel overlay.
//!
//! Handshakes here are one-way-authenticated key exchanges: an
//! initiator that knows the responder's public key sends a client
//! message, and receives a server message in response.  When the
//! handshake succeeds, both sides share a seed for session keys, and
//! the initiator knows that nobody _else_ shares it unless they hold
//! the responder's secret key.
//!
//! The same exchange is used for every hop of a circuit, and again
//! end-to-end between the two parties of a hidden-swarm session.

pub mod ntor;

use crate::{Result, SecretBytes};
use rand_core::{CryptoRng, RngCore};

/// A ClientHandshake is used to generate a client message and
/// handle a server message.
pub trait ClientHandshake {
    /// The type for the responder's public key.
    type KeyType;
    /// The type for the state that the client holds while waiting for a reply.
    type StateType;
    /// A type that is returned and used to generate session keys.
    type KeyGen;
    /// Generate a new client message for a responder with a given key.
    ///
    /// On success, return a state object that will be used to
    /// complete the handshake, along with the message to send.
    fn client1<R: RngCore + CryptoRng>(
        rng: &mut R,
        key: &Self::KeyType,
    ) -> Result<(Self::StateType, Vec<u8>)>;
    /// Handle a server message from a responder, and produce a key
    /// generator.
    ///
    /// The state object must match the one that was used to make the
    /// client message that the server is replying to.
    fn client2<T: AsRef<[u8]>>(state: Self::StateType, msg: T) -> Result<Self::KeyGen>;
}

/// A ServerHandshake is used to handle a client message and generate a
/// server message.
pub trait ServerHandshake {
    /// The type for the responder's key.  This is a private key type.
    type KeyType;
    /// The returned key generator type.
    type KeyGen;

    /// Perform the server handshake.  Take as input a random number
    /// generator, a list of keys that the client might be addressing,
    /// and the client's message.
    ///
    /// On success, return a key generator and a server message to
    /// send in reply.
    fn server<R: RngCore + CryptoRng, T: AsRef<[u8]>>(
        rng: &mut R,
        key: &[Self::KeyType],
        msg: T,
    ) -> Result<(Self::KeyGen, Vec<u8>)>;
}

/// A KeyGenerator is returned by a handshake, and used to generate
/// session keys for the protocol.
///
/// Typically, it wraps a KDF function, and some seed key material.
///
/// It can only be used once.
pub trait KeyGenerator {
    /// Consume the key generator, producing `keylen` bytes of key
    /// material.
    fn expand(self, keylen: usize) -> Result<SecretBytes>;
}
