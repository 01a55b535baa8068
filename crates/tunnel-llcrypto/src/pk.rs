//! Public-key cryptography for the tunnel overlay.
//!
//! Every peer has one long-term curve25519 key.  Its public half is the
//! peer's identity on the overlay ([`PeerId`]) and is also the key that
//! circuit handshakes authenticate against.

use std::fmt;
use std::str::FromStr;

use rand_core::{CryptoRng, RngCore};
use thiserror::Error;

/// Re-exporting Curve25519 implementations.
pub mod curve25519 {
    pub use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};
}

use curve25519::{PublicKey, StaticSecret};

/// Length of a peer identity, in bytes.
pub const PEER_ID_LEN: usize = 32;

/// The long-term public identifier of a peer.
///
/// This is the raw curve25519 public key; the hex form is what shows up
/// in logs and configuration files.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Construct a PeerId from a slice of bytes.
    ///
    /// Returns None if the slice is the wrong length.
    pub fn from_bytes(id: &[u8]) -> Option<Self> {
        if id.len() == PEER_ID_LEN {
            let mut b = [0_u8; PEER_ID_LEN];
            b.copy_from_slice(id);
            Some(PeerId(b))
        } else {
            None
        }
    }
    /// Return the bytes of this identity.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
    /// Return the key that handshakes with this peer authenticate against.
    pub fn onion_key(&self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl From<[u8; PEER_ID_LEN]> for PeerId {
    fn from(id: [u8; PEER_ID_LEN]) -> PeerId {
        PeerId(id)
    }
}

impl From<&PublicKey> for PeerId {
    fn from(pk: &PublicKey) -> PeerId {
        PeerId(*pk.as_bytes())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight hex digits are plenty to tell peers apart in a log.
        write!(f, "PeerId({})", hex::encode(&self.0[..4]))
    }
}

/// An error from parsing a hex-encoded [`PeerId`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PeerIdParseError {
    /// The string was not hexadecimal.
    #[error("peer id is not hex")]
    NotHex,
    /// The string decoded to the wrong number of bytes.
    #[error("peer id has wrong length")]
    BadLength,
}

impl FromStr for PeerId {
    type Err = PeerIdParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| PeerIdParseError::NotHex)?;
        PeerId::from_bytes(&bytes[..]).ok_or(PeerIdParseError::BadLength)
    }
}

/// A peer's long-term keypair.
///
/// The secret half zeroizes itself when dropped.
#[derive(Clone)]
pub struct IdentityKey {
    /// Secret half, used by the responder side of every handshake.
    secret: StaticSecret,
    /// Public half; also the peer identity.
    public: PublicKey,
}

impl IdentityKey {
    /// Generate a fresh identity from `rng`.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        Self::from_secret(secret)
    }
    /// Reconstruct an identity from the 32 bytes of its secret.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }
    /// Build an identity from an existing secret.
    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        IdentityKey { secret, public }
    }
    /// Return the secret bytes of this identity, for storage.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
    /// Return the secret half of this identity.
    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }
    /// Return the public half of this identity.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }
    /// Return the peer identity that corresponds to this key.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from(&self.public)
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKey")
            .field("id", &self.peer_id())
            .finish()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn peer_id_hex() {
        let id = PeerId::from([0x2a_u8; 32]);
        let s = id.to_string();
        assert_eq!(s.len(), 64);
        assert_eq!(s.parse::<PeerId>().unwrap(), id);
        assert_eq!(format!("{:?}", id), "PeerId(2a2a2a2a)");
        assert_eq!("xyz".parse::<PeerId>(), Err(PeerIdParseError::NotHex));
        assert_eq!("2a2a".parse::<PeerId>(), Err(PeerIdParseError::BadLength));
        assert!(PeerId::from_bytes(&[1, 2, 3]).is_none());
    }

    #[test]
    fn identity_roundtrip() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let k = IdentityKey::generate(&mut rng);
        let k2 = IdentityKey::from_secret_bytes(k.secret_bytes());
        assert_eq!(k.peer_id(), k2.peer_id());
        assert_eq!(k.peer_id().onion_key().as_bytes(), k.public().as_bytes());
        // Debug output must not leak the secret.
        let dbg = format!("{:?}", k);
        assert!(!dbg.contains(&hex::encode(k.secret_bytes())));
    }
}
