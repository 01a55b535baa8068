//! Onion-layer cryptography for cell bodies
//!
//! The peer that creates a circuit shares two keys with each hop on
//! it: one for "outbound" traffic (away from the originator) and one
//! for "inbound" traffic (toward it).  Each layer is an AES-256-GCM
//! sealing of the layer below it, prefixed with a fresh random nonce,
//! so a layer adds [`LAYER_OVERHEAD`] bytes and any tampering makes
//! the next hop's open fail.
//!
//! Outbound, the originator seals once per hop, innermost layer for
//! the hop that will read the cell; each hop opens one layer.
//! Inbound, only the last hop of a circuit originates cells: it seals
//! once, every hop before it seals again, and the originator opens
//! every layer.

use crate::crypto::handshake::KeyGenerator;
use crate::{Error, Result, MAX_HOPS};
use tunnel_cell::cell::CELL_BODY_LEN;
use tunnel_llcrypto::cipher::aead::{Aead, Aes256Gcm, KeyInit, Nonce, KEY_LEN, NONCE_LEN, TAG_LEN};

use rand_core::{CryptoRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Bytes that every onion layer adds to a body.
pub const LAYER_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Bytes of key material needed for one hop.
pub const HOP_KEY_LEN: usize = 2 * KEY_LEN;

/// Return the largest plaintext that still fits in a cell body after
/// `n_layers` layers of encryption.
pub const fn max_plaintext(n_layers: usize) -> usize {
    CELL_BODY_LEN.saturating_sub(n_layers * LAYER_OVERHEAD)
}

/// Largest plaintext that the last hop of a circuit may originate.
///
/// The last hop doesn't know how many hops lie behind it, so it has to
/// leave room for the longest circuit there can be.
pub const MAX_INBOUND_PLAINTEXT: usize = max_plaintext(MAX_HOPS);

/// Type to store hop indices on a circuit.
///
/// Hop indices are zero-based: "0" denotes the first hop on the circuit.
#[derive(Copy, Clone, Eq, PartialEq, Debug, PartialOrd, Ord, Hash)]
pub struct HopNum(u8);

impl From<HopNum> for u8 {
    fn from(hop: HopNum) -> u8 {
        hop.0
    }
}

impl From<u8> for HopNum {
    fn from(v: u8) -> HopNum {
        HopNum(v)
    }
}

impl From<HopNum> for usize {
    fn from(hop: HopNum) -> usize {
        hop.0 as usize
    }
}

impl std::fmt::Display for HopNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The pair of keys shared between a circuit originator and one hop.
///
/// The same type serves both ends: the originator uses
/// [`HopKeys::encrypt_outbound`] and [`HopKeys::decrypt_inbound`], and
/// the hop uses the other two.
///
/// Both key schedules are wiped when the keys are dropped.
pub struct HopKeys {
    /// Key for cells moving away from the originator.
    forward: Aes256Gcm,
    /// Key for cells moving toward the originator.
    backward: Aes256Gcm,
}

impl std::fmt::Debug for HopKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HopKeys { .. }")
    }
}

impl ZeroizeOnDrop for HopKeys {}

impl HopKeys {
    /// Construct a pair of keys from [`HOP_KEY_LEN`] bytes of seed.
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        if seed.len() != HOP_KEY_LEN {
            return Err(Error::InvalidOutputLength);
        }
        let forward = Aes256Gcm::new_from_slice(&seed[..KEY_LEN])
            .map_err(|_| Error::Internal("bad aes key length"))?;
        let backward = Aes256Gcm::new_from_slice(&seed[KEY_LEN..])
            .map_err(|_| Error::Internal("bad aes key length"))?;
        Ok(HopKeys { forward, backward })
    }

    /// Construct a pair of keys from the output of a handshake.
    pub fn construct<K: KeyGenerator>(keygen: K) -> Result<Self> {
        let seed = keygen.expand(HOP_KEY_LEN)?;
        Self::from_seed(&seed[..])
    }

    /// Originator: add this hop's layer to a cell moving outbound.
    pub fn encrypt_outbound<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        body: &[u8],
    ) -> Result<Vec<u8>> {
        seal(&self.forward, rng, body)
    }

    /// Hop: remove our layer from a cell moving outbound.
    pub fn decrypt_outbound(&self, body: &[u8]) -> Result<Vec<u8>> {
        open(&self.forward, body)
    }

    /// Hop: add our layer to a cell moving inbound.
    pub fn encrypt_inbound<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        body: &[u8],
    ) -> Result<Vec<u8>> {
        seal(&self.backward, rng, body)
    }

    /// Originator: remove this hop's layer from a cell moving inbound.
    pub fn decrypt_inbound(&self, body: &[u8]) -> Result<Vec<u8>> {
        open(&self.backward, body)
    }
}

/// Seal `plaintext` under `key` with a fresh nonce, returning
/// `nonce || ciphertext || tag`.
fn seal<R: RngCore + CryptoRng>(key: &Aes256Gcm, rng: &mut R, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0_u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce[..]);
    let ct = key
        .encrypt(Nonce::from_slice(&nonce[..]), plaintext)
        .map_err(|_| Error::Internal("aead refused to encrypt"))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce[..]);
    out.extend_from_slice(&ct[..]);
    Ok(out)
}

/// Open a `nonce || ciphertext || tag` body sealed by [`seal`].
fn open(key: &Aes256Gcm, body: &[u8]) -> Result<Vec<u8>> {
    if body.len() < LAYER_OVERHEAD {
        return Err(Error::BadCellAuth);
    }
    let (nonce, ct) = body.split_at(NONCE_LEN);
    key.decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|_| Error::BadCellAuth)
}

/// A client's view of the cryptographic state for an entire
/// constructed circuit.
#[derive(Debug, Default)]
pub struct ClientCrypt {
    /// Keys for each hop, first hop first.
    layers: Vec<HopKeys>,
}

impl ZeroizeOnDrop for ClientCrypt {}

impl ClientCrypt {
    /// Return a new (empty) ClientCrypt.
    pub fn new() -> Self {
        ClientCrypt { layers: Vec::new() }
    }
    /// Prepare a cell body to be sent away from the client.
    ///
    /// The body is sealed for the `hop`th hop, and then for each hop
    /// before it, so that each can remove exactly one layer.
    pub fn encrypt<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        body: &[u8],
        hop: HopNum,
    ) -> Result<Vec<u8>> {
        let hop: usize = hop.into();
        if hop >= self.layers.len() {
            return Err(Error::NoSuchHop);
        }
        if body.len() > max_plaintext(hop + 1) {
            return Err(Error::TooLong(body.len()));
        }
        let mut cur = body.to_vec();
        for layer in self.layers[..=hop].iter().rev() {
            cur = layer.encrypt_outbound(rng, &cur[..])?;
        }
        Ok(cur)
    }
    /// Remove every layer from a body that came from the last hop.
    pub fn decrypt(&self, body: &[u8]) -> Result<Vec<u8>> {
        if self.layers.is_empty() {
            return Err(Error::NoSuchHop);
        }
        let mut cur = body.to_vec();
        for layer in &self.layers {
            cur = layer.decrypt_inbound(&cur[..])?;
        }
        Ok(cur)
    }
    /// Add a new layer to this ClientCrypt
    pub fn add_layer(&mut self, layer: HopKeys) {
        assert!(self.layers.len() < std::u8::MAX as usize);
        self.layers.push(layer);
    }

    /// Return the number of layers configured on this ClientCrypt.
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Return the largest plaintext we can send to the last hop.
    pub fn max_plaintext(&self) -> usize {
        max_plaintext(self.layers.len())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    fn keys(seed: u8) -> HopKeys {
        HopKeys::from_seed(&[seed; HOP_KEY_LEN][..]).unwrap()
    }

    #[test]
    fn roundtrip() {
        let mut cc = ClientCrypt::new();
        cc.add_layer(keys(1));
        cc.add_layer(keys(2));
        cc.add_layer(keys(3));
        assert_eq!(cc.n_layers(), 3);

        let r1 = keys(1);
        let r2 = keys(2);
        let r3 = keys(3);

        let mut rng = StdRng::seed_from_u64(1234);
        for _ in 1..200 {
            // outbound cell
            let mut orig = vec![0_u8; cc.max_plaintext()];
            rng.fill_bytes(&mut orig[..]);
            let cell = cc.encrypt(&mut rng, &orig[..], 2.into()).unwrap();
            assert_eq!(cell.len(), CELL_BODY_LEN);
            let cell = r1.decrypt_outbound(&cell[..]).unwrap();
            let cell = r2.decrypt_outbound(&cell[..]).unwrap();
            let cell = r3.decrypt_outbound(&cell[..]).unwrap();
            assert_eq!(cell, orig);

            // inbound cell
            let mut orig = vec![0_u8; 300];
            rng.fill_bytes(&mut orig[..]);
            let cell = r3.encrypt_inbound(&mut rng, &orig[..]).unwrap();
            let cell = r2.encrypt_inbound(&mut rng, &cell[..]).unwrap();
            let cell = r1.encrypt_inbound(&mut rng, &cell[..]).unwrap();
            assert_eq!(cell.len(), 300 + 3 * LAYER_OVERHEAD);
            assert_eq!(cc.decrypt(&cell[..]).unwrap(), orig);
        }
    }

    #[test]
    fn shorter_hop() {
        let mut cc = ClientCrypt::new();
        cc.add_layer(keys(1));
        cc.add_layer(keys(2));
        let mut rng = StdRng::seed_from_u64(5);
        let cell = cc.encrypt(&mut rng, b"extend me", 0.into()).unwrap();
        assert_eq!(keys(1).decrypt_outbound(&cell[..]).unwrap(), b"extend me");
        assert_eq!(
            cc.encrypt(&mut rng, b"x", 2.into()).err(),
            Some(Error::NoSuchHop)
        );
    }

    #[test]
    fn tampering() {
        let mut cc = ClientCrypt::new();
        cc.add_layer(keys(1));
        cc.add_layer(keys(2));
        let mut rng = StdRng::seed_from_u64(6);

        let mut cell = cc.encrypt(&mut rng, b"hello", 1.into()).unwrap();
        cell[NONCE_LEN + 3] ^= 0x80;
        assert_eq!(keys(1).decrypt_outbound(&cell[..]).err(), Some(Error::BadCellAuth));

        // wrong keys
        let cell = cc.encrypt(&mut rng, b"hello", 1.into()).unwrap();
        assert_eq!(keys(2).decrypt_outbound(&cell[..]).err(), Some(Error::BadCellAuth));

        // too short to hold a layer
        assert_eq!(keys(1).decrypt_inbound(&[0; 20]).err(), Some(Error::BadCellAuth));

        // too long for the circuit
        let big = vec![0_u8; max_plaintext(2) + 1];
        assert_eq!(
            cc.encrypt(&mut rng, &big[..], 1.into()).err(),
            Some(Error::TooLong(big.len()))
        );
    }

    #[test]
    fn keys_are_wiped_on_drop() {
        fn wiped_on_drop<T: ZeroizeOnDrop>() {}
        wiped_on_drop::<HopKeys>();
        wiped_on_drop::<ClientCrypt>();
    }

    #[test]
    fn limits() {
        assert_eq!(LAYER_OVERHEAD, 28);
        assert_eq!(max_plaintext(0), CELL_BODY_LEN);
        assert_eq!(MAX_INBOUND_PLAINTEXT, CELL_BODY_LEN - 4 * 28);
        assert!(HopKeys::from_seed(&[0; 10]).is_err());
    }
}
