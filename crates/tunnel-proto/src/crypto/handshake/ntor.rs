//! Implements the ntor handshake over curve25519, as used on every
//! hop of a circuit.
//!
//! The responder's long-term key `B` is its [`PeerId`].  The client
//! sends `B || X`, naming the key it expects so that a responder with
//! several keys (a peer that also serves hidden swarms) can pick the
//! right one.  The responder answers `Y || AUTH`.

use super::KeyGenerator;
use crate::crypto::kdf::{HkdfKdf, Kdf};
use crate::{Error, Result, SecretBytes};
use tunnel_bytes::{Reader, Writer};
use tunnel_llcrypto::d::HmacSha256;
use tunnel_llcrypto::pk::curve25519::*;
use tunnel_llcrypto::pk::{IdentityKey, PeerId};
use tunnel_llcrypto::util::ct;

use hmac::Mac;
use rand_core::{CryptoRng, RngCore};
use subtle::{Choice, ConstantTimeEq};
use zeroize::Zeroizing;

/// Length of a client handshake message.
pub const NTOR_CLIENT_LEN: usize = 32 + 32;
/// Length of a server handshake message.
pub const NTOR_SERVER_LEN: usize = 32 + 32;

/// Protocol identifier mixed into every derived value.
const PROTOID: &[u8] = b"tunnel-ntor-curve25519-sha256-1";
/// Salt for key extraction.
const T_KEY: &[u8] = b"tunnel-ntor-curve25519-sha256-1:key_extract";
/// Info string for key expansion.
const M_EXPAND: &[u8] = b"tunnel-ntor-curve25519-sha256-1:key_expand";
/// HMAC key for the authenticator.
const T_MAC: &[u8] = b"tunnel-ntor-curve25519-sha256-1:mac";
/// HMAC key for the verifier.
const T_VERIFY: &[u8] = b"tunnel-ntor-curve25519-sha256-1:verify";

/// Client side of the Ntor handshake.
pub struct NtorClient;

impl super::ClientHandshake for NtorClient {
    type KeyType = NtorPublicKey;
    type StateType = NtorHandshakeState;
    type KeyGen = NtorHkdfKeyGenerator;

    fn client1<R: RngCore + CryptoRng>(
        rng: &mut R,
        key: &Self::KeyType,
    ) -> Result<(Self::StateType, Vec<u8>)> {
        Ok(client_handshake_ntor_v1(rng, key))
    }

    fn client2<T: AsRef<[u8]>>(state: Self::StateType, msg: T) -> Result<Self::KeyGen> {
        client_handshake2_ntor_v1(msg, &state)
    }
}

/// Server side of the ntor handshake.
pub struct NtorServer;

impl super::ServerHandshake for NtorServer {
    type KeyType = NtorSecretKey;
    type KeyGen = NtorHkdfKeyGenerator;

    fn server<R: RngCore + CryptoRng, T: AsRef<[u8]>>(
        rng: &mut R,
        key: &[Self::KeyType],
        msg: T,
    ) -> Result<(Self::KeyGen, Vec<u8>)> {
        server_handshake_ntor_v1(rng, msg, key)
    }
}

/// The public key a client uses to initiate an ntor handshake.
#[derive(Clone, Copy, Debug)]
pub struct NtorPublicKey {
    /// Identity of the responder; its bytes are also the curve25519 key.
    id: PeerId,
}

impl NtorPublicKey {
    /// Construct a key for the peer with identity `id`.
    pub fn new(id: PeerId) -> Self {
        NtorPublicKey { id }
    }
}

impl From<PeerId> for NtorPublicKey {
    fn from(id: PeerId) -> Self {
        NtorPublicKey::new(id)
    }
}

/// A secret key used by a responder to answer an ntor request.
pub struct NtorSecretKey {
    /// Public key components; must match those held by the client.
    pk: NtorPublicKey,
    /// Secret curve25519 key; must correspond to `pk`.
    sk: StaticSecret,
}

impl NtorSecretKey {
    /// Construct a new NtorSecretKey from its components.
    pub fn new(sk: StaticSecret) -> Self {
        let pk = PublicKey::from(&sk);
        NtorSecretKey {
            pk: NtorPublicKey::new(PeerId::from(&pk)),
            sk,
        }
    }
    /// Return the public half of this key.
    pub fn public(&self) -> NtorPublicKey {
        self.pk
    }
    /// Return true if the public key in `self` matches `pk`.
    ///
    /// Used for looking up keys in an array.
    fn matches_pk(&self, pk: &PublicKey) -> Choice {
        self.pk.id.as_bytes().ct_eq(pk.as_bytes())
    }
}

impl From<&IdentityKey> for NtorSecretKey {
    fn from(k: &IdentityKey) -> Self {
        NtorSecretKey::new(k.secret().clone())
    }
}

/// Client state for an ntor handshake.
pub struct NtorHandshakeState {
    /// The responder's public key.  We need to remember this since it
    /// is used to finish the handshake.
    relay_public: NtorPublicKey,
    /// The temporary curve25519 secret (x) that we've generated for
    /// this handshake.
    // A StaticSecret, since it is used twice.
    my_sk: StaticSecret,
    /// The public key `X` corresponding to my_sk.
    my_public: PublicKey,
}

/// KeyGenerator for use with the ntor circuit handshake.
pub struct NtorHkdfKeyGenerator {
    /// Secret key information derived from the handshake, used as input
    /// to HKDF
    seed: SecretBytes,
}

impl NtorHkdfKeyGenerator {
    /// Create a new key generator to expand a given seed
    fn new(seed: SecretBytes) -> Self {
        NtorHkdfKeyGenerator { seed }
    }
}

impl KeyGenerator for NtorHkdfKeyGenerator {
    fn expand(self, keylen: usize) -> Result<SecretBytes> {
        HkdfKdf::new(T_KEY, M_EXPAND).derive(&self.seed[..], keylen)
    }
}

/// An HMAC output, used to validate correctness of a handshake.
type Authcode = [u8; 32];

/// Compute HMAC-SHA256 of `input` under `key`.
fn hmac_sha256(key: &[u8], input: &[u8]) -> Result<Authcode> {
    let mut m = HmacSha256::new_from_slice(key)
        .map_err(|_| Error::Internal("hmac rejected a key"))?;
    m.update(input);
    let mut out = [0_u8; 32];
    out.copy_from_slice(&m.finalize().into_bytes()[..]);
    Ok(out)
}

/// Perform a client handshake, generating a client message and a state
/// object.
fn client_handshake_ntor_v1<R>(
    rng: &mut R,
    relay_public: &NtorPublicKey,
) -> (NtorHandshakeState, Vec<u8>)
where
    R: RngCore + CryptoRng,
{
    let my_sk = StaticSecret::random_from_rng(rng);
    let my_public = PublicKey::from(&my_sk);

    client_handshake_ntor_v1_no_keygen(my_public, my_sk, relay_public)
}

/// Helper: client handshake _without_ generating new keys.
fn client_handshake_ntor_v1_no_keygen(
    my_public: PublicKey,
    my_sk: StaticSecret,
    relay_public: &NtorPublicKey,
) -> (NtorHandshakeState, Vec<u8>) {
    let mut v: Vec<u8> = Vec::with_capacity(NTOR_CLIENT_LEN);

    v.write(&relay_public.id);
    v.write(&my_public);

    let state = NtorHandshakeState {
        relay_public: *relay_public,
        my_public,
        my_sk,
    };

    (state, v)
}

/// Complete a client handshake, returning a key generator on success.
fn client_handshake2_ntor_v1<T>(msg: T, state: &NtorHandshakeState) -> Result<NtorHkdfKeyGenerator>
where
    T: AsRef<[u8]>,
{
    let mut cur = Reader::from_slice(msg.as_ref());
    let their_pk: PublicKey = cur.extract()?;
    let auth: Authcode = cur.extract()?;
    cur.should_be_exhausted()?;

    let xy = state.my_sk.diffie_hellman(&their_pk);
    let xb = state.my_sk.diffie_hellman(&state.relay_public.id.onion_key());
    if !xy.was_contributory() || !xb.was_contributory() {
        return Err(Error::BadHandshake);
    }

    let (keygen, authcode) =
        ntor_derive(&xy, &xb, &state.relay_public, &state.my_public, &their_pk)?;

    if !ct::bytes_eq(&authcode[..], &auth[..]) {
        return Err(Error::BadHandshake);
    }

    Ok(keygen)
}

/// helper: compute a key generator and an authentication code from a set
/// of ntor parameters.
fn ntor_derive(
    xy: &SharedSecret,
    xb: &SharedSecret,
    server_pk: &NtorPublicKey,
    x: &PublicKey,
    y: &PublicKey,
) -> Result<(NtorHkdfKeyGenerator, Authcode)> {
    let server_string = &b"Server"[..];

    let mut secret_input = Zeroizing::new(Vec::new());
    secret_input.write_all(xy.as_bytes()); // EXP(X,y)
    secret_input.write_all(xb.as_bytes()); // EXP(X,b)
    secret_input.write(&server_pk.id); // B
    secret_input.write(x); // X
    secret_input.write(y); // Y
    secret_input.write_all(PROTOID);

    let verify = Zeroizing::new(hmac_sha256(T_VERIFY, &secret_input[..])?);

    let mut auth_input: SecretBytes = Zeroizing::new(Vec::new());
    auth_input.write_all(&verify[..]);
    auth_input.write(&server_pk.id); // B
    auth_input.write(y); // Y
    auth_input.write(x); // X
    auth_input.write_all(PROTOID);
    auth_input.write_all(server_string);

    let auth_mac = hmac_sha256(T_MAC, &auth_input[..])?;

    let keygen = NtorHkdfKeyGenerator::new(secret_input);
    Ok((keygen, auth_mac))
}

/// Perform a server-side ntor handshake.
///
/// On success returns a key generator and a server message.
fn server_handshake_ntor_v1<R, T>(
    rng: &mut R,
    msg: T,
    keys: &[NtorSecretKey],
) -> Result<(NtorHkdfKeyGenerator, Vec<u8>)>
where
    R: RngCore + CryptoRng,
    T: AsRef<[u8]>,
{
    let ephem = StaticSecret::random_from_rng(rng);
    let ephem_pub = PublicKey::from(&ephem);

    server_handshake_ntor_v1_no_keygen(ephem_pub, ephem, msg, keys)
}

/// Helper: perform a server handshake without generating any new keys.
fn server_handshake_ntor_v1_no_keygen<T>(
    ephem_pub: PublicKey,
    ephem: StaticSecret,
    msg: T,
    keys: &[NtorSecretKey],
) -> Result<(NtorHkdfKeyGenerator, Vec<u8>)>
where
    T: AsRef<[u8]>,
{
    let mut cur = Reader::from_slice(msg.as_ref());

    let my_key: PublicKey = cur.extract()?;
    let their_pk: PublicKey = cur.extract()?;
    cur.should_be_exhausted()?;

    let keypair = keys
        .iter()
        .find(|key| bool::from(key.matches_pk(&my_key)))
        .ok_or(Error::MissingKey)?;

    let xy = ephem.diffie_hellman(&their_pk);
    let xb = keypair.sk.diffie_hellman(&their_pk);
    if !xy.was_contributory() || !xb.was_contributory() {
        return Err(Error::BadHandshake);
    }

    let (keygen, authcode) = ntor_derive(&xy, &xb, &keypair.pk, &their_pk, &ephem_pub)?;

    let mut reply: Vec<u8> = Vec::with_capacity(NTOR_SERVER_LEN);
    reply.write(&ephem_pub);
    reply.write_all(&authcode[..]);
    Ok((keygen, reply))
}
