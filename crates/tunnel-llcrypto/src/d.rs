//! Digests, MACs and key derivation.
//!
//! The overlay only uses SHA-256: as a plain digest, inside HMAC for
//! handshake authentication, and inside HKDF for deriving hop keys.

pub use sha2::Sha256;

/// HMAC-SHA256, used to authenticate handshake replies.
pub type HmacSha256 = hmac::Hmac<Sha256>;

/// HKDF-SHA256, used to expand a handshake secret into hop keys.
pub type HkdfSha256 = hkdf::Hkdf<Sha256>;

/// Return the SHA-256 digest of `input`.
pub fn sha256(input: &[u8]) -> [u8; 32] {
    use digest::Digest;
    let mut out = [0_u8; 32];
    out.copy_from_slice(&Sha256::digest(input));
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn sha256_abc() {
        assert_eq!(
            sha256(b"abc"),
            hex!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }
}
