//! Key derivation functions
//!
//! The handshake produces a seed; an HKDF-SHA256 instance, keyed with
//! a handshake-specific salt and info string, expands that seed into
//! as many session-key bytes as the caller asks for.

use crate::{Error, Result, SecretBytes};
use tunnel_llcrypto::d::HkdfSha256;
use zeroize::Zeroizing;

/// A trait for a key derivation function.
pub(crate) trait Kdf {
    /// Derive `n_bytes` of key data from some secret `seed`.
    fn derive(&self, seed: &[u8], n_bytes: usize) -> Result<SecretBytes>;
}

/// HKDF-SHA256 with a fixed salt and info string.
pub(crate) struct HkdfKdf<'a> {
    /// Salt for the extract step.
    t_key: &'a [u8],
    /// Info string for the expand step.
    m_expand: &'a [u8],
}

impl<'a> HkdfKdf<'a> {
    /// Instantiate an HKDF with a given salt and info string.
    pub(crate) fn new(t_key: &'a [u8], m_expand: &'a [u8]) -> Self {
        HkdfKdf { t_key, m_expand }
    }
}

impl Kdf for HkdfKdf<'_> {
    fn derive(&self, seed: &[u8], n_bytes: usize) -> Result<SecretBytes> {
        let hkdf = HkdfSha256::new(Some(self.t_key), seed);

        let mut result = Zeroizing::new(vec![0; n_bytes]);
        hkdf.expand(self.m_expand, &mut result[..])
            .map_err(|_| Error::InvalidOutputLength)?;
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use hex_literal::hex;

    #[test]
    fn rfc5869_case1() {
        // RFC 5869, test case 1.
        let ikm = hex!("0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b");
        let salt = hex!("000102030405060708090a0b0c");
        let info = hex!("f0f1f2f3f4f5f6f7f8f9");
        let okm = HkdfKdf::new(&salt[..], &info[..])
            .derive(&ikm[..], 42)
            .unwrap();
        assert_eq!(
            &okm[..],
            &hex!(
                "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf
                 34007208d5b887185865"
            )[..]
        );
    }

    #[test]
    fn too_long() {
        let r = HkdfKdf::new(b"salt", b"info").derive(b"seed", 255 * 32 + 1);
        assert_eq!(r, Err(Error::InvalidOutputLength));
    }
}
