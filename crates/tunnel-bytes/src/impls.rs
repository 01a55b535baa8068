//! Implementations of Writeable and Readable for items that show up all
//! over the tunnel protocol.

use super::*;

impl Writeable for [u8] {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) {
        b.write_all(self)
    }
}

impl Writeable for Vec<u8> {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) {
        b.write_all(&self[..])
    }
}

impl<const N: usize> Writeable for [u8; N] {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) {
        b.write_all(&self[..])
    }
}

impl<const N: usize> Readable for [u8; N] {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        let mut array = [0_u8; N];
        array.copy_from_slice(r.take(N)?);
        Ok(array)
    }
}

// Implementations for reading and writing the unsigned types.
macro_rules! impl_u {
    ( $t:ty, $wrfn:ident, $rdfn:ident ) => {
        impl Writeable for $t {
            fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) {
                b.$wrfn(*self)
            }
        }
        impl Readable for $t {
            fn take_from(b: &mut Reader<'_>) -> Result<Self> {
                b.$rdfn()
            }
        }
    };
}

impl_u!(u8, write_u8, take_u8);
impl_u!(u16, write_u16, take_u16);
impl_u!(u32, write_u32, take_u32);
impl_u!(u64, write_u64, take_u64);
impl_u!(u128, write_u128, take_u128);

/// Socket addresses travel as a family byte, the address, then the port.
mod net_impls {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

    /// Family tag for an IPv4 socket address.
    const FAMILY_V4: u8 = 4;
    /// Family tag for an IPv6 socket address.
    const FAMILY_V6: u8 = 6;

    impl Writeable for Ipv4Addr {
        fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) {
            b.write_all(&self.octets()[..])
        }
    }

    impl Readable for Ipv4Addr {
        fn take_from(r: &mut Reader<'_>) -> Result<Self> {
            Ok(r.take_u32()?.into())
        }
    }

    impl Writeable for Ipv6Addr {
        fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) {
            b.write_all(&self.octets()[..])
        }
    }

    impl Readable for Ipv6Addr {
        fn take_from(r: &mut Reader<'_>) -> Result<Self> {
            Ok(r.take_u128()?.into())
        }
    }

    impl Writeable for SocketAddr {
        fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) {
            match self.ip() {
                IpAddr::V4(ip) => {
                    b.write_u8(FAMILY_V4);
                    b.write(&ip);
                }
                IpAddr::V6(ip) => {
                    b.write_u8(FAMILY_V6);
                    b.write(&ip);
                }
            }
            b.write_u16(self.port());
        }
    }

    impl Readable for SocketAddr {
        fn take_from(r: &mut Reader<'_>) -> Result<Self> {
            let ip: IpAddr = match r.take_u8()? {
                FAMILY_V4 => IpAddr::V4(r.extract()?),
                FAMILY_V6 => IpAddr::V6(r.extract()?),
                _ => return Err(Error::BadMessage("unknown address family")),
            };
            let port = r.take_u16()?;
            Ok(SocketAddr::new(ip, port))
        }
    }
}

/// Curve25519 public keys are the handshake's ephemeral values; peer
/// identities are the long-term ones.
mod curve25519_impls {
    use super::*;
    use tunnel_llcrypto::pk::curve25519::PublicKey;
    use tunnel_llcrypto::pk::PeerId;

    impl Writeable for PublicKey {
        fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) {
            b.write_all(self.as_bytes())
        }
    }

    impl Readable for PublicKey {
        fn take_from(r: &mut Reader<'_>) -> Result<Self> {
            let bytes: [u8; 32] = r.extract()?;
            Ok(bytes.into())
        }
    }

    impl Writeable for PeerId {
        fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) {
            b.write_all(self.as_bytes())
        }
    }

    impl Readable for PeerId {
        fn take_from(r: &mut Reader<'_>) -> Result<Self> {
            let bytes: [u8; 32] = r.extract()?;
            Ok(bytes.into())
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use hex_literal::hex;
    use std::net::SocketAddr;
    use tunnel_llcrypto::pk::curve25519::PublicKey;
    use tunnel_llcrypto::pk::PeerId;

    #[test]
    fn socket_addrs() {
        let a: SocketAddr = "93.184.216.34:80".parse().unwrap();
        let mut v = Vec::new();
        v.write(&a);
        assert_eq!(&v[..], &hex!("04 5db8d822 0050")[..]);
        let mut r = Reader::from_slice(&v[..]);
        assert_eq!(r.extract::<SocketAddr>().unwrap(), a);

        let a6: SocketAddr = "[2001:db8::1]:6881".parse().unwrap();
        let mut v = Vec::new();
        v.write(&a6);
        assert_eq!(v.len(), 1 + 16 + 2);
        let mut r = Reader::from_slice(&v[..]);
        assert_eq!(r.extract::<SocketAddr>().unwrap(), a6);

        let mut r = Reader::from_slice(&hex!("05 00000000 0000")[..]);
        assert!(r.extract::<SocketAddr>().is_err());
        assert_eq!(r.consumed(), 0);
    }

    #[test]
    fn arrays() {
        let mut r = Reader::from_slice(&hex!("0102030405")[..]);
        let a: [u8; 3] = r.extract().unwrap();
        assert_eq!(a, [1, 2, 3]);
        assert!(r.extract::<[u8; 3]>().is_err());
    }

    #[test]
    fn curve25519() {
        let k = hex!("e0f6f2fa7f9c4ef6b8c1bd0c4b1bfb3f0fa4fcf5b6e3ea9a5af2b3d4d7c4e501");
        let pk: PublicKey = k.into();
        let mut v = Vec::new();
        v.write(&pk);
        assert_eq!(&v[..], &k[..]);
        let mut r = Reader::from_slice(&v[..]);
        let pk2: PublicKey = r.extract().unwrap();
        assert_eq!(pk2.as_bytes(), pk.as_bytes());
        let id: PeerId = Reader::from_slice(&v[..]).extract().unwrap();
        assert_eq!(id.as_bytes(), &k);
    }
}
