// Build the keys of a three-hop circuit with real handshakes, then push
// cells through it in both directions.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Instant;

use tunnel_llcrypto::pk::IdentityKey;
use tunnel_proto::circuit::{OriginCirc, UniqId};
use tunnel_proto::crypto::cell::HopKeys;
use tunnel_proto::crypto::handshake::ntor::{NtorClient, NtorSecretKey, NtorServer};
use tunnel_proto::crypto::handshake::{ClientHandshake, ServerHandshake};
use tunnel_proto::peer::PeerHandle;
use tunnel_proto::relay::{RelayEntry, Side};

#[test]
fn three_hops() -> tunnel_proto::Result<()> {
    let mut rng = StdRng::seed_from_u64(2021);
    let now = Instant::now();

    let relays: Vec<IdentityKey> = (0..3).map(|_| IdentityKey::generate(&mut rng)).collect();
    let handles: Vec<PeerHandle> = relays
        .iter()
        .enumerate()
        .map(|(i, k)| {
            PeerHandle::new(
                k.peer_id(),
                format!("127.0.0.1:{}", 7000 + i).parse().unwrap(),
            )
        })
        .collect();

    let mut circ = OriginCirc::new(UniqId::new(1), 0x8000_0001.into(), 3, true, now);
    let mut relay_keys = Vec::new();
    for (key, handle) in relays.iter().zip(handles.iter()) {
        circ.begin_extend(*handle)?;
        let (state, cmsg) = NtorClient::client1(&mut rng, &(*handle.id()).into())?;
        let (skeygen, smsg) = NtorServer::server(&mut rng, &[NtorSecretKey::from(key)], &cmsg)?;
        relay_keys.push(HopKeys::construct(skeygen)?);
        let ckeygen = NtorClient::client2(state, smsg)?;
        circ.complete_hop(HopKeys::construct(ckeygen)?, now)?;
    }
    assert!(circ.is_ready());
    assert_eq!(circ.n_keys(), 3);

    // Hops 0 and 1 are relays; hop 2 is the terminal.
    let terminal = relay_keys.pop().unwrap();
    let mut entries: Vec<RelayEntry> = relay_keys
        .into_iter()
        .enumerate()
        .map(|(i, k)| {
            RelayEntry::new_forward(
                (handles[i], (i as u32 + 1).into()),
                k,
                (handles[i + 1], (i as u32 + 10).into()),
                now,
            )
        })
        .collect();

    let mut body = circ.encrypt(&mut rng, b"d1:ad2:id20:")?;
    for e in entries.iter_mut() {
        body = e.relay(&mut rng, Side::Origin, &body[..], now)?.2;
    }
    assert_eq!(terminal.decrypt_outbound(&body[..])?, b"d1:ad2:id20:");

    let mut body = terminal.encrypt_inbound(&mut rng, b"pong")?;
    for e in entries.iter_mut().rev() {
        body = e.relay(&mut rng, Side::Away, &body[..], now)?.2;
    }
    assert_eq!(circ.decrypt(&body[..])?, b"pong");
    Ok(())
}
