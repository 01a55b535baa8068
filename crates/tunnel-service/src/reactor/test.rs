#![allow(clippy::unwrap_used)]

use super::*;
use crate::peer::PeerHistory;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tunnel_cell::datamsg::{DataMsg, TargetAddr};
use tunnel_cell::msg::{Created, Create, Destroy, Extend, Ping, Rendezvous1, Rendezvous2};
use tunnel_proto::circmap::CircIdRange;
use tunnel_proto::crypto::handshake::ntor::{NtorClient, NtorPublicKey, NtorServer};
use tunnel_proto::crypto::handshake::{ClientHandshake, ServerHandshake};

/// A reactor that we drive by hand, with its outbound queue.
struct Harness {
    r: Reactor,
    out: mpsc::UnboundedReceiver<Outgoing>,
    codec: CellCodec,
    rng: StdRng,
}

/// A peer that talks to the harness.
struct Fake {
    key: IdentityKey,
    handle: PeerHandle,
}

impl Fake {
    fn new(rng: &mut StdRng, n: u8) -> Self {
        let key = IdentityKey::generate(rng);
        let handle = PeerHandle::new(key.peer_id(), format!("10.0.0.{}:7759", n).parse().unwrap());
        Fake { key, handle }
    }
}

impl Harness {
    fn new(exit: bool) -> Self {
        let mut rng = StdRng::seed_from_u64(99);
        let me = IdentityKey::generate(&mut rng);
        let mut config = TunnelConfig::default();
        config.exit_enabled = exit;
        let parts = Reactor::new(
            &me,
            Arc::new(config),
            StdRng::seed_from_u64(100),
            Arc::new(Mutex::new(PeerHistory::new(Duration::from_secs(60)))),
            Arc::new(TunnelStats::default()),
        );
        Harness {
            r: parts.reactor,
            out: parts.outbound,
            codec: CellCodec::new(),
            rng,
        }
    }

    fn me(&self) -> PeerId {
        self.r.me
    }

    fn feed(&mut self, from: &Fake, cell: Cell) {
        let frame = self.codec.encode(&cell).unwrap();
        self.r.handle_packet(from.handle, &frame[..]);
    }

    fn sent(&mut self) -> Vec<(PeerHandle, Cell)> {
        let mut v = Vec::new();
        while let Ok(Some(o)) = self.out.try_next() {
            v.push((o.peer, self.codec.decode(&o.frame[..]).unwrap()));
        }
        v
    }

    /// Have `from` build a one-hop circuit to the reactor.
    fn open(&mut self, from: &Fake) -> (CircId, HopKeys) {
        let id: CircId = self
            .rng
            .sample(CircIdRange::for_link(from.handle.id(), &self.me()));
        let pk = NtorPublicKey::from(self.me());
        let (state, hs) = NtorClient::client1(&mut self.rng, &pk).unwrap();
        let body = CellMsg::from(Create::new(hs)).encode_body().unwrap();
        self.feed(from, Cell::new(id, CellKind::CREATE, body));
        let sent = self.sent();
        assert_eq!(sent.len(), 1);
        let (to, cell) = &sent[0];
        assert_eq!(to, &from.handle);
        assert_eq!(cell.kind(), CellKind::CREATED);
        assert_eq!(cell.circid(), id);
        let reply = match CellMsg::decode_body(CellKind::CREATED, cell.body()).unwrap() {
            CellMsg::Created(c) => c.into_handshake(),
            _ => panic!(),
        };
        let keys = HopKeys::construct(NtorClient::client2(state, reply).unwrap()).unwrap();
        (id, keys)
    }

    /// Seal `msg` for the reactor and send it from `from` on `id`.
    fn send_msg(&mut self, from: &Fake, id: CircId, keys: &HopKeys, msg: CellMsg) {
        let kind = msg.kind();
        let body = keys
            .encrypt_outbound(&mut self.rng, &msg.encode_body().unwrap()[..])
            .unwrap();
        self.feed(from, Cell::new(id, kind, body));
    }
}

fn open_reply(keys: &HopKeys, cell: &Cell) -> CellMsg {
    let clear = keys.decrypt_inbound(cell.body()).unwrap();
    CellMsg::decode_body(cell.kind(), &clear[..]).unwrap()
}

fn destroy_of(cell: &Cell) -> DestroyReason {
    assert_eq!(cell.kind(), CellKind::DESTROY);
    hop::destroy_reason(cell.body())
}

#[test]
fn create_and_ping() {
    let mut h = Harness::new(false);
    let p = Fake::new(&mut h.rng, 1);
    let (id, keys) = h.open(&p);
    h.send_msg(&p, id, &keys, Ping::new(77).into());
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    match open_reply(&keys, &sent[0].1) {
        CellMsg::Pong(pong) => assert_eq!(pong.identifier(), 77),
        m => panic!("{:?}", m),
    }
}

#[test]
fn junk_is_counted() {
    let mut h = Harness::new(false);
    let p = Fake::new(&mut h.rng, 1);
    h.r.handle_packet(p.handle, &b"short"[..]);
    h.feed(&p, Cell::new(7.into(), CellKind::DATA, vec![1, 2, 3]));
    h.feed(&p, Cell::new(8.into(), CellKind::CREATED, vec![0; 64]));
    h.feed(&p, Cell::new(9.into(), CellKind::DESTROY, vec![4]));
    assert!(h.sent().is_empty());
    let s = h.r.stats.snapshot();
    assert_eq!(s.malformed_dropped, 1);
    assert_eq!(s.unknown_dropped, 1);
    assert_eq!(s.stale_dropped, 1);
    assert_eq!(s.cells_received, 3);
}

#[test]
fn bad_handshake_is_refused() {
    let mut h = Harness::new(false);
    let p = Fake::new(&mut h.rng, 1);
    let id: CircId = h.rng.sample(CircIdRange::for_link(p.handle.id(), &h.me()));
    // Addressed to somebody else's key.
    let other = IdentityKey::generate(&mut h.rng);
    let (_, hs) = NtorClient::client1(&mut h.rng, &NtorPublicKey::from(other.peer_id())).unwrap();
    let body = CellMsg::from(Create::new(hs)).encode_body().unwrap();
    h.feed(&p, Cell::new(id, CellKind::CREATE, body));
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(destroy_of(&sent[0].1), DestroyReason::PROTOCOL);
    assert_eq!(h.r.stats.snapshot().crypto_failures, 1);
    assert_eq!(h.r.links.len(), 0);
}

#[test]
fn data_at_non_exit() {
    let mut h = Harness::new(false);
    let p = Fake::new(&mut h.rng, 1);
    let (id, keys) = h.open(&p);
    let dg = DataMsg::Datagram {
        target: TargetAddr::Ip("93.184.216.34:80".parse().unwrap()),
        payload: b"X".to_vec(),
    };
    h.send_msg(&p, id, &keys, CellMsg::Data(dg));
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1.circid(), id);
    assert_eq!(destroy_of(&sent[0].1), DestroyReason::POLICY);
    assert_eq!(h.r.stats.snapshot().policy_rejections, 1);
    assert_eq!(h.r.links.len(), 0);
}

#[test]
fn destroy_is_idempotent() {
    let mut h = Harness::new(false);
    let p = Fake::new(&mut h.rng, 1);
    let (id, _) = h.open(&p);
    let body = CellMsg::from(Destroy::new(DestroyReason::FINISHED))
        .encode_body()
        .unwrap();
    h.feed(&p, Cell::new(id, CellKind::DESTROY, body.clone()));
    assert_eq!(h.r.links.len(), 0);
    h.feed(&p, Cell::new(id, CellKind::DESTROY, body));
    assert!(h.sent().is_empty());
    let s = h.r.stats.snapshot();
    assert_eq!(s.unknown_dropped, 0);
    assert_eq!(s.cells_received, 3);
}

#[test]
fn extend_and_relay() {
    let mut h = Harness::new(false);
    let p = Fake::new(&mut h.rng, 1);
    let q = Fake::new(&mut h.rng, 2);
    let (id, k_r) = h.open(&p);

    // P asks us to extend to Q.
    let (state, hs) =
        NtorClient::client1(&mut h.rng, &NtorPublicKey::from(q.key.peer_id())).unwrap();
    let ext = Extend::new(q.key.peer_id(), q.handle.addr(), hs);
    h.send_msg(&p, id, &k_r, ext.into());
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    let (to, create) = &sent[0];
    assert_eq!(to, &q.handle);
    assert_eq!(create.kind(), CellKind::CREATE);
    let id_q = create.circid();

    // Q answers.
    let client_hs = match CellMsg::decode_body(CellKind::CREATE, create.body()).unwrap() {
        CellMsg::Create(c) => c.handshake().to_vec(),
        _ => panic!(),
    };
    let q_secret = [tunnel_proto::crypto::handshake::ntor::NtorSecretKey::from(&q.key)];
    let (q_kg, reply) = NtorServer::server(&mut h.rng, &q_secret[..], &client_hs[..]).unwrap();
    let k_q_server = HopKeys::construct(q_kg).unwrap();
    let body = CellMsg::from(Created::new(reply)).encode_body().unwrap();
    h.feed(&q, Cell::new(id_q, CellKind::CREATED, body));

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, p.handle);
    let reply = match open_reply(&k_r, &sent[0].1) {
        CellMsg::Extended(e) => e.into_handshake(),
        m => panic!("{:?}", m),
    };
    let k_q = HopKeys::construct(NtorClient::client2(state, reply).unwrap()).unwrap();
    assert_eq!(h.r.relays.len(), 1);

    // A PING for Q passes through us with one layer removed.
    let inner = k_q
        .encrypt_outbound(&mut h.rng, &CellMsg::from(Ping::new(5)).encode_body().unwrap()[..])
        .unwrap();
    let outer = k_r.encrypt_outbound(&mut h.rng, &inner[..]).unwrap();
    h.feed(&p, Cell::new(id, CellKind::PING, outer));
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, q.handle);
    assert_eq!(sent[0].1.circid(), id_q);
    let clear = k_q_server.decrypt_outbound(sent[0].1.body()).unwrap();
    assert_eq!(
        CellMsg::decode_body(CellKind::PING, &clear[..]).unwrap(),
        CellMsg::from(Ping::new(5))
    );
    assert_eq!(h.r.stats.snapshot().relay_forwarded, 1);

    // Q tears it down; P hears about it once.
    let body = CellMsg::from(Destroy::new(DestroyReason::FINISHED))
        .encode_body()
        .unwrap();
    h.feed(&q, Cell::new(id_q, CellKind::DESTROY, body.clone()));
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, p.handle);
    assert_eq!(destroy_of(&sent[0].1), DestroyReason::FINISHED);
    assert_eq!(h.r.relays.len(), 0);
    assert_eq!(h.r.links.len(), 0);
    h.feed(&q, Cell::new(id_q, CellKind::DESTROY, body));
    assert!(h.sent().is_empty());
}

#[test]
fn extend_refused_by_next_hop() {
    let mut h = Harness::new(false);
    let p = Fake::new(&mut h.rng, 1);
    let q = Fake::new(&mut h.rng, 2);
    let (id, k_r) = h.open(&p);
    let (_, hs) = NtorClient::client1(&mut h.rng, &NtorPublicKey::from(q.key.peer_id())).unwrap();
    h.send_msg(&p, id, &k_r, Extend::new(q.key.peer_id(), q.handle.addr(), hs).into());
    let id_q = h.sent()[0].1.circid();
    let body = CellMsg::from(Destroy::new(DestroyReason::PROTOCOL))
        .encode_body()
        .unwrap();
    h.feed(&q, Cell::new(id_q, CellKind::DESTROY, body));
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, p.handle);
    assert_eq!(destroy_of(&sent[0].1), DestroyReason::CONNECTFAILED);
    assert_eq!(h.r.links.len(), 0);
}

#[test]
fn extend_times_out() {
    let mut h = Harness::new(false);
    let p = Fake::new(&mut h.rng, 1);
    let q = Fake::new(&mut h.rng, 2);
    let (id, k_r) = h.open(&p);
    let (_, hs) = NtorClient::client1(&mut h.rng, &NtorPublicKey::from(q.key.peer_id())).unwrap();
    h.send_msg(&p, id, &k_r, Extend::new(q.key.peer_id(), q.handle.addr(), hs).into());
    let _ = h.sent();
    let later = Instant::now() + h.r.config.hop_build_timeout + Duration::from_secs(1);
    h.r.sweep(later);
    let sent = h.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent
        .iter()
        .any(|(to, c)| to == &p.handle && destroy_of(c) == DestroyReason::CONNECTFAILED));
    assert!(sent.iter().any(|(to, _)| to == &q.handle));
    assert_eq!(h.r.links.len(), 0);
}

#[test]
fn cookie_splices_once() {
    let mut h = Harness::new(false);
    let client = Fake::new(&mut h.rng, 1);
    let service = Fake::new(&mut h.rng, 2);
    let late = Fake::new(&mut h.rng, 3);
    let cookie = Cookie::from(0xDEAD_BEEF);

    let (c_id, c_keys) = h.open(&client);
    h.send_msg(&client, c_id, &c_keys, Rendezvous1::new(cookie).into());
    let sent = h.sent();
    assert_eq!(open_reply(&c_keys, &sent[0].1), CellMsg::RendezvousEstablished);

    // A second client can't take the same cookie.
    let (l_id, l_keys) = h.open(&late);
    h.send_msg(&late, l_id, &l_keys, Rendezvous1::new(cookie).into());
    assert_eq!(destroy_of(&h.sent()[0].1), DestroyReason::PROTOCOL);

    let (s_id, s_keys) = h.open(&service);
    h.send_msg(&service, s_id, &s_keys, Rendezvous2::new(cookie, vec![9; 64]).into());
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, client.handle);
    match open_reply(&c_keys, &sent[0].1) {
        CellMsg::Rendezvous2(r) => assert_eq!(r.handshake(), &[9; 64][..]),
        m => panic!("{:?}", m),
    }

    // Cells now cross the splice, re-sealed for the other side.
    let payload = CellMsg::DataHidden(tunnel_cell::msg::DataHidden::new(b"hello".to_vec()));
    h.send_msg(&client, c_id, &c_keys, payload.clone());
    let sent = h.sent();
    assert_eq!(sent[0].0, service.handle);
    assert_eq!(sent[0].1.circid(), s_id);
    assert_eq!(open_reply(&s_keys, &sent[0].1), payload);

    // The cookie is spent.
    let (l_id, l_keys) = h.open(&late);
    h.send_msg(&late, l_id, &l_keys, Rendezvous2::new(cookie, vec![1; 64]).into());
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, late.handle);
    assert_eq!(destroy_of(&sent[0].1), DestroyReason::PROTOCOL);
}

#[test]
fn link_failure_tears_down() {
    let mut h = Harness::new(false);
    let p = Fake::new(&mut h.rng, 1);
    let _ = h.open(&p);
    let _ = h.open(&p);
    assert_eq!(h.r.links.len(), 2);
    h.r.handle_control(CtrlMsg::LinkFailed { peer: p.handle });
    assert_eq!(h.r.links.len(), 0);
    assert!(h.sent().is_empty());
    let hist = h.r.history.lock().unwrap();
    assert!(!hist.usable(p.handle.id(), Instant::now()));
}
