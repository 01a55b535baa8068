// Test vectors for cell message bodies.

use tunnel_cell::cell::codec::CellCodec;
use tunnel_cell::cell::{Cell, CellKind, CELL_LEN};
use tunnel_cell::datamsg::{DataMsg, TargetAddr};
use tunnel_cell::msg::{self, CellMsg, Cookie, DestroyReason, InfoHash};
use tunnel_llcrypto::pk::PeerId;

use hex_literal::hex;

/// Encode `msg`, check its kind and body, then decode it again.
fn vec_body(msg: CellMsg, kind: CellKind, body: &[u8]) {
    assert_eq!(msg.kind(), kind);
    let encoded = msg.clone().encode_body().unwrap();
    assert_eq!(&encoded[..], body);
    let decoded = CellMsg::decode_body(kind, body).unwrap();
    assert_eq!(decoded, msg);
}

#[test]
fn create_created() {
    vec_body(
        msg::Create::new(&b"hello"[..]).into(),
        CellKind::CREATE,
        &hex!("0005 68656c6c6f"),
    );
    vec_body(
        msg::Created::new(vec![1, 2, 3]).into(),
        CellKind::CREATED,
        &hex!("0003 010203"),
    );
}

#[test]
fn extend() {
    let id = PeerId::from([0x11; 32]);
    let addr = "10.0.0.2:7759".parse().unwrap();
    let m: CellMsg = msg::Extend::new(id, addr, vec![0xaa, 0xbb]).into();
    let mut body = Vec::new();
    body.extend_from_slice(&[0x11; 32]);
    body.extend_from_slice(&hex!("04 0a000002 1e4f 0002 aabb"));
    vec_body(m, CellKind::EXTEND, &body[..]);

    vec_body(
        msg::Extended::new(vec![9; 4]).into(),
        CellKind::EXTENDED,
        &hex!("0004 09090909"),
    );
}

#[test]
fn destroy() {
    vec_body(
        msg::Destroy::new(DestroyReason::TIMEOUT).into(),
        CellKind::DESTROY,
        &hex!("03"),
    );
    // empty destroy bodies mean "no reason".
    let m = CellMsg::decode_body(CellKind::DESTROY, &[]).unwrap();
    assert_eq!(m, msg::Destroy::new(DestroyReason::NONE).into());
}

#[test]
fn ping_pong() {
    vec_body(msg::Ping::new(0x1234).into(), CellKind::PING, &hex!("1234"));
    vec_body(msg::Pong::new(0x1234).into(), CellKind::PONG, &hex!("1234"));
    // trailing bytes are an error
    assert!(CellMsg::decode_body(CellKind::PING, &hex!("123456")).is_err());
}

#[test]
fn hidden_services() {
    let ih = InfoHash::from([0x42; 20]);
    let key = tunnel_llcrypto::pk::curve25519::PublicKey::from([7_u8; 32]);
    let m: CellMsg = msg::EstablishIntro::new(ih, key).into();
    let mut body = vec![0x42; 20];
    body.extend_from_slice(&[7; 32]);
    vec_body(m, CellKind::ESTABLISH_INTRO, &body[..]);

    vec_body(CellMsg::IntroEstablished, CellKind::INTRO_ESTABLISHED, &[]);
    vec_body(
        CellMsg::RendezvousEstablished,
        CellKind::RENDEZVOUS_ESTABLISHED,
        &[],
    );

    let cookie = Cookie::from(0xdead_beef);
    assert_eq!(cookie.to_string(), "0xdeadbeef");
    vec_body(
        msg::Rendezvous1::new(cookie).into(),
        CellKind::RENDEZVOUS1,
        &hex!("deadbeef"),
    );
    vec_body(
        msg::Rendezvous2::new(cookie, vec![5, 6]).into(),
        CellKind::RENDEZVOUS2,
        &hex!("deadbeef 0002 0506"),
    );

    let rp = PeerId::from([0x33; 32]);
    let m: CellMsg =
        msg::Intro::new(ih, rp, "10.0.0.9:1".parse().unwrap(), cookie, vec![1]).into();
    let mut body = vec![0x42; 20];
    body.extend_from_slice(&[0x33; 32]);
    body.extend_from_slice(&hex!("04 0a000009 0001 deadbeef 0001 01"));
    vec_body(m, CellKind::INTRO, &body[..]);

    vec_body(
        msg::DataHidden::new(vec![1, 2, 3]).into(),
        CellKind::DATA_HIDDEN,
        &hex!("010203"),
    );
    assert!(CellMsg::decode_body(CellKind::DATA_HIDDEN, &[]).is_err());
}

#[test]
fn data() {
    let m = CellMsg::Data(DataMsg::Datagram {
        target: TargetAddr::Hostname("router.bittorrent.com".into(), 6881),
        payload: b"d1:ad2:id20:".to_vec(),
    });
    let body = m.clone().encode_body().unwrap();
    assert_eq!(CellMsg::decode_body(CellKind::DATA, &body[..]).unwrap(), m);
}

#[test]
fn unknown_kind() {
    let r = CellMsg::decode_body(CellKind::from(77), &[1, 2]);
    assert_eq!(
        r,
        Err(tunnel_cell::Error::UnrecognizedKind(CellKind::from(77)))
    );
}

#[test]
fn whole_cell() {
    let codec = CellCodec::new();
    let body = CellMsg::from(msg::Create::new(vec![0x55; 32]))
        .encode_body()
        .unwrap();
    let cell = Cell::new(77.into(), CellKind::CREATE, body);
    let frame = codec.encode(&cell).unwrap();
    assert_eq!(frame.len(), CELL_LEN);
    let back = codec.decode(&frame[..]).unwrap();
    let (circid, kind, body) = back.into_parts();
    assert_eq!(u32::from(circid), 77);
    match CellMsg::decode_body(kind, &body[..]).unwrap() {
        CellMsg::Create(c) => assert_eq!(c.handshake(), &[0x55; 32][..]),
        other => panic!("unexpected {:?}", other),
    }
}
