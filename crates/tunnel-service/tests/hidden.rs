//! Hidden swarms: introduction, rendezvous, and end-to-end datagrams.

#![allow(clippy::unwrap_used)]

mod common;

use common::*;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tunnel_cell::cell::CellKind;
use tunnel_mock::{MockDirectory, MockNetwork};
use tunnel_service::{is_hidden_addr, Error, InfoHash, TunnelConfig, HIDDEN_PORT};

#[tokio::test]
async fn rendezvous_splice() {
    let net = MockNetwork::new();
    let dir = Arc::new(MockDirectory::new());
    let mut rng = rng(10);
    let relays: Vec<_> = (0..3).map(|_| launch_relay(&net, &mut rng)).collect();
    let seeder = launch_client(&net, &mut rng, TunnelConfig::default(), Some(Arc::clone(&dir)));
    let leecher = launch_client(&net, &mut rng, TunnelConfig::default(), Some(Arc::clone(&dir)));
    let ih = InfoHash::from([0x42; 20]);

    let mut at_seeder = seeder.service.hidden_datagrams(1).unwrap();
    let mut at_leecher = leecher.service.hidden_datagrams(1).unwrap();

    tokio::time::timeout(Duration::from_secs(10), seeder.service.announce_hidden(ih, 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dir.n_records(&ih), 1);

    let seeder_addr = tokio::time::timeout(Duration::from_secs(10), leecher.service.join_hidden(ih, 1))
        .await
        .unwrap()
        .unwrap();
    assert!(is_hidden_addr(&seeder_addr));
    assert_eq!(seeder_addr.port(), HIDDEN_PORT);
    assert_eq!(leecher.service.n_hidden_sessions(), 1);

    leecher.service.send_hidden(&seeder_addr, b"hello").unwrap();
    let (leecher_addr, got_ih, payload) =
        tokio::time::timeout(Duration::from_secs(10), at_seeder.next())
            .await
            .unwrap()
            .unwrap();
    assert!(is_hidden_addr(&leecher_addr));
    assert_eq!(got_ih, ih);
    assert_eq!(&payload[..], b"hello");

    seeder.service.send_hidden(&leecher_addr, b"world").unwrap();
    let (from, got_ih, payload) = tokio::time::timeout(Duration::from_secs(10), at_leecher.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, seeder_addr);
    assert_eq!(got_ih, ih);
    assert_eq!(&payload[..], b"world");

    // Neither end ever talks to the other directly.
    let (s, l) = (*seeder.handle.id(), *leecher.handle.id());
    assert!(net
        .cells()
        .iter()
        .all(|c| !(c.from == s && c.to == l) && !(c.from == l && c.to == s)));
    // Every hidden payload went through exactly one relay in each
    // direction.
    let hidden_cells = net
        .cells()
        .into_iter()
        .filter(|c| c.kind == CellKind::DATA_HIDDEN)
        .count();
    assert_eq!(hidden_cells, 4);
    assert!(relays.iter().all(|r| r.service.n_hidden_sessions() == 0));
}

#[tokio::test]
async fn hidden_needs_hops_and_directory() {
    let net = MockNetwork::new();
    let mut rng = rng(11);
    let _r = launch_relay(&net, &mut rng);
    let node = launch_client(&net, &mut rng, TunnelConfig::default(), None);
    let ih = InfoHash::from([7; 20]);

    let err = node.service.announce_hidden(ih, 0).await.unwrap_err();
    assert!(matches!(err, Error::Policy(_)), "{:?}", err);
    let err = node.service.join_hidden(ih, 1).await.unwrap_err();
    assert!(matches!(err, Error::Policy(_)), "{:?}", err);

    let stranger = "240.0.0.99:1024".parse().unwrap();
    assert!(node.service.send_hidden(&stranger, b"x").is_err());
    let not_hidden = "192.0.2.1:1024".parse().unwrap();
    assert!(matches!(
        node.service.send_hidden(&not_hidden, b"x"),
        Err(Error::Policy(_))
    ));
}

#[tokio::test]
async fn unknown_swarm_cannot_be_joined() {
    let net = MockNetwork::new();
    let dir = Arc::new(MockDirectory::new());
    let mut rng = rng(12);
    let _r1 = launch_relay(&net, &mut rng);
    let _r2 = launch_relay(&net, &mut rng);
    let node = launch_client(&net, &mut rng, TunnelConfig::default(), Some(dir));

    let err = node
        .service
        .join_hidden(InfoHash::from([9; 20]), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{:?}", err);
    assert_eq!(node.service.n_hidden_sessions(), 0);
}
