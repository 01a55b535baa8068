//! The SOCKS5 frontend, talked to over real localhost sockets.

#![allow(clippy::unwrap_used)]

mod common;

use common::*;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tunnel_mock::{MockDirectory, MockNetwork};
use tunnel_service::{
    InfoHash, SocksConfigBuilder, TunnelConfig, TunnelConfigBuilder, TunnelService,
};

/// Start SOCKS listeners for `hops` on `service`, on OS-chosen ports.
async fn listen(service: &TunnelService, hops: Vec<u8>) -> Vec<(u8, SocketAddr)> {
    let cfg = SocksConfigBuilder::default()
        .set_socks_port_base(0)
        .set_socks_hops(hops)
        .build()
        .unwrap();
    service.launch_socks(&cfg).await.unwrap()
}

/// Connect to a SOCKS listener and finish method negotiation.
async fn negotiate(addr: SocketAddr) -> TcpStream {
    let mut s = TcpStream::connect(addr).await.unwrap();
    s.write_all(&[5, 1, 0]).await.unwrap();
    let mut reply = [0_u8; 2];
    s.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [5, 0]);
    s
}

/// Send a request with command `cmd` for `target`, and return the
/// reply.
async fn request(s: &mut TcpStream, cmd: u8, target: &SocketAddr) -> [u8; 10] {
    let mut req = vec![5, cmd, 0];
    req.extend(socks_addr_bytes(target));
    s.write_all(&req[..]).await.unwrap();
    let mut reply = [0_u8; 10];
    tokio::time::timeout(Duration::from_secs(10), s.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    reply
}

/// Check that `s` echoes what we write.
async fn check_echo(s: &mut TcpStream, msg: &[u8]) {
    s.write_all(msg).await.unwrap();
    let mut back = vec![0_u8; msg.len()];
    tokio::time::timeout(Duration::from_secs(10), s.read_exact(&mut back[..]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&back[..], msg);
}

#[tokio::test]
async fn connect_through_one_hop() {
    let net = MockNetwork::new();
    let mut rng = rng(20);
    let exit = launch_exit(&net, &mut rng);
    let o = launch_client(&net, &mut rng, TunnelConfig::default(), None);
    let listeners = listen(&o.service, vec![1]).await;
    assert_eq!(listeners.len(), 1);
    assert_eq!(listeners[0].0, 1);

    let echo = tcp_echo().await;
    let mut s = negotiate(listeners[0].1).await;
    let reply = request(&mut s, 1, &echo).await;
    assert_eq!(reply[..2], [5, 0]);
    assert_ne!(reply_addr(&reply).port(), 0);

    check_echo(&mut s, b"GET / HTTP/1.0\r\n\r\n").await;
    // Something bigger than a cell.
    let big: Vec<u8> = (0..5000_u32).map(|i| (i % 251) as u8).collect();
    check_echo(&mut s, &big[..]).await;

    assert!(exit.service.stats().snapshot().exit_bytes_up >= 5000);
    assert!(exit.service.stats().snapshot().exit_bytes_down >= 5000);
}

#[tokio::test]
async fn connect_refused_is_general_failure() {
    let net = MockNetwork::new();
    let mut rng = rng(21);
    let _exit = launch_exit(&net, &mut rng);
    let o = launch_client(&net, &mut rng, TunnelConfig::default(), None);
    let listeners = listen(&o.service, vec![1]).await;

    // Nothing listens here once the listener is dropped.
    let closed = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };
    let mut s = negotiate(listeners[0].1).await;
    let reply = request(&mut s, 1, &closed).await;
    assert_eq!(reply[..2], [5, 1]);
}

#[tokio::test]
async fn direct_connect_with_zero_hops() {
    let net = MockNetwork::new();
    let mut rng = rng(22);
    let o = launch_client(&net, &mut rng, TunnelConfig::default(), None);
    let listeners = listen(&o.service, vec![0]).await;

    let echo = tcp_echo().await;
    let mut s = negotiate(listeners[0].1).await;
    let reply = request(&mut s, 1, &echo).await;
    assert_eq!(reply[..2], [5, 0]);
    check_echo(&mut s, b"direct").await;
    // No tunnel was involved.
    assert!(net.cells().is_empty());
}

#[tokio::test]
async fn bind_is_not_supported() {
    let net = MockNetwork::new();
    let mut rng = rng(23);
    let o = launch_client(&net, &mut rng, TunnelConfig::default(), None);
    let listeners = listen(&o.service, vec![0]).await;

    let mut s = negotiate(listeners[0].1).await;
    let reply = request(&mut s, 2, &"127.0.0.1:80".parse().unwrap()).await;
    assert_eq!(reply[..2], [5, 7]);
}

#[tokio::test]
async fn no_acceptable_method() {
    let net = MockNetwork::new();
    let mut rng = rng(24);
    let o = launch_client(&net, &mut rng, TunnelConfig::default(), None);
    let listeners = listen(&o.service, vec![0]).await;

    let mut s = TcpStream::connect(listeners[0].1).await.unwrap();
    // Only username/password.
    s.write_all(&[5, 1, 2]).await.unwrap();
    let mut reply = [0_u8; 2];
    s.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [5, 0xff]);
}

#[tokio::test]
async fn udp_associate_through_three_hops() {
    let net = MockNetwork::new();
    let mut rng = rng(25);
    let _a = launch_relay(&net, &mut rng);
    let _b = launch_relay(&net, &mut rng);
    let _c = launch_exit(&net, &mut rng);
    let o = launch_client(&net, &mut rng, TunnelConfig::default(), None);
    let listeners = listen(&o.service, vec![3]).await;

    let mut s = negotiate(listeners[0].1).await;
    let reply = request(&mut s, 3, &"0.0.0.0:0".parse().unwrap()).await;
    assert_eq!(reply[..2], [5, 0]);
    let relay_addr = reply_addr(&reply);

    let echo = udp_echo().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut pkt = vec![0, 0, 0];
    pkt.extend(socks_addr_bytes(&echo));
    let header_len = pkt.len();
    pkt.extend_from_slice(b"X");
    client.send_to(&pkt[..], relay_addr).await.unwrap();

    let mut buf = [0_u8; 2048];
    let (n, from) = tokio::time::timeout(Duration::from_secs(10), client.recv_from(&mut buf[..]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, relay_addr);
    assert_eq!(&buf[..header_len], &pkt[..header_len]);
    assert_eq!(&buf[header_len..n], b"X");

    // Closing the control connection ends the association.
    drop(s);
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.send_to(&pkt[..], relay_addr).await.unwrap();
    expect_silence(&client).await;
}

/// Open a UDP association on `listener`, and return its control
/// connection, a socket to talk through it, and where to send to.
async fn open_association(listener: SocketAddr) -> (TcpStream, UdpSocket, SocketAddr) {
    let mut s = negotiate(listener).await;
    let reply = request(&mut s, 3, &"0.0.0.0:0".parse().unwrap()).await;
    assert_eq!(reply[..2], [5, 0]);
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    (s, client, reply_addr(&reply))
}

/// Send `payload` for `target` through the association at `relay`.
async fn send_via(client: &UdpSocket, relay: SocketAddr, target: &SocketAddr, payload: &[u8]) {
    let mut pkt = vec![0, 0, 0];
    pkt.extend(socks_addr_bytes(target));
    pkt.extend_from_slice(payload);
    client.send_to(&pkt[..], relay).await.unwrap();
}

/// Wait for a datagram from the association, and return where it came
/// from and its payload.
async fn recv_via(client: &UdpSocket) -> (SocketAddr, Vec<u8>) {
    let mut buf = [0_u8; 2048];
    let (n, _) = tokio::time::timeout(Duration::from_secs(10), client.recv_from(&mut buf[..]))
        .await
        .unwrap()
        .unwrap();
    // RSV, FRAG, then an IPv4 address and port.
    assert_eq!(buf[..3], [0, 0, 0]);
    (reply_addr(&buf[..10]), buf[10..n].to_vec())
}

/// Check that nothing arrives on `client` for a while.
async fn expect_silence(client: &UdpSocket) {
    let mut buf = [0_u8; 2048];
    let r = tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buf[..])).await;
    assert!(r.is_err(), "unexpected datagram: {:?}", r);
}

#[tokio::test]
async fn udp_associations_keep_their_replies() {
    let net = MockNetwork::new();
    let mut rng = rng(26);
    let exit = launch_exit(&net, &mut rng);
    let config = TunnelConfigBuilder::default()
        .set_min_circuits(1)
        .set_max_circuits(1)
        .build()
        .unwrap();
    let o = launch_client(&net, &mut rng, config, None);
    let listeners = listen(&o.service, vec![1]).await;
    let echo = udp_echo().await;

    let (_s1, c1, relay1) = open_association(listeners[0].1).await;
    let (_s2, c2, relay2) = open_association(listeners[0].1).await;

    send_via(&c2, relay2, &echo, b"two").await;
    assert_eq!(recv_via(&c2).await, (echo, b"two".to_vec()));
    send_via(&c1, relay1, &echo, b"one").await;
    assert_eq!(recv_via(&c1).await, (echo, b"one".to_vec()));
    send_via(&c2, relay2, &echo, b"two-again").await;
    assert_eq!(recv_via(&c2).await, (echo, b"two-again".to_vec()));

    expect_silence(&c1).await;
    expect_silence(&c2).await;
    assert!(exit.service.stats().snapshot().exit_bytes_up >= 3 + 3 + 9);
}

#[tokio::test]
async fn hidden_replies_follow_the_last_sender() {
    let net = MockNetwork::new();
    let dir = Arc::new(MockDirectory::new());
    let mut rng = rng(27);
    let _relays: Vec<_> = (0..3).map(|_| launch_relay(&net, &mut rng)).collect();
    let seeder = launch_client(&net, &mut rng, TunnelConfig::default(), Some(Arc::clone(&dir)));
    let leecher = launch_client(&net, &mut rng, TunnelConfig::default(), Some(Arc::clone(&dir)));
    let ih = InfoHash::from([0x24; 20]);

    // The seeder echoes whatever reaches it.
    let mut at_seeder = seeder.service.hidden_datagrams(1).unwrap();
    let service = seeder.service.clone();
    tokio::spawn(async move {
        while let Some((from, _, payload)) = at_seeder.next().await {
            let _ = service.send_hidden(&from, &payload[..]);
        }
    });
    tokio::time::timeout(Duration::from_secs(10), seeder.service.announce_hidden(ih, 1))
        .await
        .unwrap()
        .unwrap();
    let seeder_addr = tokio::time::timeout(Duration::from_secs(10), leecher.service.join_hidden(ih, 1))
        .await
        .unwrap()
        .unwrap();

    let listeners = listen(&leecher.service, vec![1]).await;
    let (_s1, c1, relay1) = open_association(listeners[0].1).await;
    let (_s2, c2, relay2) = open_association(listeners[0].1).await;

    send_via(&c1, relay1, &seeder_addr, b"one").await;
    assert_eq!(recv_via(&c1).await, (seeder_addr, b"one".to_vec()));
    send_via(&c2, relay2, &seeder_addr, b"two").await;
    assert_eq!(recv_via(&c2).await, (seeder_addr, b"two".to_vec()));
    expect_silence(&c1).await;
}
