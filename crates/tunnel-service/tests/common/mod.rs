//! Helpers shared by the tunnel service's integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tunnel_mock::{MockDirectory, MockNetwork, MockNode};
use tunnel_service::{IntroDirectory, PeerFlags, TunnelConfig, TunnelConfigBuilder};

/// Flags of a relay-only peer.
pub fn relay() -> PeerFlags {
    PeerFlags::RELAY
}

/// Flags of an exit.
pub fn exit() -> PeerFlags {
    PeerFlags::RELAY | PeerFlags::EXIT
}

/// A seeded rng, so failures can be reproduced.
pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Configuration for a node that carries exit traffic.
pub fn exit_config() -> TunnelConfig {
    TunnelConfigBuilder::default()
        .set_exit_enabled(true)
        .build()
        .unwrap()
}

/// Launch a node that only relays.
pub fn launch_relay(net: &Arc<MockNetwork>, rng: &mut StdRng) -> MockNode {
    net.launch_node(rng, TunnelConfig::default(), relay(), None)
        .unwrap()
}

/// Launch an exit node.
pub fn launch_exit(net: &Arc<MockNetwork>, rng: &mut StdRng) -> MockNode {
    net.launch_node(rng, exit_config(), exit(), None).unwrap()
}

/// Launch a node that builds circuits but is never picked for one.
pub fn launch_client(
    net: &Arc<MockNetwork>,
    rng: &mut StdRng,
    config: TunnelConfig,
    directory: Option<Arc<MockDirectory>>,
) -> MockNode {
    let directory = directory.map(|d| d as Arc<dyn IntroDirectory>);
    net.launch_node(rng, config, PeerFlags::empty(), directory)
        .unwrap()
}

/// Poll `cond` until it holds, giving up after a while.
pub async fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Run a UDP echo server on localhost, and return its address.
pub async fn udp_echo() -> SocketAddr {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0_u8; 2048];
        while let Ok((n, from)) = sock.recv_from(&mut buf[..]).await {
            let _ = sock.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// Run a TCP echo server on localhost, and return its address.
pub async fn tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut s, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0_u8; 2048];
                loop {
                    match s.read(&mut buf[..]).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if s.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Encode `addr` the way SOCKS5 does: address type, address, port.
pub fn socks_addr_bytes(addr: &SocketAddr) -> Vec<u8> {
    let mut v = Vec::new();
    match addr {
        SocketAddr::V4(a) => {
            v.push(1);
            v.extend_from_slice(&a.ip().octets());
        }
        SocketAddr::V6(a) => {
            v.push(4);
            v.extend_from_slice(&a.ip().octets());
        }
    }
    v.extend_from_slice(&addr.port().to_be_bytes());
    v
}

/// Parse an IPv4 address and port from a SOCKS5 reply.
pub fn reply_addr(reply: &[u8]) -> SocketAddr {
    assert_eq!(reply[3], 1);
    let ip = std::net::Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7]);
    let port = u16::from_be_bytes([reply[8], reply[9]]);
    SocketAddr::new(ip.into(), port)
}
