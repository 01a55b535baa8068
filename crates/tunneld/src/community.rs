//! A community that talks to other peers directly over UDP.
//!
//! Every datagram starts with the same header:
//!
//! ```text
//!     community id    [20 bytes]
//!     message type    [1 byte]
//!     sender's id     [32 bytes]
//! ```
//!
//! An introduction request or response then carries the sender's flags
//! in one byte; a cell message carries a tunnel cell as its whole body.
//! Mainnet and testnet use different community ids, and datagrams with
//! any other id are dropped unread.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tracing::{debug, trace};
use tunnel_bytes::{Reader, Writer};
use tunnel_llcrypto::d::sha256;
use tunnel_service::{
    Community, Error, PeerFlags, PeerHandle, PeerId, PeerInfo, Result, TunnelConfig,
    TunnelHandle,
};

/// Length of a community id.
const COMMUNITY_ID_LEN: usize = 20;

/// Largest datagram we'll try to receive.
const MAX_DATAGRAM: usize = 65_535;

/// Message type: tell me about yourself.
const INTRO_REQUEST: u8 = 1;
/// Message type: here is what I offer.
const INTRO_RESPONSE: u8 = 2;
/// Message type: a tunnel cell.
const CELL: u8 = 3;

/// Return the community id for mainnet, or for testnet if `testnet`.
pub(crate) fn community_id(testnet: bool) -> [u8; COMMUNITY_ID_LEN] {
    let label: &[u8] = if testnet {
        b"tunnel-overlay testnet community"
    } else {
        b"tunnel-overlay community"
    };
    let digest = sha256(label);
    let mut id = [0_u8; COMMUNITY_ID_LEN];
    id.copy_from_slice(&digest[..COMMUNITY_ID_LEN]);
    id
}

/// Return the flags a peer running with `config` advertises.
pub(crate) fn flags_for(config: &TunnelConfig) -> PeerFlags {
    if config.exit_enabled() {
        PeerFlags::RELAY | PeerFlags::EXIT
    } else {
        PeerFlags::RELAY
    }
}

/// The body of one datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Message {
    /// Ask the receiver to introduce itself.  Carries our own flags.
    IntroRequest(PeerFlags),
    /// Answer to an introduction request.
    IntroResponse(PeerFlags),
    /// A packet for the tunnel service.
    Cell(Vec<u8>),
}

/// Encode `msg` from `sender` as a datagram in community `community`.
fn encode(community: &[u8; COMMUNITY_ID_LEN], sender: &PeerId, msg: Message) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_all(&community[..]);
    let (kind, body) = match msg {
        Message::IntroRequest(flags) => (INTRO_REQUEST, vec![flags.bits()]),
        Message::IntroResponse(flags) => (INTRO_RESPONSE, vec![flags.bits()]),
        Message::Cell(cell) => (CELL, cell),
    };
    out.write_u8(kind);
    out.write(sender);
    out.write_all(&body[..]);
    out
}

/// Decode a datagram.
///
/// Returns `Ok(None)` if the datagram belongs to some other community.
fn decode(
    community: &[u8; COMMUNITY_ID_LEN],
    packet: &[u8],
) -> tunnel_bytes::Result<Option<(PeerId, Message)>> {
    let mut r = Reader::from_slice(packet);
    if r.take(COMMUNITY_ID_LEN)? != &community[..] {
        return Ok(None);
    }
    let kind = r.take_u8()?;
    let sender: PeerId = r.extract()?;
    let msg = match kind {
        INTRO_REQUEST | INTRO_RESPONSE => {
            let flags = PeerFlags::from(r.take_u8()?);
            r.should_be_exhausted()?;
            if kind == INTRO_REQUEST {
                Message::IntroRequest(flags)
            } else {
                Message::IntroResponse(flags)
            }
        }
        CELL => Message::Cell(r.take_rest().to_vec()),
        _ => return Err(tunnel_bytes::Error::BadMessage("unknown message type")),
    };
    Ok(Some((sender, msg)))
}

/// A [`Community`] made of the peers we have exchanged UDP datagrams
/// with.
pub(crate) struct UdpCommunity {
    /// Our socket.
    socket: UdpSocket,
    /// Our identity.
    me: PeerId,
    /// What we advertise.
    flags: PeerFlags,
    /// Which community we are in.
    id: [u8; COMMUNITY_ID_LEN],
    /// Every peer we know, by identity.
    peers: Mutex<HashMap<PeerId, PeerInfo>>,
}

impl UdpCommunity {
    /// Bind a community socket on `addr`.
    pub(crate) async fn bind(
        addr: SocketAddr,
        me: PeerId,
        flags: PeerFlags,
        testnet: bool,
    ) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Arc::new(UdpCommunity {
            socket,
            me,
            flags,
            id: community_id(testnet),
            peers: Mutex::new(HashMap::new()),
        }))
    }

    /// Return the address we are listening on.
    pub(crate) fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Remember `peer`, and its flags if we know them.
    ///
    /// A peer we already know keeps its flags unless new ones are given,
    /// and moves to the address we last heard from it on.
    pub(crate) fn learn(&self, peer: PeerHandle, flags: Option<PeerFlags>) {
        if peer.id() == &self.me {
            return;
        }
        let mut peers = match self.peers.lock() {
            Ok(p) => p,
            Err(_) => return,
        };
        let ent = peers
            .entry(*peer.id())
            .or_insert_with(|| PeerInfo::new(peer, None));
        ent.handle = peer;
        if flags.is_some() {
            ent.flags = flags;
        }
    }

    /// Send `msg` to `peer`.
    async fn send_msg(&self, peer: &PeerHandle, msg: Message) -> Result<()> {
        let packet = encode(&self.id, &self.me, msg);
        self.socket
            .send_to(&packet[..], peer.addr())
            .await
            .map_err(|e| Error::Transport(format!("send to {}: {}", peer, e)))?;
        Ok(())
    }

    /// Receive datagrams forever, answering introductions and handing
    /// cells to `tunnels`.
    pub(crate) async fn run(self: Arc<Self>, tunnels: TunnelHandle) {
        let mut buf = vec![0_u8; MAX_DATAGRAM];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf[..]).await {
                Ok(v) => v,
                Err(e) => {
                    debug!("community socket: {}", e);
                    continue;
                }
            };
            let (sender, msg) = match decode(&self.id, &buf[..n]) {
                Ok(Some(d)) => d,
                Ok(None) => {
                    trace!("dropping datagram from {}: foreign community", from);
                    continue;
                }
                Err(e) => {
                    debug!("bad datagram from {}: {}", from, e);
                    continue;
                }
            };
            if sender == self.me {
                continue;
            }
            let peer = PeerHandle::new(sender, from);
            match msg {
                Message::IntroRequest(flags) => {
                    self.learn(peer, Some(flags));
                    if let Err(e) = self.send_msg(&peer, Message::IntroResponse(self.flags)).await
                    {
                        debug!("couldn't answer introduction: {}", e);
                    }
                }
                Message::IntroResponse(flags) => {
                    trace!("{} introduced itself: {:?}", peer, flags);
                    self.learn(peer, Some(flags));
                }
                Message::Cell(cell) => {
                    self.learn(peer, None);
                    tunnels.on_packet(peer, cell);
                }
            }
        }
    }
}

#[async_trait]
impl Community for UdpCommunity {
    fn peers(&self) -> Vec<PeerInfo> {
        match self.peers.lock() {
            Ok(p) => p.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn send_to(&self, peer: &PeerHandle, packet: Vec<u8>) -> Result<()> {
        self.send_msg(peer, Message::Cell(packet)).await
    }

    async fn introduce(&self, peer: &PeerHandle) -> Result<()> {
        self.send_msg(peer, Message::IntroRequest(self.flags)).await
    }

    fn remove_peer(&self, peer: &PeerId) {
        if let Ok(mut p) = self.peers.lock() {
            p.remove(peer);
        }
    }
}
