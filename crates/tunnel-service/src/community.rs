//! The interfaces the tunnel service needs from the rest of the
//! overlay: a community that finds peers and carries packets, and a
//! directory where hidden swarms advertise their introduction points.

use crate::peer::{PeerFlags, PeerInfo};
use crate::Result;

use async_trait::async_trait;
use tunnel_cell::msg::InfoHash;
use tunnel_llcrypto::pk::PeerId;
use tunnel_proto::peer::PeerHandle;

/// The gossip overlay underneath the tunnels.
///
/// A community knows which peers exist and what they offer, and can
/// send an opaque packet to any of them.  Packets from other peers are
/// handed to the service with
/// [`TunnelHandle::on_packet`](crate::TunnelHandle::on_packet).
#[async_trait]
pub trait Community: Send + Sync {
    /// Return every peer we currently know.
    fn peers(&self) -> Vec<PeerInfo>;

    /// Return the known peers that advertise all of `flags`.
    fn candidates(&self, flags: PeerFlags) -> Vec<PeerInfo> {
        self.peers()
            .into_iter()
            .filter(|p| p.has(flags))
            .collect()
    }

    /// Send `packet` to `peer`.
    ///
    /// Completing without an error means the packet was handed to the
    /// network, not that it arrived.
    async fn send_to(&self, peer: &PeerHandle, packet: Vec<u8>) -> Result<()>;

    /// Ask `peer` to tell us about itself, including its flags.
    async fn introduce(&self, peer: &PeerHandle) -> Result<()>;

    /// Forget about `peer`.
    fn remove_peer(&self, peer: &PeerId);
}

/// Where a hidden swarm can be reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntroPointInfo {
    /// The introduction point.
    pub intro: PeerHandle,
    /// The service key for the swarm, which clients address their
    /// handshake to.
    pub service_key: PeerId,
}

/// A place to publish and find introduction points.
///
/// In a deployment this is the DHT; the tunnel service only needs to
/// store and look up records.
#[async_trait]
pub trait IntroDirectory: Send + Sync {
    /// Publish that `info` is an introduction point for `infohash`.
    async fn announce(&self, infohash: InfoHash, info: IntroPointInfo) -> Result<()>;

    /// Return the introduction points known for `infohash`.
    async fn lookup(&self, infohash: InfoHash) -> Result<Vec<IntroPointInfo>>;
}
