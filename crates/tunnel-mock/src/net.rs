//! A simple in-memory community network.

// Note: this module only exists for writing tests.  It delivers every
// packet, in order, immediately; resist the temptation to make it more
// realistic than the tests need.

use async_trait::async_trait;
use rand::{CryptoRng, Rng};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tracing::trace;
use tunnel_cell::cell::codec::CellCodec;
use tunnel_cell::cell::{CellKind, CircId};
use tunnel_service::{
    Community, Error, IdentityKey, IntroDirectory, PeerFlags, PeerHandle, PeerId, PeerInfo,
    Result, TunnelConfig, TunnelHandle, TunnelService,
};

/// Port every mock node pretends to listen on.
const MOCK_PORT: u16 = 7759;

/// A simulated community, shared by every node in a test.
///
/// Nodes are added with [`MockNetwork::add_node`] (a peer that is known
/// but never answers) or [`MockNetwork::launch_node`] (a peer running a
/// tunnel service).
#[derive(Default)]
pub struct MockNetwork {
    /// Everything about the network.
    inner: Mutex<NetInner>,
}

/// The mutable part of a [`MockNetwork`].
#[derive(Default)]
struct NetInner {
    /// Nodes by identity.
    nodes: HashMap<PeerId, NodeEnt>,
    /// Order in which nodes were added.
    order: Vec<PeerId>,
    /// Every cell sent so far.
    log: Vec<ObservedCell>,
}

/// The network's view of a node.
struct NodeEnt {
    /// How to reach the node.
    handle: PeerHandle,
    /// What the node advertises, if it has introduced itself.
    flags: Option<PeerFlags>,
    /// Where packets for this node go.  None for a silent node.
    sink: Option<TunnelHandle>,
}

/// A cell that went over the mock network.
#[derive(Clone, Debug)]
pub struct ObservedCell {
    /// The sender.
    pub from: PeerId,
    /// The receiver.
    pub to: PeerId,
    /// The circuit id on that link.
    pub circid: CircId,
    /// The cell kind.
    pub kind: CellKind,
}

/// A node running on a [`MockNetwork`].
pub struct MockNode {
    /// The node's identity.
    pub key: IdentityKey,
    /// How other nodes reach it.
    pub handle: PeerHandle,
    /// Its community.
    pub community: Arc<MockCommunity>,
    /// The tunnel service it runs.
    pub service: TunnelService,
}

impl MockNetwork {
    /// Make a new empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a node with identity `id` and `flags`, and return its handle.
    ///
    /// Nothing runs at the node: packets sent to it are logged and then
    /// dropped, so it never answers a CREATE.
    pub fn add_node(&self, id: PeerId, flags: Option<PeerFlags>) -> PeerHandle {
        let mut inner = self.inner.lock().expect("poisoned");
        let n = inner.order.len() + 1;
        let [_, _, hi, lo] = (n as u32).to_be_bytes();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, hi, lo)), MOCK_PORT);
        let handle = PeerHandle::new(id, addr);
        inner.order.push(id);
        inner.nodes.insert(
            id,
            NodeEnt {
                handle,
                flags,
                sink: None,
            },
        );
        handle
    }

    /// Deliver packets for `id` to `sink` from now on.
    pub fn attach(&self, id: &PeerId, sink: TunnelHandle) {
        let mut inner = self.inner.lock().expect("poisoned");
        if let Some(ent) = inner.nodes.get_mut(id) {
            ent.sink = Some(sink);
        }
    }

    /// Return a community for the node at `me`.
    pub fn community(self: &Arc<Self>, me: PeerHandle) -> Arc<MockCommunity> {
        Arc::new(MockCommunity {
            net: Arc::clone(self),
            me,
            removed: Mutex::new(HashSet::new()),
            introduced: Mutex::new(Vec::new()),
        })
    }

    /// Add a node running a tunnel service with `config`, advertising
    /// `flags`.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn launch_node<R: Rng + CryptoRng>(
        self: &Arc<Self>,
        rng: &mut R,
        config: TunnelConfig,
        flags: PeerFlags,
        directory: Option<Arc<dyn IntroDirectory>>,
    ) -> Result<MockNode> {
        let key = IdentityKey::generate(rng);
        let handle = self.add_node(key.peer_id(), Some(flags));
        let community = self.community(handle);
        let service = TunnelService::launch_with_rng(
            &key,
            config,
            Arc::clone(&community) as Arc<dyn Community>,
            directory,
            rng,
        )?;
        self.attach(handle.id(), service.handle());
        Ok(MockNode {
            key,
            handle,
            community,
            service,
        })
    }

    /// Return every cell sent so far, in order.
    pub fn cells(&self) -> Vec<ObservedCell> {
        self.inner.lock().expect("poisoned").log.clone()
    }

    /// Return the cells of kind `kind` sent from `from` to `to`.
    pub fn cells_between(&self, from: &PeerId, to: &PeerId, kind: CellKind) -> Vec<ObservedCell> {
        self.cells()
            .into_iter()
            .filter(|c| &c.from == from && &c.to == to && c.kind == kind)
            .collect()
    }

    /// Forget the cells logged so far.
    pub fn clear_log(&self) {
        self.inner.lock().expect("poisoned").log.clear();
    }

    /// Return every node other than `me`, with its flags.
    fn peers_of(&self, me: &PeerId) -> Vec<PeerInfo> {
        let inner = self.inner.lock().expect("poisoned");
        inner
            .order
            .iter()
            .filter(|id| *id != me)
            .filter_map(|id| inner.nodes.get(id))
            .map(|ent| PeerInfo::new(ent.handle, ent.flags))
            .collect()
    }

    /// Log `packet` and hand it to `to`, as if it came from `from`.
    fn deliver(&self, from: &PeerHandle, to: &PeerHandle, packet: Vec<u8>) -> Result<()> {
        let sink = {
            let mut inner = self.inner.lock().expect("poisoned");
            let sink = match inner.nodes.get(to.id()) {
                Some(ent) if ent.handle == *to => ent.sink.clone(),
                _ => return Err(Error::Transport(format!("no such peer {}", to))),
            };
            if let Ok(cell) = CellCodec::new().decode(&packet[..]) {
                trace!("{} -> {}: {} on {}", from, to, cell.kind(), cell.circid());
                inner.log.push(ObservedCell {
                    from: *from.id(),
                    to: *to.id(),
                    circid: cell.circid(),
                    kind: cell.kind(),
                });
            }
            sink
        };
        if let Some(sink) = sink {
            sink.on_packet(*from, packet);
        }
        Ok(())
    }
}

/// One node's view of a [`MockNetwork`].
pub struct MockCommunity {
    /// The network.
    net: Arc<MockNetwork>,
    /// The node this community belongs to.
    me: PeerHandle,
    /// Peers this node has dropped.
    removed: Mutex<HashSet<PeerId>>,
    /// Peers this node has asked to introduce themselves.
    introduced: Mutex<Vec<PeerHandle>>,
}

impl MockCommunity {
    /// Return the peers this node has dropped.
    pub fn removed(&self) -> HashSet<PeerId> {
        self.removed.lock().expect("poisoned").clone()
    }

    /// Return the peers this node has asked to introduce themselves, in
    /// order.
    pub fn introduced(&self) -> Vec<PeerHandle> {
        self.introduced.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl Community for MockCommunity {
    fn peers(&self) -> Vec<PeerInfo> {
        let removed = self.removed.lock().expect("poisoned");
        self.net
            .peers_of(self.me.id())
            .into_iter()
            .filter(|p| !removed.contains(p.id()))
            .collect()
    }

    async fn send_to(&self, peer: &PeerHandle, packet: Vec<u8>) -> Result<()> {
        self.net.deliver(&self.me, peer, packet)
    }

    async fn introduce(&self, peer: &PeerHandle) -> Result<()> {
        self.introduced.lock().expect("poisoned").push(*peer);
        Ok(())
    }

    fn remove_peer(&self, peer: &PeerId) {
        self.removed.lock().expect("poisoned").insert(*peer);
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn peers_and_removal() {
        let net = MockNetwork::new();
        let a = net.add_node(PeerId::from([1; 32]), Some(PeerFlags::RELAY));
        let b = net.add_node(PeerId::from([2; 32]), None);
        let c = net.add_node(PeerId::from([3; 32]), Some(PeerFlags::EXIT));
        assert_ne!(a.addr(), b.addr());

        let comm = net.community(a);
        let peers = comm.peers();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].handle, b);
        assert_eq!(peers[0].flags, None);
        assert!(peers[1].is_exit());

        comm.remove_peer(c.id());
        assert_eq!(comm.peers().len(), 1);
        assert!(comm.removed().contains(c.id()));

        comm.introduce(&b).await.unwrap();
        assert_eq!(comm.introduced(), vec![b]);
    }

    #[tokio::test]
    async fn sends_are_logged() {
        use tunnel_cell::cell::Cell;
        let net = MockNetwork::new();
        let a = net.add_node(PeerId::from([1; 32]), Some(PeerFlags::RELAY));
        let b = net.add_node(PeerId::from([2; 32]), Some(PeerFlags::RELAY));
        let comm = net.community(a);

        let frame = CellCodec::new()
            .encode(&Cell::new(CircId::from(7), CellKind::DESTROY, vec![4]))
            .unwrap();
        comm.send_to(&b, frame.clone()).await.unwrap();
        // Junk is delivered but not logged.
        comm.send_to(&b, vec![1, 2, 3]).await.unwrap();

        let log = net.cells_between(a.id(), b.id(), CellKind::DESTROY);
        assert_eq!(log.len(), 1);
        assert_eq!(u32::from(log[0].circid), 7);
        assert_eq!(net.cells().len(), 1);

        let stranger = PeerHandle::new(PeerId::from([9; 32]), a.addr());
        assert!(comm.send_to(&stranger, frame).await.is_err());
    }
}
