//! The reactor: a single task that owns every circuit table on this
//! peer.
//!
//! Everything that touches circuit state goes through here: cells from
//! the community, requests from circuit handles and builders, replies
//! from exits, and the periodic sweep.  Because only this task mutates
//! the tables, cells on one circuit are handled one at a time in the
//! order they arrived.
//!
//! The reactor never waits on the network.  Cells it wants to send are
//! encoded and put on an outbound queue; a separate task drains that
//! queue into [`Community::send_to`], preserving order.

mod hop;
mod origin;
mod rendezvous;

use crate::circuit::{ClientCirc, StreamEvent};
use crate::exit::{BpToken, ExitEnt};
use crate::peer::PeerHistory;
use crate::{Community, Error, Result, TunnelConfig, TunnelStats};

use futures::channel::{mpsc, oneshot};
use futures::select_biased;
use futures::StreamExt;
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, trace, warn};
use tunnel_cell::cell::codec::CellCodec;
use tunnel_cell::cell::{Cell, CellKind, CircId};
use tunnel_cell::datamsg::{StreamId, TargetAddr};
use tunnel_cell::msg::{CellMsg, Cookie, DestroyReason, InfoHash};
use tunnel_llcrypto::pk::{IdentityKey, PeerId};
use tunnel_proto::circmap::{CircMap, LinkKey};
use tunnel_proto::circuit::UniqId;
use tunnel_proto::crypto::cell::HopKeys;
use tunnel_proto::crypto::handshake::ntor::NtorSecretKey;
use tunnel_proto::peer::PeerHandle;
use tunnel_proto::relay::{RelayId, RelayTable, Side};

use origin::OriginEnt;

/// A receiver for the outcome of one circuit hop.
pub(crate) type HopDone = oneshot::Receiver<Result<()>>;

/// A message telling the reactor to do something.
pub(crate) enum CtrlMsg {
    /// Shut down the reactor, destroying every circuit.
    Shutdown,
    /// Run the periodic cleanup.
    Sweep,
    /// Start a circuit by sending CREATE to `first`.
    ///
    /// The reply carries a handle for the new circuit, and a receiver
    /// for the outcome of the first hop.
    Create {
        /// Number of hops the circuit will have.
        hops: u8,
        /// Whether the last hop must be an exit.
        exit: bool,
        /// The first hop.
        first: PeerHandle,
        /// Where to send the handle.
        reply: oneshot::Sender<Result<(ClientCirc, HopDone)>>,
    },
    /// Extend a circuit by one hop.
    Extend {
        /// The circuit.
        circ: UniqId,
        /// The next hop.
        target: PeerHandle,
        /// Told when the hop completes or fails.
        done: oneshot::Sender<Result<()>>,
    },
    /// Close a circuit, sending DESTROY to its first hop.
    Close {
        /// The circuit.
        circ: UniqId,
        /// The reason to give.
        reason: DestroyReason,
    },
    /// Send a message to the last hop of a circuit.
    Send {
        /// The circuit.
        circ: UniqId,
        /// The message.
        msg: CellMsg,
    },
    /// Open a stream on an exit circuit.
    OpenStream {
        /// The circuit.
        circ: UniqId,
        /// Where the exit should connect.
        target: TargetAddr,
        /// Where events for the stream go.
        sink: mpsc::UnboundedSender<StreamEvent>,
        /// Told the new stream's id.
        reply: oneshot::Sender<Result<StreamId>>,
    },
    /// Forget a stream, telling the exit to close it.
    CloseStream {
        /// The circuit.
        circ: UniqId,
        /// The stream.
        stream_id: StreamId,
    },
    /// Deliver datagrams arriving on a circuit to `sink`.
    ListenDatagrams {
        /// The circuit.
        circ: UniqId,
        /// Where they go.
        sink: mpsc::UnboundedSender<(TargetAddr, Vec<u8>)>,
    },
    /// Deliver hidden-swarm messages arriving on a circuit to `sink`.
    ListenEvents {
        /// The circuit.
        circ: UniqId,
        /// Where they go.
        sink: mpsc::UnboundedSender<CellMsg>,
    },
    /// Send a PING to the last hop; `reply` fires on the PONG.
    Ping {
        /// The circuit.
        circ: UniqId,
        /// Told when the PONG arrives.
        reply: oneshot::Sender<()>,
    },
    /// An exit has an encoded data message for its originator.
    ExitData {
        /// The circuit the exit belongs to.
        key: LinkKey,
        /// The encoded data message.
        body: Vec<u8>,
        /// Counts the cell against the exit's queue.
        token: BpToken,
    },
    /// An exit's socket failed.
    ExitFailed {
        /// The circuit the exit belongs to.
        key: LinkKey,
        /// The reason to give.
        reason: DestroyReason,
    },
    /// The community couldn't send to `peer`.
    LinkFailed {
        /// The peer.
        peer: PeerHandle,
    },
    /// Report how many circuits we originated are still open.
    NCircuits {
        /// Told the count.
        reply: oneshot::Sender<Result<usize>>,
    },
}

impl fmt::Debug for CtrlMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use CtrlMsg::*;
        match self {
            Shutdown => write!(f, "Shutdown"),
            Sweep => write!(f, "Sweep"),
            Create { hops, first, .. } => write!(f, "Create({}, {})", hops, first),
            Extend { circ, target, .. } => write!(f, "Extend({}, {})", circ, target),
            Close { circ, reason } => write!(f, "Close({}, {})", circ, reason),
            Send { circ, msg } => write!(f, "Send({}, {})", circ, msg.kind()),
            OpenStream { circ, target, .. } => write!(f, "OpenStream({}, {})", circ, target),
            CloseStream { circ, stream_id } => write!(f, "CloseStream({}, {})", circ, stream_id),
            ListenDatagrams { circ, .. } => write!(f, "ListenDatagrams({})", circ),
            ListenEvents { circ, .. } => write!(f, "ListenEvents({})", circ),
            Ping { circ, .. } => write!(f, "Ping({})", circ),
            ExitData { key, body, .. } => write!(f, "ExitData({:?}, {})", key.1, body.len()),
            ExitFailed { key, reason } => write!(f, "ExitFailed({:?}, {})", key.1, reason),
            LinkFailed { peer } => write!(f, "LinkFailed({})", peer),
            NCircuits { .. } => write!(f, "NCircuits"),
        }
    }
}

/// A handle for sending control messages to the reactor.
#[derive(Clone, Debug)]
pub(crate) struct ReactorHandle {
    /// The reactor's control queue.
    tx: mpsc::UnboundedSender<CtrlMsg>,
}

impl ReactorHandle {
    /// Send `msg` to the reactor.
    ///
    /// This never waits, so it is safe to call from `drop()`.
    pub(crate) fn send(&self, msg: CtrlMsg) -> Result<()> {
        self.tx.unbounded_send(msg).map_err(|_| Error::Shutdown)
    }

    /// Send `msg`, which carries a oneshot sender, and wait for the
    /// answer.
    pub(crate) async fn call<T, F>(&self, make: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> CtrlMsg,
    {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await?
    }

    /// Return a handle that posts to `tx`, with no reactor behind it.
    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<CtrlMsg>) -> Self {
        ReactorHandle { tx }
    }
}

/// A cell waiting to be sent by the outbound task.
#[derive(Debug)]
pub(crate) struct Outgoing {
    /// Where to.
    pub(crate) peer: PeerHandle,
    /// The encoded cell.
    pub(crate) frame: Vec<u8>,
    /// Released once the cell is sent.
    pub(crate) token: Option<BpToken>,
}

/// The reactor's side of the outbound queue.
struct Outbound {
    /// The queue.
    tx: mpsc::UnboundedSender<Outgoing>,
    /// Encoder for cells.
    codec: CellCodec,
}

impl Outbound {
    /// Encode `cell` and queue it for `peer`.
    fn send(&self, peer: &PeerHandle, cell: Cell, token: Option<BpToken>) {
        trace!(
            "sending {} on {:?} to {}",
            cell.kind(),
            cell.circid(),
            peer
        );
        match self.codec.encode(&cell) {
            Ok(frame) => {
                let _ = self.tx.unbounded_send(Outgoing {
                    peer: *peer,
                    frame,
                    token,
                });
            }
            Err(e) => warn!("couldn't encode {} cell: {}", cell.kind(), e),
        }
    }

    /// Queue a DESTROY for `circ` on the link to `peer`.
    fn destroy(&self, peer: &PeerHandle, circ: CircId, reason: DestroyReason) {
        match CellMsg::from(tunnel_cell::msg::Destroy::new(reason)).encode_body() {
            Ok(body) => self.send(peer, Cell::new(circ, CellKind::DESTROY, body), None),
            Err(e) => warn!("couldn't encode DESTROY: {}", e),
        }
    }
}

/// Drain the outbound queue into the community.
pub(crate) async fn run_sender(
    community: Arc<dyn Community>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    reactor: ReactorHandle,
    stats: Arc<TunnelStats>,
) {
    while let Some(out) = rx.next().await {
        match community.send_to(&out.peer, out.frame).await {
            Ok(()) => stats.cell_sent(),
            Err(e) => {
                debug!("send to {} failed: {}", out.peer, e);
                stats.transport_failure();
                let _ = reactor.send(CtrlMsg::LinkFailed { peer: out.peer });
            }
        }
        drop(out.token);
    }
    trace!("outbound queue closed");
}

/// The role of a circuit that ends at this peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TerminalRole {
    /// An ordinary terminal hop, possibly an exit.
    Plain,
    /// An introduction point for a hidden swarm.
    Intro(InfoHash),
    /// A rendezvous point waiting for its cookie to be paired.
    Rendezvous(Cookie),
}

/// A circuit that ends at this peer.
#[derive(Debug)]
struct TerminalEnt {
    /// The peer the circuit came from.
    peer: PeerHandle,
    /// Our keys for this hop.
    keys: HopKeys,
    /// The exit for this circuit, once it has carried data.
    exit: Option<ExitEnt>,
    /// The next hop and circuit we're extending this one onto, if any.
    extending: Option<(PeerHandle, CircId)>,
    /// What the circuit is for.
    role: TerminalRole,
    /// When this circuit last carried a cell.
    last_activity: Instant,
}

/// An entry in the per-link circuit map.
#[derive(Debug)]
enum LinkEnt {
    /// A circuit we originated; this is its first-hop link.
    Origin(UniqId),
    /// One side of a relay entry.
    Relay(RelayId, Side),
    /// A circuit that ends here.
    Terminal(Box<TerminalEnt>),
    /// A circuit we sent CREATE on for somebody else's EXTEND, and that
    /// hasn't answered yet.
    Extending {
        /// The terminal entry that asked for the extension.
        origin: LinkKey,
        /// The peer we sent CREATE to.
        next: PeerHandle,
        /// When we sent the CREATE.
        started: Instant,
    },
}

/// Where a cell on a given link goes.
#[derive(Clone, Copy, Debug)]
enum Route {
    /// To one of our circuits.
    Origin(UniqId),
    /// Through a relay entry.
    Relay(RelayId, Side),
    /// To a circuit that ends here.
    Terminal,
    /// To a pending extension.
    Extending(LinkKey),
}

/// An introduction point we're serving.
#[derive(Debug)]
struct IntroRecord {
    /// The service's circuit.
    key: LinkKey,
    /// When to forget it.
    expires: Instant,
}

/// A rendezvous cookie we're holding.
#[derive(Debug)]
struct CookieRecord {
    /// The client's circuit.
    key: LinkKey,
    /// When to forget it.
    expires: Instant,
}

/// Error type returned by [`Reactor::run_once`].
#[derive(Debug)]
enum ReactorError {
    /// We've been asked to shut down.
    Shutdown,
}

/// The state of the reactor.
pub(crate) struct Reactor {
    /// Our identity.
    me: PeerId,
    /// Our onion key, for answering CREATE.
    onion_keys: Vec<NtorSecretKey>,
    /// Configuration.
    config: Arc<TunnelConfig>,
    /// Control messages.
    control: mpsc::UnboundedReceiver<CtrlMsg>,
    /// Packets from the community.
    input: mpsc::Receiver<(PeerHandle, Vec<u8>)>,
    /// A handle to ourselves, for circuit handles and exits.
    handle: ReactorHandle,
    /// Cells to send.
    outbound: Outbound,
    /// Random numbers for circuit ids, handshakes and nonces.
    rng: StdRng,
    /// Every circuit on every link, by link.
    links: CircMap<LinkEnt>,
    /// Circuits we originated.
    origins: HashMap<UniqId, OriginEnt>,
    /// Next unique id for a circuit we originate.
    next_uid: u64,
    /// Relay entries.
    relays: RelayTable,
    /// Introduction points we're serving.
    intros: HashMap<InfoHash, IntroRecord>,
    /// Rendezvous cookies we're holding.
    cookies: HashMap<Cookie, CookieRecord>,
    /// Cookies that have already been paired, and until when we
    /// remember that.
    spent_cookies: HashMap<Cookie, Instant>,
    /// Our experience with other peers.
    history: Arc<Mutex<PeerHistory>>,
    /// Counters.
    stats: Arc<TunnelStats>,
}

/// The pieces a reactor talks to.
pub(crate) struct ReactorParts {
    /// The reactor, ready to run.
    pub(crate) reactor: Reactor,
    /// A handle for the reactor.
    pub(crate) handle: ReactorHandle,
    /// Where to push packets from the community.
    pub(crate) input: mpsc::Sender<(PeerHandle, Vec<u8>)>,
    /// Cells to hand to the community.
    pub(crate) outbound: mpsc::UnboundedReceiver<Outgoing>,
}

/// How many inbound packets may wait for the reactor before we start
/// dropping them.
const INPUT_QUEUE: usize = 1024;

impl Reactor {
    /// Make a new reactor for the peer with identity `identity`.
    pub(crate) fn new(
        identity: &IdentityKey,
        config: Arc<TunnelConfig>,
        rng: StdRng,
        history: Arc<Mutex<PeerHistory>>,
        stats: Arc<TunnelStats>,
    ) -> ReactorParts {
        let (ctrl_tx, control) = mpsc::unbounded();
        let (input_tx, input) = mpsc::channel(INPUT_QUEUE);
        let (out_tx, out_rx) = mpsc::unbounded();
        let handle = ReactorHandle { tx: ctrl_tx };
        let me = identity.peer_id();
        let reactor = Reactor {
            me,
            onion_keys: vec![NtorSecretKey::from(identity)],
            config,
            control,
            input,
            handle: handle.clone(),
            outbound: Outbound {
                tx: out_tx,
                codec: CellCodec::new(),
            },
            rng,
            links: CircMap::new(me),
            origins: HashMap::new(),
            next_uid: 1,
            relays: RelayTable::new(),
            intros: HashMap::new(),
            cookies: HashMap::new(),
            spent_cookies: HashMap::new(),
            history,
            stats,
        };
        ReactorParts {
            reactor,
            handle,
            input: input_tx,
            outbound: out_rx,
        }
    }

    /// Launch the reactor, and run until the service shuts down.
    pub(crate) async fn run(mut self) {
        info!("{}: tunnel reactor running", self.me);
        loop {
            match self.run_once().await {
                Ok(()) => (),
                Err(ReactorError::Shutdown) => break,
            }
        }
        self.shutdown();
        info!("{}: tunnel reactor stopped", self.me);
    }

    /// Handle one control message or one inbound packet.
    async fn run_once(&mut self) -> std::result::Result<(), ReactorError> {
        select_biased! {
            ctrl = self.control.next() => match ctrl {
                Some(CtrlMsg::Shutdown) | None => Err(ReactorError::Shutdown),
                Some(msg) => {
                    self.handle_control(msg);
                    Ok(())
                }
            },
            pkt = self.input.next() => match pkt {
                Some((peer, packet)) => {
                    self.handle_packet(peer, &packet[..]);
                    Ok(())
                }
                None => Err(ReactorError::Shutdown),
            },
        }
    }

    /// Act on a control message.
    fn handle_control(&mut self, msg: CtrlMsg) {
        trace!("{}: control {:?}", self.me, msg);
        match msg {
            CtrlMsg::Shutdown => (),
            CtrlMsg::Sweep => self.sweep(Instant::now()),
            CtrlMsg::Create {
                hops,
                exit,
                first,
                reply,
            } => {
                let r = self.create_circ(hops, exit, first);
                let _ = reply.send(r);
            }
            CtrlMsg::Extend { circ, target, done } => self.extend_circ(circ, target, done),
            CtrlMsg::Close { circ, reason } => self.close_origin(circ, reason, true),
            CtrlMsg::Send { circ, msg } => {
                if let Err(e) = self.send_on_origin(circ, msg) {
                    debug!("{}: couldn't send: {}", circ, e);
                }
            }
            CtrlMsg::OpenStream {
                circ,
                target,
                sink,
                reply,
            } => {
                let r = self.open_stream(circ, target, sink);
                let _ = reply.send(r);
            }
            CtrlMsg::CloseStream { circ, stream_id } => self.close_stream(circ, stream_id),
            CtrlMsg::ListenDatagrams { circ, sink } => {
                if let Some(ent) = self.origins.get_mut(&circ) {
                    ent.datagrams = Some(sink);
                }
            }
            CtrlMsg::ListenEvents { circ, sink } => {
                if let Some(ent) = self.origins.get_mut(&circ) {
                    ent.events = Some(sink);
                }
            }
            CtrlMsg::Ping { circ, reply } => self.ping(circ, reply),
            CtrlMsg::ExitData { key, body, token } => self.exit_data(key, body, token),
            CtrlMsg::ExitFailed { key, reason } => {
                debug!("{:?}: exit failed", key.1);
                self.destroy_link(key, reason, true);
            }
            CtrlMsg::LinkFailed { peer } => self.link_failed(peer),
            CtrlMsg::NCircuits { reply } => {
                let _ = reply.send(Ok(self.origins.len()));
            }
        }
    }

    /// Decode a packet from the community and route it.
    fn handle_packet(&mut self, peer: PeerHandle, packet: &[u8]) {
        let cell = match self.outbound.codec.decode(packet) {
            Ok(c) => c,
            Err(e) => {
                trace!("{}: malformed cell from {}: {}", self.me, peer, e);
                self.stats.malformed();
                return;
            }
        };
        self.stats.cell_received();
        let (circid, kind, body) = cell.into_parts();
        let key = (*peer.id(), circid);
        match self.route(&key) {
            Some(Route::Origin(uid)) => self.origin_cell(uid, kind, body),
            Some(Route::Relay(rid, side)) => self.relay_cell(rid, side, kind, body),
            Some(Route::Terminal) => self.terminal_cell(key, kind, body),
            Some(Route::Extending(origin)) => self.extending_cell(key, origin, kind, body),
            None => match kind {
                CellKind::CREATE => self.accept_create(peer, circid, body),
                CellKind::CREATED | CellKind::EXTENDED => {
                    trace!("{}: stale {} on {:?}", self.me, kind, circid);
                    self.stats.stale();
                }
                CellKind::DESTROY => {
                    trace!("{}: DESTROY for closed {:?}", self.me, circid);
                }
                _ => {
                    trace!("{}: {} on unknown {:?} from {}", self.me, kind, circid, peer);
                    self.stats.unknown();
                }
            },
        }
    }

    /// Find out where a cell on `key` goes.
    fn route(&self, key: &LinkKey) -> Option<Route> {
        Some(match self.links.get(&key.0, key.1)? {
            LinkEnt::Origin(uid) => Route::Origin(*uid),
            LinkEnt::Relay(rid, side) => Route::Relay(*rid, *side),
            LinkEnt::Terminal(_) => Route::Terminal,
            LinkEnt::Extending { origin, .. } => Route::Extending(*origin),
        })
    }

    /// Tear down whatever lives at `key`.
    ///
    /// If `notify` is true, a DESTROY goes to the peer at `key` as well;
    /// whatever `key` was connected to always gets one.  Calling this
    /// on a key that is already gone does nothing.
    fn destroy_link(&mut self, key: LinkKey, reason: DestroyReason, notify: bool) {
        match self.route(&key) {
            None => (),
            Some(Route::Origin(uid)) => self.close_origin(uid, reason, notify),
            Some(Route::Relay(rid, side)) => self.teardown_relay(rid, side, reason, notify),
            Some(Route::Terminal) => {
                if let Some(LinkEnt::Terminal(term)) = self.links.remove(&key.0, key.1) {
                    if notify {
                        self.outbound.destroy(&term.peer, key.1, reason);
                    }
                    if let Some((next, id)) = term.extending {
                        if self.links.remove(next.id(), id).is_some() {
                            self.outbound.destroy(&next, id, reason);
                        }
                    }
                    self.forget_roles(key, term.role);
                    debug!(
                        "{}: terminal {} from {} closed ({})",
                        self.me, key.1, term.peer, reason
                    );
                }
            }
            Some(Route::Extending(origin)) => {
                if let Some(LinkEnt::Extending { next, .. }) = self.links.remove(&key.0, key.1) {
                    if notify {
                        self.outbound.destroy(&next, key.1, reason);
                    }
                }
                // The hop we were extending to is gone, so is the circuit
                // that wanted it.
                self.destroy_link(origin, DestroyReason::CONNECTFAILED, true);
            }
        }
    }

    /// Remove relay entry `rid`, whose `side` is going away.
    fn teardown_relay(&mut self, rid: RelayId, side: Side, reason: DestroyReason, notify: bool) {
        let relay = match self.relays.remove(rid) {
            Some(r) => r,
            None => return,
        };
        let here = relay.side(side);
        let there = relay.side(side.other());
        self.links.remove(here.peer().id(), here.circ());
        self.links.remove(there.peer().id(), there.circ());
        if notify {
            self.outbound.destroy(here.peer(), here.circ(), reason);
        }
        self.outbound.destroy(there.peer(), there.circ(), reason);
        debug!("{}: {} torn down ({})", self.me, rid, reason);
    }

    /// Forget intro and rendezvous records that point at `key`.
    fn forget_roles(&mut self, key: LinkKey, role: TerminalRole) {
        match role {
            TerminalRole::Plain => (),
            TerminalRole::Intro(ih) => {
                if self.intros.get(&ih).map(|r| r.key) == Some(key) {
                    self.intros.remove(&ih);
                }
            }
            TerminalRole::Rendezvous(cookie) => {
                if self.cookies.get(&cookie).map(|r| r.key) == Some(key) {
                    self.cookies.remove(&cookie);
                }
            }
        }
    }

    /// The community couldn't reach `peer`: everything on that link is
    /// gone.
    fn link_failed(&mut self, peer: PeerHandle) {
        if let Ok(mut h) = self.history.lock() {
            h.note_unreachable(peer.id(), Instant::now());
        }
        let ids = self.links.ids_for_peer(peer.id());
        if !ids.is_empty() {
            debug!("{}: link to {} failed; {} circuits affected", self.me, peer, ids.len());
        }
        for id in ids {
            self.destroy_link((*peer.id(), id), DestroyReason::CONNECTFAILED, false);
        }
    }

    /// Close everything that has been idle too long, and forget
    /// expired records.
    fn sweep(&mut self, now: Instant) {
        let idle = self.config.circuit_idle_timeout;

        let idle_origins: Vec<UniqId> = self
            .origins
            .iter()
            .filter(|(_, e)| e.circ.idle_for(now) >= idle)
            .map(|(uid, _)| *uid)
            .collect();
        for uid in idle_origins {
            debug!("{}: closing idle circuit", uid);
            self.close_origin(uid, DestroyReason::FINISHED, true);
        }

        for rid in self.relays.idle_entries(now, idle) {
            let key = self.relays.get(rid).map(|r| {
                let s = r.side(Side::Origin);
                (*s.peer().id(), s.circ())
            });
            if let Some(key) = key {
                debug!("{}: {} idle", self.me, rid);
                self.destroy_link(key, DestroyReason::TIMEOUT, true);
            }
        }

        let hop_timeout = self.config.hop_build_timeout;
        let mut stale = Vec::new();
        for (key, ent) in self.links.iter() {
            match ent {
                LinkEnt::Terminal(t) if now.saturating_duration_since(t.last_activity) >= idle => {
                    stale.push(*key)
                }
                LinkEnt::Extending { started, .. }
                    if now.saturating_duration_since(*started) >= hop_timeout =>
                {
                    stale.push(*key)
                }
                _ => (),
            }
        }
        for key in stale {
            self.destroy_link(key, DestroyReason::TIMEOUT, true);
        }

        self.intros.retain(|_, r| r.expires > now);
        self.cookies.retain(|_, r| r.expires > now);
        self.spent_cookies.retain(|_, until| *until > now);
        if let Ok(mut h) = self.history.lock() {
            h.expire(now);
        }
    }

    /// Destroy every circuit, in preparation for exiting.
    fn shutdown(&mut self) {
        let uids: Vec<UniqId> = self.origins.keys().copied().collect();
        for uid in uids {
            self.close_origin(uid, DestroyReason::FINISHED, true);
        }
        let keys: Vec<LinkKey> = self.links.iter().map(|(k, _)| *k).collect();
        for key in keys {
            self.destroy_link(key, DestroyReason::FINISHED, true);
        }
    }
}

/// Seal `msg` for the originator of a circuit that ends here.
fn seal_inbound(rng: &mut StdRng, keys: &HopKeys, msg: CellMsg) -> Result<(CellKind, Vec<u8>)> {
    let kind = msg.kind();
    let body = msg.encode_body()?;
    Ok((kind, keys.encrypt_inbound(rng, &body[..])?))
}

/// Return a [`Cell`] carrying a sealed message.
fn sealed_cell(circ: CircId, sealed: (CellKind, Vec<u8>)) -> Cell {
    Cell::new(circ, sealed.0, sealed.1)
}

#[cfg(test)]
mod test;
