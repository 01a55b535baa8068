//! Circuits this peer originates: building them, sending on them, and
//! handling what comes back.

use super::{HopDone, LinkEnt, Reactor};
use crate::circuit::{ClientCirc, StreamEvent};
use crate::{Error, Result};

use futures::channel::{mpsc, oneshot};
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};
use tunnel_cell::cell::{Cell, CellKind};
use tunnel_cell::datamsg::{DataMsg, EndReason, StreamId, TargetAddr};
use tunnel_cell::msg::{CellMsg, Create, DestroyReason, Extend, Ping};
use tunnel_proto::circuit::{OriginCirc, UniqId};
use tunnel_proto::crypto::cell::HopKeys;
use tunnel_proto::crypto::handshake::ntor::{
    NtorClient, NtorHandshakeState, NtorPublicKey,
};
use tunnel_proto::crypto::handshake::ClientHandshake;
use tunnel_proto::peer::PeerHandle;
use tunnel_proto::MAX_HOPS;

/// A handshake we're waiting on.
struct PendingHop {
    /// Our half of the handshake.
    state: NtorHandshakeState,
    /// The peer we sent it to.
    peer: PeerHandle,
    /// Told when the hop is done.
    done: oneshot::Sender<Result<()>>,
}

/// The reactor's record of a circuit we originated.
pub(super) struct OriginEnt {
    /// Crypto and bookkeeping.
    pub(super) circ: OriginCirc,
    /// Shared with the circuit's handles.
    closed: Arc<AtomicBool>,
    /// The handshake in progress, if any.
    pending: Option<PendingHop>,
    /// Open streams.
    streams: HashMap<StreamId, mpsc::UnboundedSender<StreamEvent>>,
    /// Next stream id to try.
    next_stream: u16,
    /// Where datagrams go.
    pub(super) datagrams: Option<mpsc::UnboundedSender<(TargetAddr, Vec<u8>)>>,
    /// Where hidden-swarm messages go.
    pub(super) events: Option<mpsc::UnboundedSender<CellMsg>>,
    /// PINGs waiting for a PONG, by identifier.
    pings: HashMap<u16, oneshot::Sender<()>>,
    /// Next PING identifier.
    next_ping: u16,
}

impl Reactor {
    /// Start a new circuit whose first hop is `first`.
    pub(super) fn create_circ(
        &mut self,
        hops: u8,
        exit: bool,
        first: PeerHandle,
    ) -> Result<(ClientCirc, HopDone)> {
        if hops == 0 || usize::from(hops) > MAX_HOPS {
            return Err(Error::Internal(format!("can't build a {}-hop circuit", hops)));
        }
        if first.id() == &self.me {
            return Err(Error::Internal("tried to build a circuit through ourself".into()));
        }
        let uid = UniqId::new(self.next_uid);
        self.next_uid += 1;

        let (state, hs) = NtorClient::client1(&mut self.rng, &NtorPublicKey::from(*first.id()))?;
        let body = CellMsg::from(Create::new(hs)).encode_body()?;
        let id = self
            .links
            .add_ent(&mut self.rng, first.id(), LinkEnt::Origin(uid))?;

        let mut circ = OriginCirc::new(uid, id, hops, exit, Instant::now());
        if let Err(e) = circ.begin_extend(first) {
            self.links.remove(first.id(), id);
            return Err(e.into());
        }
        let (done_tx, done_rx) = oneshot::channel();
        let closed = Arc::new(AtomicBool::new(false));
        self.origins.insert(
            uid,
            OriginEnt {
                circ,
                closed: Arc::clone(&closed),
                pending: Some(PendingHop {
                    state,
                    peer: first,
                    done: done_tx,
                }),
                streams: HashMap::new(),
                next_stream: 1,
                datagrams: None,
                events: None,
                pings: HashMap::new(),
                next_ping: 1,
            },
        );
        debug!("{}: sending CREATE to {} on {}", uid, first, id);
        self.outbound
            .send(&first, Cell::new(id, CellKind::CREATE, body), None);

        let handle = ClientCirc::new(uid, hops, exit, self.handle.clone(), closed);
        Ok((handle, done_rx))
    }

    /// Extend circuit `uid` to `target`.  `done` hears how it went.
    pub(super) fn extend_circ(
        &mut self,
        uid: UniqId,
        target: PeerHandle,
        done: oneshot::Sender<Result<()>>,
    ) {
        if let Err(e) = self.try_extend(uid, target, done) {
            debug!("{}: can't extend to {}: {}", uid, target, e);
        }
    }

    /// Helper for extend_circ: on error, `done` has already been told.
    fn try_extend(
        &mut self,
        uid: UniqId,
        target: PeerHandle,
        done: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        let ent = match self.origins.get_mut(&uid) {
            Some(e) => e,
            None => {
                let _ = done.send(Err(Error::Transport("circuit is closed".into())));
                return Err(Error::Transport("circuit is closed".into()));
            }
        };
        let (state, body, first) = match prepare_extend(&mut ent.circ, &mut self.rng, &target) {
            Ok(p) => p,
            Err(e) => {
                let _ = done.send(Err(e.clone()));
                return Err(e);
            }
        };
        ent.pending = Some(PendingHop {
            state,
            peer: target,
            done,
        });
        trace!("{}: sending EXTEND to {} via {}", uid, target, first);
        self.outbound.send(
            &first,
            Cell::new(ent.circ.id(), CellKind::EXTEND, body),
            None,
        );
        Ok(())
    }

    /// Handle a cell that arrived on the first-hop link of `uid`.
    pub(super) fn origin_cell(&mut self, uid: UniqId, kind: CellKind, body: Vec<u8>) {
        match kind {
            CellKind::CREATED | CellKind::EXTENDED => self.hop_reply(uid, kind, &body[..]),
            CellKind::DESTROY => {
                let reason = match CellMsg::decode_body(kind, &body[..]) {
                    Ok(CellMsg::Destroy(d)) => d.reason(),
                    _ => DestroyReason::NONE,
                };
                debug!("{}: destroyed by the network ({})", uid, reason);
                self.close_origin(uid, reason, false);
            }
            CellKind::CREATE => {
                trace!("{}: CREATE on our own circuit; dropping", uid);
                self.stats.unknown();
            }
            _ => self.origin_msg(uid, kind, &body[..]),
        }
    }

    /// Handle a CREATED or EXTENDED reply.
    fn hop_reply(&mut self, uid: UniqId, kind: CellKind, body: &[u8]) {
        let now = Instant::now();
        let ent = match self.origins.get_mut(&uid) {
            Some(e) => e,
            None => return,
        };
        let pending = match ent.pending.take() {
            Some(p) => p,
            None => {
                trace!("{}: {} with no handshake outstanding", uid, kind);
                self.stats.stale();
                return;
            }
        };
        let PendingHop { state, peer, done } = pending;
        let outcome = finish_hop(&mut ent.circ, kind, body, state, now);
        match outcome {
            Ok(ready) => {
                if let Ok(mut h) = self.history.lock() {
                    h.note_success(peer.id(), now);
                }
                if ready {
                    info!("{}: circuit ready ({} hops)", uid, ent.circ.target_hops());
                    self.stats.circuit_built();
                } else {
                    trace!("{}: hop {} done", uid, peer);
                }
                let _ = done.send(Ok(()));
            }
            Err(e) => {
                debug!("{}: hop to {} failed: {}", uid, peer, e);
                if e.is_crypto() {
                    self.stats.crypto_failure();
                    if let Ok(mut h) = self.history.lock() {
                        h.note_crypto_failure(peer.id(), now);
                    }
                }
                let _ = done.send(Err(e));
                self.close_origin(uid, DestroyReason::PROTOCOL, true);
            }
        }
    }

    /// Handle an onion-encrypted cell from the last hop of `uid`.
    fn origin_msg(&mut self, uid: UniqId, kind: CellKind, body: &[u8]) {
        let now = Instant::now();
        let ent = match self.origins.get_mut(&uid) {
            Some(e) => e,
            None => return,
        };
        let clear = match ent.circ.decrypt(body) {
            Ok(c) => c,
            Err(e) => {
                debug!("{}: {} didn't decrypt: {}", uid, kind, e);
                self.stats.crypto_failure();
                self.close_origin(uid, DestroyReason::PROTOCOL, true);
                return;
            }
        };
        let msg = match CellMsg::decode_body(kind, &clear[..]) {
            Ok(m) => m,
            Err(e) => {
                debug!("{}: bad {} body: {}", uid, kind, e);
                self.stats.malformed();
                return;
            }
        };
        ent.circ.record_received(clear.len(), now);
        match msg {
            CellMsg::Data(d) => ent.deliver_data(uid, d),
            CellMsg::Pong(p) => {
                if let Some(waiter) = ent.pings.remove(&p.identifier()) {
                    let _ = waiter.send(());
                }
            }
            m @ CellMsg::IntroEstablished
            | m @ CellMsg::RendezvousEstablished
            | m @ CellMsg::Intro(_)
            | m @ CellMsg::Rendezvous2(_)
            | m @ CellMsg::DataHidden(_) => match &ent.events {
                Some(sink) => {
                    let _ = sink.unbounded_send(m);
                }
                None => {
                    trace!("{}: nobody listening for {}", uid, kind);
                    self.stats.unknown();
                }
            },
            other => {
                debug!("{}: unexpected {} from last hop", uid, other.kind());
                self.stats.unknown();
            }
        }
    }

    /// Close circuit `uid`.
    ///
    /// A `reason` other than FINISHED marks the circuit broken.  If
    /// `notify` is set, the first hop is sent a DESTROY.  Closing a
    /// circuit twice does nothing.
    pub(super) fn close_origin(&mut self, uid: UniqId, reason: DestroyReason, notify: bool) {
        let mut ent = match self.origins.remove(&uid) {
            Some(e) => e,
            None => return,
        };
        if let Some(key) = ent.circ.link_key() {
            self.links.remove(&key.0, key.1);
        }
        if reason == DestroyReason::FINISHED {
            ent.circ.start_close();
            ent.circ.mark_closed();
        } else {
            ent.circ.mark_broken();
        }
        ent.closed.store(true, Ordering::SeqCst);
        if notify {
            if let Some(first) = ent.circ.first_hop() {
                self.outbound.destroy(first, ent.circ.id(), reason);
            }
        }
        if let Some(p) = ent.pending.take() {
            let err = if reason == DestroyReason::TIMEOUT {
                Error::Timeout
            } else {
                Error::Transport(format!("circuit closed ({})", reason))
            };
            let _ = p.done.send(Err(err));
        }
        for (_, s) in ent.streams.drain() {
            let _ = s.unbounded_send(StreamEvent::End(EndReason::DESTROY));
        }
        let (up, down) = ent.circ.byte_counts();
        debug!(
            "{}: closed ({}, {}), {} bytes up, {} bytes down",
            uid,
            ent.circ.state(),
            reason,
            up,
            down
        );
    }

    /// Seal `msg` for the last hop of `uid` and send it.
    pub(super) fn send_on_origin(&mut self, uid: UniqId, msg: CellMsg) -> Result<()> {
        let ent = self
            .origins
            .get_mut(&uid)
            .ok_or_else(|| Error::Transport("circuit is closed".into()))?;
        if !ent.circ.is_ready() {
            return Err(Error::Protocol(format!(
                "circuit is {}, not ready",
                ent.circ.state()
            )));
        }
        let kind = msg.kind();
        let clear = msg.encode_body()?;
        if clear.len() > ent.circ.max_payload() {
            return Err(Error::Protocol(format!(
                "{}-byte message won't fit a cell",
                clear.len()
            )));
        }
        let body = ent.circ.encrypt(&mut self.rng, &clear[..])?;
        ent.circ.record_sent(clear.len(), Instant::now());
        let first = *ent
            .circ
            .first_hop()
            .ok_or_else(|| Error::Internal("ready circuit without a first hop".into()))?;
        self.outbound
            .send(&first, Cell::new(ent.circ.id(), kind, body), None);
        Ok(())
    }

    /// Open a stream to `target` on the exit of `uid`.
    pub(super) fn open_stream(
        &mut self,
        uid: UniqId,
        target: TargetAddr,
        sink: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<StreamId> {
        let ent = self
            .origins
            .get_mut(&uid)
            .ok_or_else(|| Error::Transport("circuit is closed".into()))?;
        if ent.streams.len() >= usize::from(u16::MAX) - 1 {
            return Err(Error::Protocol("too many streams on circuit".into()));
        }
        let mut n = ent.next_stream;
        while n == 0 || ent.streams.contains_key(&StreamId::from(n)) {
            n = n.wrapping_add(1);
        }
        ent.next_stream = n.wrapping_add(1);
        let stream_id = StreamId::from(n);
        ent.streams.insert(stream_id, sink);
        let begin = DataMsg::Begin { stream_id, target };
        if let Err(e) = self.send_on_origin(uid, CellMsg::Data(begin)) {
            if let Some(ent) = self.origins.get_mut(&uid) {
                ent.streams.remove(&stream_id);
            }
            return Err(e);
        }
        Ok(stream_id)
    }

    /// Forget a stream, and tell the exit if it's still open.
    pub(super) fn close_stream(&mut self, uid: UniqId, stream_id: StreamId) {
        let open = self
            .origins
            .get_mut(&uid)
            .map(|e| e.streams.remove(&stream_id).is_some())
            .unwrap_or(false);
        if open {
            let end = DataMsg::End {
                stream_id,
                reason: EndReason::DONE,
            };
            let _ = self.send_on_origin(uid, CellMsg::Data(end));
        }
    }

    /// Send a PING on `uid`.
    pub(super) fn ping(&mut self, uid: UniqId, reply: oneshot::Sender<()>) {
        let id = match self.origins.get_mut(&uid) {
            Some(ent) => {
                let id = ent.next_ping;
                ent.next_ping = ent.next_ping.wrapping_add(1);
                ent.pings.insert(id, reply);
                id
            }
            None => return,
        };
        if let Err(e) = self.send_on_origin(uid, CellMsg::from(Ping::new(id))) {
            debug!("{}: can't ping: {}", uid, e);
            if let Some(ent) = self.origins.get_mut(&uid) {
                ent.pings.remove(&id);
            }
        }
    }
}

impl OriginEnt {
    /// Hand a data message from the exit to whoever is listening.
    fn deliver_data(&mut self, uid: UniqId, msg: DataMsg) {
        match msg {
            DataMsg::Datagram { target, payload } => match &self.datagrams {
                Some(sink) => {
                    let _ = sink.unbounded_send((target, payload));
                }
                None => trace!("{}: datagram with nobody listening", uid),
            },
            DataMsg::Connected { stream_id } => {
                if let Some(s) = self.streams.get(&stream_id) {
                    let _ = s.unbounded_send(StreamEvent::Connected);
                }
            }
            DataMsg::StreamData { stream_id, data } => {
                if let Some(s) = self.streams.get(&stream_id) {
                    let _ = s.unbounded_send(StreamEvent::Data(data));
                }
            }
            DataMsg::End { stream_id, reason } => {
                if let Some(s) = self.streams.remove(&stream_id) {
                    let _ = s.unbounded_send(StreamEvent::End(reason));
                }
            }
            other => debug!("{}: unexpected {} from exit", uid, other.cmd()),
        }
    }
}

/// Start extending `circ` to `target`.  Return our half of the
/// handshake, the sealed EXTEND body, and the first hop to send it to.
fn prepare_extend(
    circ: &mut OriginCirc,
    rng: &mut StdRng,
    target: &PeerHandle,
) -> Result<(NtorHandshakeState, Vec<u8>, PeerHandle)> {
    let first = *circ
        .first_hop()
        .ok_or_else(|| Error::Internal("circuit has no first hop".into()))?;
    circ.begin_extend(*target)?;
    let (state, hs) = NtorClient::client1(rng, &NtorPublicKey::from(*target.id()))?;
    let msg = CellMsg::from(Extend::new(*target.id(), target.addr(), hs));
    let body = circ.encrypt(rng, &msg.encode_body()?[..])?;
    Ok((state, body, first))
}

/// Finish the handshake on `circ` with a CREATED or EXTENDED body.
///
/// Returns true if the circuit is now ready.
fn finish_hop(
    circ: &mut OriginCirc,
    kind: CellKind,
    body: &[u8],
    state: NtorHandshakeState,
    now: Instant,
) -> Result<bool> {
    let clear;
    let body = if kind == CellKind::EXTENDED {
        clear = circ.decrypt(body)?;
        &clear[..]
    } else {
        body
    };
    let hs = match CellMsg::decode_body(kind, body)? {
        CellMsg::Created(c) => c.into_handshake(),
        CellMsg::Extended(e) => e.into_handshake(),
        _ => return Err(Error::Protocol("unexpected reply".into())),
    };
    let keys = HopKeys::construct(NtorClient::client2(state, hs)?)?;
    Ok(circ.complete_hop(keys, now)?)
}
