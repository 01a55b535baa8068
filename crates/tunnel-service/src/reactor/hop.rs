//! Circuits that other peers build through this one: accepting CREATE,
//! extending on EXTEND, relaying, and acting as an exit.

use super::{seal_inbound, sealed_cell, LinkEnt, Reactor, TerminalEnt, TerminalRole};
use crate::exit::{BpToken, ExitEnt};
use crate::{Error, Result};

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};
use tunnel_cell::cell::{Cell, CellKind, CircId};
use tunnel_cell::datamsg::DataMsg;
use tunnel_cell::msg::{CellMsg, Create, Created, DestroyReason, Extend, Extended, Pong};
use tunnel_proto::circmap::LinkKey;
use tunnel_proto::crypto::cell::HopKeys;
use tunnel_proto::crypto::handshake::ntor::NtorServer;
use tunnel_proto::crypto::handshake::ServerHandshake;
use tunnel_proto::peer::PeerHandle;
use tunnel_proto::relay::{RelayEntry, RelayId, Side};

/// Return the reason in a DESTROY body, or NONE if it won't parse.
pub(super) fn destroy_reason(body: &[u8]) -> DestroyReason {
    match CellMsg::decode_body(CellKind::DESTROY, body) {
        Ok(CellMsg::Destroy(d)) => d.reason(),
        _ => DestroyReason::NONE,
    }
}

impl Reactor {
    /// Handle a CREATE from `peer` on a circuit ID we haven't seen.
    pub(super) fn accept_create(&mut self, peer: PeerHandle, circ: CircId, body: Vec<u8>) {
        let create = match CellMsg::decode_body(CellKind::CREATE, &body[..]) {
            Ok(CellMsg::Create(c)) => c,
            _ => {
                debug!("{}: malformed CREATE from {}", self.me, peer);
                self.stats.malformed();
                return;
            }
        };
        let (keys, reply) = match server_handshake(self, &create) {
            Ok(r) => r,
            Err(e) => {
                debug!("{}: handshake from {} failed: {}", self.me, peer, e);
                if e.is_crypto() {
                    self.stats.crypto_failure();
                }
                self.outbound.destroy(&peer, circ, DestroyReason::PROTOCOL);
                return;
            }
        };
        let term = TerminalEnt {
            peer,
            keys,
            exit: None,
            extending: None,
            role: TerminalRole::Plain,
            last_activity: Instant::now(),
        };
        if let Err(e) = self
            .links
            .add_remote_ent(peer.id(), circ, LinkEnt::Terminal(Box::new(term)))
        {
            debug!("{}: refusing CREATE on {} from {}: {}", self.me, circ, peer, e);
            self.stats.unknown();
            return;
        }
        match CellMsg::from(Created::new(reply)).encode_body() {
            Ok(b) => {
                trace!("{}: accepted circuit {} from {}", self.me, circ, peer);
                self.outbound
                    .send(&peer, Cell::new(circ, CellKind::CREATED, b), None);
            }
            Err(e) => {
                debug!("{}: can't encode CREATED: {}", self.me, e);
                self.destroy_link((*peer.id(), circ), DestroyReason::INTERNAL, true);
            }
        }
    }

    /// Handle a cell on one side of relay entry `rid`.
    pub(super) fn relay_cell(
        &mut self,
        rid: RelayId,
        side: Side,
        kind: CellKind,
        body: Vec<u8>,
    ) {
        if kind == CellKind::DESTROY {
            self.teardown_relay(rid, side, destroy_reason(&body[..]), false);
            return;
        }
        if kind.is_link_level() {
            trace!("{}: {} on relayed circuit; dropping", rid, kind);
            self.stats.unknown();
            return;
        }
        let relay = match self.relays.get_mut(rid) {
            Some(r) => r,
            None => return,
        };
        match relay.relay(&mut self.rng, side, &body[..], Instant::now()) {
            Ok((peer, circ, out)) => {
                self.outbound.send(&peer, Cell::new(circ, kind, out), None);
                self.stats.relayed();
            }
            Err(e) => {
                let e = Error::from(e);
                debug!("{}: can't relay {}: {}", rid, kind, e);
                if e.is_crypto() {
                    self.stats.crypto_failure();
                }
                self.teardown_relay(rid, side, DestroyReason::PROTOCOL, true);
            }
        }
    }

    /// Handle a cell on a circuit that ends here.
    pub(super) fn terminal_cell(&mut self, key: LinkKey, kind: CellKind, body: Vec<u8>) {
        if kind == CellKind::DESTROY {
            self.destroy_link(key, destroy_reason(&body[..]), false);
            return;
        }
        if kind.is_link_level() {
            trace!("{}: {} on open circuit {}; dropping", self.me, kind, key.1);
            self.stats.unknown();
            return;
        }
        let clear = match self.links.get_mut(&key.0, key.1) {
            Some(LinkEnt::Terminal(t)) => {
                t.last_activity = Instant::now();
                t.keys.decrypt_outbound(&body[..])
            }
            _ => return,
        };
        let clear = match clear {
            Ok(c) => c,
            Err(e) => {
                debug!("{}: {} on {} didn't decrypt: {}", self.me, kind, key.1, e);
                self.stats.crypto_failure();
                self.destroy_link(key, DestroyReason::PROTOCOL, true);
                return;
            }
        };
        let msg = match CellMsg::decode_body(kind, &clear[..]) {
            Ok(m) => m,
            Err(e) => {
                debug!("{}: bad {} on {}: {}", self.me, kind, key.1, e);
                self.stats.malformed();
                self.destroy_link(key, DestroyReason::PROTOCOL, true);
                return;
            }
        };
        let r = match msg {
            CellMsg::Extend(e) => self.handle_extend(key, e),
            CellMsg::Data(d) => self.exit_msg(key, d),
            CellMsg::Ping(p) => self.reply_on_terminal(key, Pong::new(p.identifier()).into(), None),
            CellMsg::EstablishIntro(m) => self.establish_intro(key, m),
            CellMsg::Intro(m) => self.forward_intro(key, m),
            CellMsg::Rendezvous1(m) => self.register_cookie(key, m),
            CellMsg::Rendezvous2(m) => self.splice(key, m),
            other => Err(Error::Protocol(format!(
                "{} isn't allowed at a terminal hop",
                other.kind()
            ))),
        };
        if let Err(e) = r {
            debug!("{}: closing circuit {}: {}", self.me, key.1, e);
            let reason = match e {
                Error::Policy(_) => {
                    self.stats.policy();
                    DestroyReason::POLICY
                }
                Error::Internal(_) => DestroyReason::INTERNAL,
                _ => DestroyReason::PROTOCOL,
            };
            self.destroy_link(key, reason, true);
        }
    }

    /// Seal `msg` with the keys of the terminal at `key` and send it back
    /// toward that circuit's originator.
    pub(super) fn reply_on_terminal(
        &mut self,
        key: LinkKey,
        msg: CellMsg,
        token: Option<BpToken>,
    ) -> Result<()> {
        let (peer, sealed) = match self.links.get(&key.0, key.1) {
            Some(LinkEnt::Terminal(t)) => (t.peer, seal_inbound(&mut self.rng, &t.keys, msg)?),
            _ => return Err(Error::Internal("no terminal circuit to reply on".into())),
        };
        self.outbound.send(&peer, sealed_cell(key.1, sealed), token);
        Ok(())
    }

    /// Extend the terminal circuit at `key` to the peer named in `ext`.
    fn handle_extend(&mut self, key: LinkKey, ext: Extend) -> Result<()> {
        let next = PeerHandle::new(*ext.next(), ext.addr());
        if next.id() == &self.me || next.id() == &key.0 {
            return Err(Error::Protocol(format!("can't extend to {}", next)));
        }
        match self.links.get(&key.0, key.1) {
            Some(LinkEnt::Terminal(t)) if t.extending.is_none() && t.role == TerminalRole::Plain => {
            }
            _ => return Err(Error::Protocol("circuit can't be extended".into())),
        }
        let body = CellMsg::from(Create::new(ext.handshake().to_vec())).encode_body()?;
        let id = self.links.add_ent(
            &mut self.rng,
            next.id(),
            LinkEnt::Extending {
                origin: key,
                next,
                started: Instant::now(),
            },
        )?;
        if let Some(LinkEnt::Terminal(t)) = self.links.get_mut(&key.0, key.1) {
            t.extending = Some((next, id));
        }
        debug!("{}: extending {} to {} on {}", self.me, key.1, next, id);
        self.outbound
            .send(&next, Cell::new(id, CellKind::CREATE, body), None);
        Ok(())
    }

    /// Handle a cell from the peer we're extending a circuit to.
    pub(super) fn extending_cell(
        &mut self,
        key: LinkKey,
        origin: LinkKey,
        kind: CellKind,
        body: Vec<u8>,
    ) {
        match kind {
            CellKind::CREATED => {
                if let Err(e) = self.finish_extend(key, origin, &body[..]) {
                    debug!("{}: extension of {} failed: {}", self.me, origin.1, e);
                    self.destroy_link(key, DestroyReason::PROTOCOL, true);
                }
            }
            CellKind::DESTROY => {
                debug!(
                    "{}: next hop refused {} ({})",
                    self.me,
                    origin.1,
                    destroy_reason(&body[..])
                );
                self.destroy_link(key, DestroyReason::CONNECTFAILED, false);
            }
            _ => {
                trace!("{}: {} before CREATED on {}", self.me, kind, key.1);
                self.stats.unknown();
            }
        }
    }

    /// Turn a pending extension into a relay entry, now that the next
    /// hop has answered.
    fn finish_extend(&mut self, key: LinkKey, origin: LinkKey, body: &[u8]) -> Result<()> {
        let hs = match CellMsg::decode_body(CellKind::CREATED, body)? {
            CellMsg::Created(c) => c.into_handshake(),
            _ => return Err(Error::Protocol("not a CREATED".into())),
        };
        let next = match self.links.get(&key.0, key.1) {
            Some(LinkEnt::Extending { next, .. }) => *next,
            _ => return Err(Error::Internal("extension vanished".into())),
        };
        let term = match self.links.remove(&origin.0, origin.1) {
            Some(LinkEnt::Terminal(t)) => t,
            Some(other) => {
                self.links.replace(&origin.0, origin.1, other);
                return Err(Error::Internal("extending a circuit that isn't ours".into()));
            }
            None => return Err(Error::Transport("circuit closed while extending".into())),
        };
        let TerminalEnt { peer, keys, .. } = *term;
        let sealed = seal_inbound(&mut self.rng, &keys, Extended::new(hs).into())?;
        let rid = self.relays.insert(RelayEntry::new_forward(
            (peer, origin.1),
            keys,
            (next, key.1),
            Instant::now(),
        ));
        self.links
            .replace(&origin.0, origin.1, LinkEnt::Relay(rid, Side::Origin));
        self.links.replace(&key.0, key.1, LinkEnt::Relay(rid, Side::Away));
        debug!(
            "{}: {} relays {} from {} to {} on {}",
            self.me, rid, origin.1, peer, next, key.1
        );
        self.outbound.send(&peer, sealed_cell(origin.1, sealed), None);
        Ok(())
    }

    /// Hand a data message to the exit for the terminal circuit at `key`.
    fn exit_msg(&mut self, key: LinkKey, msg: DataMsg) -> Result<()> {
        let exit_enabled = self.config.exit_enabled();
        let term = match self.links.get_mut(&key.0, key.1) {
            Some(LinkEnt::Terminal(t)) => t,
            _ => return Err(Error::Internal("no terminal circuit".into())),
        };
        if !exit_enabled {
            return Err(Error::Policy("this peer is not an exit".into()));
        }
        if term.role != TerminalRole::Plain {
            return Err(Error::Policy("no exit traffic on hidden-swarm circuits".into()));
        }
        let handle = &self.handle;
        let stats = &self.stats;
        let exit = term
            .exit
            .get_or_insert_with(|| ExitEnt::launch(key, handle.clone(), Arc::clone(stats)));
        if exit.deliver(msg) {
            Ok(())
        } else {
            Err(Error::Internal("exit went away".into()))
        }
    }

    /// Send an encoded data message from an exit back toward its
    /// originator.
    pub(super) fn exit_data(&mut self, key: LinkKey, body: Vec<u8>, token: BpToken) {
        let (peer, sealed) = match self.links.get_mut(&key.0, key.1) {
            Some(LinkEnt::Terminal(t)) => {
                t.last_activity = Instant::now();
                (t.peer, t.keys.encrypt_inbound(&mut self.rng, &body[..]))
            }
            _ => {
                trace!("{}: exit data for closed circuit {}", self.me, key.1);
                return;
            }
        };
        match sealed {
            Ok(b) => self
                .outbound
                .send(&peer, Cell::new(key.1, CellKind::DATA, b), Some(token)),
            Err(e) => debug!("{}: can't seal exit data: {}", self.me, e),
        }
    }
}

/// Run the server side of a CREATE handshake with our onion key.
fn server_handshake(r: &mut Reactor, create: &Create) -> Result<(HopKeys, Vec<u8>)> {
    let (keygen, reply) = NtorServer::server(&mut r.rng, &r.onion_keys[..], create.handshake())?;
    Ok((HopKeys::construct(keygen)?, reply))
}
