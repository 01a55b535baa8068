//! Introduction and rendezvous points.
//!
//! An introduction point remembers which circuit serves an infohash,
//! and passes INTRO requests along it.  A rendezvous point holds a
//! client's circuit under a cookie until a service's circuit arrives
//! with the same cookie, then splices the two.  A cookie splices at
//! most once.

use super::{
    seal_inbound, sealed_cell, CookieRecord, IntroRecord, LinkEnt, Reactor, TerminalEnt, TerminalRole,
};
use crate::{Error, Result};

use std::time::Instant;
use tracing::{debug, trace};
use tunnel_cell::msg::{CellMsg, EstablishIntro, Intro, Rendezvous1, Rendezvous2};
use tunnel_proto::circmap::LinkKey;
use tunnel_proto::relay::{RelayEntry, Side};

impl Reactor {
    /// Give the terminal circuit at `key` a new role, if it has none yet
    /// (or already has this one).
    fn set_role(&mut self, key: LinkKey, role: TerminalRole) -> Result<()> {
        match self.links.get_mut(&key.0, key.1) {
            Some(LinkEnt::Terminal(t)) if t.role == TerminalRole::Plain || t.role == role => {
                if t.exit.is_some() || t.extending.is_some() {
                    return Err(Error::Protocol("circuit is already in use".into()));
                }
                t.role = role;
                Ok(())
            }
            Some(LinkEnt::Terminal(_)) => {
                Err(Error::Protocol("circuit already has another role".into()))
            }
            _ => Err(Error::Internal("no terminal circuit".into())),
        }
    }

    /// Become an introduction point on the circuit at `key`.
    pub(super) fn establish_intro(&mut self, key: LinkKey, msg: EstablishIntro) -> Result<()> {
        let ih = *msg.infohash();
        self.set_role(key, TerminalRole::Intro(ih))?;
        let expires = Instant::now() + self.config.intro_lifetime;
        if let Some(old) = self.intros.insert(ih, IntroRecord { key, expires }) {
            if old.key != key {
                trace!("{}: intro for {} moved to {}", self.me, ih, key.1);
            }
        }
        debug!("{}: introduction point for {} on {}", self.me, ih, key.1);
        self.reply_on_terminal(key, CellMsg::IntroEstablished, None)
    }

    /// Pass a client's INTRO to the service circuit for its infohash.
    pub(super) fn forward_intro(&mut self, key: LinkKey, msg: Intro) -> Result<()> {
        let now = Instant::now();
        let ih = *msg.infohash();
        let svc = match self.intros.get(&ih) {
            Some(rec) if rec.expires > now && rec.key != key => rec.key,
            _ => return Err(Error::Protocol(format!("not an introduction point for {}", ih))),
        };
        trace!("{}: passing INTRO for {} to {}", self.me, ih, svc.1);
        if let Err(e) = self.reply_on_terminal(svc, CellMsg::Intro(msg), None) {
            self.intros.remove(&ih);
            return Err(Error::Protocol(format!("service for {} is gone: {}", ih, e)));
        }
        Ok(())
    }

    /// Hold the circuit at `key` under a client's cookie.
    pub(super) fn register_cookie(&mut self, key: LinkKey, msg: Rendezvous1) -> Result<()> {
        let cookie = msg.cookie();
        if self.cookies.contains_key(&cookie) || self.spent_cookies.contains_key(&cookie) {
            return Err(Error::Protocol(format!("cookie {} already in use", cookie)));
        }
        self.set_role(key, TerminalRole::Rendezvous(cookie))?;
        let expires = Instant::now() + self.config.rendezvous_cookie_lifetime;
        self.cookies.insert(cookie, CookieRecord { key, expires });
        debug!("{}: holding cookie {} on {}", self.me, cookie, key.1);
        self.reply_on_terminal(key, CellMsg::RendezvousEstablished, None)
    }

    /// Splice the service circuit at `key` to the client circuit that
    /// registered the cookie in `msg`.
    pub(super) fn splice(&mut self, key: LinkKey, msg: Rendezvous2) -> Result<()> {
        let now = Instant::now();
        let cookie = msg.cookie();
        if self.spent_cookies.contains_key(&cookie) {
            return Err(Error::Protocol(format!("cookie {} was already used", cookie)));
        }
        let client = match self.cookies.get(&cookie) {
            Some(rec) if rec.expires > now && rec.key != key => rec.key,
            _ => return Err(Error::Protocol(format!("no client waiting on cookie {}", cookie))),
        };
        let plain = |e: Option<&LinkEnt>| {
            matches!(e, Some(LinkEnt::Terminal(t)) if t.exit.is_none() && t.extending.is_none())
        };
        if !plain(self.links.get(&key.0, key.1)) {
            return Err(Error::Protocol("service circuit can't be spliced".into()));
        }
        if !plain(self.links.get(&client.0, client.1)) {
            self.cookies.remove(&cookie);
            return Err(Error::Protocol("client circuit is gone".into()));
        }

        let (svc_ent, client_ent) = match (
            self.links.remove(&key.0, key.1),
            self.links.remove(&client.0, client.1),
        ) {
            (Some(LinkEnt::Terminal(s)), Some(LinkEnt::Terminal(c))) => (s, c),
            _ => return Err(Error::Internal("circuits vanished while splicing".into())),
        };
        self.cookies.remove(&cookie);
        self.spent_cookies
            .insert(cookie, now + self.config.circuit_idle_timeout);

        let TerminalEnt {
            peer: client_peer,
            keys: client_keys,
            ..
        } = *client_ent;
        let TerminalEnt {
            peer: svc_peer,
            keys: svc_keys,
            ..
        } = *svc_ent;
        let sealed = seal_inbound(&mut self.rng, &client_keys, CellMsg::Rendezvous2(msg))?;
        let rid = self.relays.insert(RelayEntry::new_splice(
            (client_peer, client.1, client_keys),
            (svc_peer, key.1, svc_keys),
            now,
        ));
        self.links
            .replace(&client.0, client.1, LinkEnt::Relay(rid, Side::Origin));
        self.links.replace(&key.0, key.1, LinkEnt::Relay(rid, Side::Away));
        debug!(
            "{}: cookie {} spliced {} from {} to {} from {}",
            self.me, cookie, client.1, client_peer, key.1, svc_peer
        );
        self.outbound
            .send(&client_peer, sealed_cell(client.1, sealed), None);
        Ok(())
    }
}
