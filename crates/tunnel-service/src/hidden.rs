//! Hidden swarms: seeding and downloading an infohash without either
//! side learning the other's address.
//!
//! A service announces an infohash by building a circuit to an
//! introduction point and registering a fresh service key there.  A
//! client builds one circuit to a rendezvous point of its choosing and
//! registers a cookie, then sends an INTRO through the introduction
//! point naming the rendezvous point.  The service answers by building
//! its own circuit to the rendezvous point, which splices the two.
//!
//! The two ends then share a key that no relay knows, and exchange
//! sealed datagrams.  Each session shows up to the local BitTorrent
//! engine as a synthetic peer address in 240.0.0.0/4.

use crate::circmgr::CircMgr;
use crate::circuit::ClientCirc;
use crate::community::{IntroDirectory, IntroPointInfo};
use crate::peer::PeerFlags;
use crate::{Community, Error, Result, TunnelConfig};

use futures::channel::mpsc;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};
use tunnel_cell::msg::{
    CellMsg, Cookie, DataHidden, EstablishIntro, InfoHash, Intro, Rendezvous1, Rendezvous2,
};
use tunnel_llcrypto::pk::curve25519::PublicKey;
use tunnel_llcrypto::pk::{IdentityKey, PeerId};
use tunnel_proto::crypto::cell::{max_plaintext, HopKeys};
use tunnel_proto::crypto::handshake::ntor::{NtorClient, NtorPublicKey, NtorSecretKey, NtorServer};
use tunnel_proto::crypto::handshake::{ClientHandshake, ServerHandshake};
use tunnel_proto::peer::PeerHandle;
use tunnel_proto::MAX_HOPS;

/// Port of every synthetic session address.
pub const HIDDEN_PORT: u16 = 1024;

/// Largest datagram a hidden session can carry, whatever the hop counts
/// of its two halves.
pub const MAX_HIDDEN_PAYLOAD: usize = max_plaintext(MAX_HOPS + 1);

/// Return true if `addr` is a synthetic hidden-session address.
pub fn is_hidden_addr(addr: &SocketAddr) -> bool {
    match addr {
        SocketAddr::V4(a) => a.ip().octets()[0] & 0xf0 == 0xf0,
        SocketAddr::V6(_) => false,
    }
}

/// Which end of a session we are.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum End {
    /// We joined someone else's swarm.
    Client,
    /// We announced the swarm.
    Service,
}

/// An end-to-end session.
struct Session {
    /// The swarm.
    infohash: InfoHash,
    /// Our half of the spliced circuit.
    circ: ClientCirc,
    /// Keys shared with the other end.
    keys: Arc<HopKeys>,
    /// Which end we are.
    end: End,
    /// Hop count of our half.
    hops: u8,
    /// The sink this session's datagrams go to, once it has one.
    owner: Option<SinkId>,
}

/// Datagrams from hidden sessions: (session address, infohash, payload).
pub(crate) type HiddenSink = mpsc::UnboundedSender<(SocketAddr, InfoHash, Vec<u8>)>;

/// Identifies a registered [`HiddenSink`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SinkId(u64);

/// Mutable state of the hidden-swarm manager.
#[derive(Default)]
struct State {
    /// Live sessions, by synthetic address.
    sessions: HashMap<SocketAddrV4, Session>,
    /// Last synthetic address handed out.
    next_addr: u32,
    /// Where inbound datagrams can go, with the hop count each one
    /// listens for.
    sinks: HashMap<SinkId, (u8, HiddenSink)>,
    /// Last sink id handed out.
    next_sink: u64,
    /// Swarms we are announcing, with the circuit to their
    /// introduction point.
    announced: HashMap<InfoHash, ClientCirc>,
}

/// Manager for every hidden swarm this peer seeds or downloads.
pub(crate) struct HiddenSwarms {
    /// Our identity.
    me: PeerId,
    /// Builds the circuits.
    mgr: Arc<CircMgr>,
    /// Where we find introduction and rendezvous points.
    community: Arc<dyn Community>,
    /// Where introduction points are published.
    directory: Option<Arc<dyn IntroDirectory>>,
    /// Configuration.
    config: Arc<TunnelConfig>,
    /// Randomness for cookies, keys and seals.
    rng: Mutex<StdRng>,
    /// Sessions and announcements.
    state: Mutex<State>,
}

impl HiddenSwarms {
    /// Make a new manager.
    pub(crate) fn new(
        me: PeerId,
        mgr: Arc<CircMgr>,
        community: Arc<dyn Community>,
        directory: Option<Arc<dyn IntroDirectory>>,
        config: Arc<TunnelConfig>,
        rng: StdRng,
    ) -> Self {
        HiddenSwarms {
            me,
            mgr,
            community,
            directory,
            config,
            rng: Mutex::new(rng),
            state: Mutex::new(State::default()),
        }
    }

    /// Start seeding `infohash` as a hidden swarm, over circuits of
    /// `hops` hops.
    pub(crate) async fn announce(self: &Arc<Self>, infohash: InfoHash, hops: u8) -> Result<()> {
        check_hops(hops)?;
        let directory = self.directory()?;
        let service = {
            let mut rng = self.lock_rng()?;
            IdentityKey::generate(&mut *rng)
        };
        let intro = self.pick_relay(&[])?;
        let circ = self.mgr.build_to(hops, intro).await?;
        let mut events = circ.events();
        circ.send_msg(EstablishIntro::new(infohash, *service.public()).into())?;
        self.wait_for(&mut events, |m| matches!(m, CellMsg::IntroEstablished))
            .await?;

        directory
            .announce(
                infohash,
                IntroPointInfo {
                    intro,
                    service_key: service.peer_id(),
                },
            )
            .await?;
        info!("announced hidden swarm {} at {}", infohash, intro);

        self.lock_state()?.announced.insert(infohash, circ.clone());
        let this = Arc::clone(self);
        let key = Arc::new(NtorSecretKey::from(&service));
        let public = *service.public();
        tokio::spawn(async move {
            this.serve_intro(infohash, hops, circ, events, key, public)
                .await;
        });
        Ok(())
    }

    /// Stop seeding `infohash`.
    pub(crate) fn withdraw(&self, infohash: &InfoHash) -> Result<()> {
        if let Some(circ) = self.lock_state()?.announced.remove(infohash) {
            circ.terminate();
        }
        Ok(())
    }

    /// Listen for INTRO requests on an introduction circuit, and keep
    /// the introduction point's record fresh.
    async fn serve_intro(
        self: Arc<Self>,
        infohash: InfoHash,
        hops: u8,
        circ: ClientCirc,
        mut events: mpsc::UnboundedReceiver<CellMsg>,
        key: Arc<NtorSecretKey>,
        public: PublicKey,
    ) {
        let refresh = self.config.intro_lifetime / 2;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + refresh, refresh);
        loop {
            tokio::select! {
                msg = events.next() => match msg {
                    Some(CellMsg::Intro(intro)) if *intro.infohash() == infohash => {
                        let this = Arc::clone(&self);
                        let key = Arc::clone(&key);
                        tokio::spawn(async move {
                            if let Err(e) = this.answer_intro(intro, hops, key).await {
                                debug!("couldn't answer INTRO for {}: {}", infohash, e);
                            }
                        });
                    }
                    Some(CellMsg::IntroEstablished) => trace!("intro for {} refreshed", infohash),
                    Some(other) => debug!("unexpected {} on intro circuit", other.kind()),
                    None => break,
                },
                _ = ticker.tick() => {
                    let msg = EstablishIntro::new(infohash, public).into();
                    if let Err(e) = circ.send_msg(msg) {
                        debug!("couldn't refresh intro for {}: {}", infohash, e);
                        break;
                    }
                }
            }
        }
        warn!("introduction circuit for {} closed", infohash);
        if let Ok(mut state) = self.lock_state() {
            state.announced.remove(&infohash);
        }
    }

    /// Answer a client's INTRO: finish the handshake with our service
    /// key and meet the client at its rendezvous point.
    async fn answer_intro(
        self: Arc<Self>,
        intro: Intro,
        hops: u8,
        key: Arc<NtorSecretKey>,
    ) -> Result<()> {
        let (keygen, reply) = {
            let mut rng = self.lock_rng()?;
            NtorServer::server(&mut *rng, std::slice::from_ref(key.as_ref()), intro.handshake())?
        };
        let keys = HopKeys::construct(keygen)?;
        let rp = PeerHandle::new(*intro.rendezvous(), intro.rendezvous_addr());
        let circ = self.mgr.build_to(hops, rp).await?;
        let events = circ.events();
        circ.send_msg(Rendezvous2::new(intro.cookie(), reply).into())?;
        let addr = self.add_session(*intro.infohash(), circ, keys, End::Service, hops)?;
        debug!(
            "serving {} to a client via {} as {}",
            intro.infohash(),
            rp,
            addr
        );
        self.spawn_reader(addr, events);
        Ok(())
    }

    /// Join the hidden swarm `infohash` over circuits of `hops` hops.
    ///
    /// Returns the synthetic address of the new session.
    pub(crate) async fn join(self: &Arc<Self>, infohash: InfoHash, hops: u8) -> Result<SocketAddr> {
        check_hops(hops)?;
        let directory = self.directory()?;
        let intros = directory.lookup(infohash).await?;
        let info = {
            let mut rng = self.lock_rng()?;
            intros.choose(&mut *rng).cloned()
        }
        .ok_or_else(|| Error::Transport(format!("no introduction points for {}", infohash)))?;

        // Register a cookie at a rendezvous point first.
        let rp = self.pick_relay(&[*info.intro.id()])?;
        let rp_circ = self.mgr.build_to(hops, rp).await?;
        let mut events = rp_circ.events();
        let cookie = {
            let mut rng = self.lock_rng()?;
            Cookie::from(rng.gen_range(1..=u32::MAX))
        };
        rp_circ.send_msg(Rendezvous1::new(cookie).into())?;
        self.wait_for(&mut events, |m| matches!(m, CellMsg::RendezvousEstablished))
            .await?;

        // Then ask the service to meet us there.
        let (state, handshake) = {
            let mut rng = self.lock_rng()?;
            NtorClient::client1(&mut *rng, &NtorPublicKey::from(info.service_key))?
        };
        let intro_circ = self.mgr.build_to(hops, info.intro).await?;
        intro_circ.send_msg(
            Intro::new(infohash, *rp.id(), rp.addr(), cookie, handshake).into(),
        )?;
        drop(intro_circ);

        let r2 = self
            .wait_for(&mut events, |m| {
                matches!(m, CellMsg::Rendezvous2(r) if r.cookie() == cookie)
            })
            .await?;
        let r2 = match r2 {
            CellMsg::Rendezvous2(r) => r,
            _ => return Err(Error::Internal("wait_for returned the wrong message".into())),
        };
        let keys = HopKeys::construct(NtorClient::client2(state, r2.handshake())?)?;
        let addr = self.add_session(infohash, rp_circ, keys, End::Client, hops)?;
        info!("joined hidden swarm {} via {} as {}", infohash, rp, addr);
        self.spawn_reader(addr, events);
        Ok(SocketAddr::V4(addr))
    }

    /// Send `payload` to the other end of the session at `addr`.
    ///
    /// If `from` is given, the session's datagrams go to that sink from
    /// now on.
    pub(crate) fn send(&self, addr: &SocketAddr, payload: &[u8], from: Option<SinkId>) -> Result<()> {
        let addr = match addr {
            SocketAddr::V4(a) if is_hidden_addr(addr) => *a,
            _ => return Err(Error::Policy(format!("{} is not a hidden session", addr))),
        };
        if payload.len() > MAX_HIDDEN_PAYLOAD {
            return Err(Error::Protocol(format!(
                "{}-byte datagram is too big for a hidden session",
                payload.len()
            )));
        }
        let (circ, keys, end) = {
            let mut state = self.lock_state()?;
            let s = state
                .sessions
                .get_mut(&addr)
                .ok_or_else(|| Error::Transport(format!("no session at {}", addr)))?;
            if from.is_some() {
                s.owner = from;
            }
            (s.circ.clone(), Arc::clone(&s.keys), s.end)
        };
        let sealed = {
            let mut rng = self.lock_rng()?;
            match end {
                End::Client => keys.encrypt_outbound(&mut *rng, payload)?,
                End::Service => keys.encrypt_inbound(&mut *rng, payload)?,
            }
        };
        circ.send_msg(DataHidden::new(sealed).into())
    }

    /// Add a sink for datagrams from sessions with hop count `hops`.
    ///
    /// A session's datagrams go to the sink that last sent on it.  A
    /// session that has no such sink is given to the newest sink for its
    /// hop count.
    pub(crate) fn register_sink(&self, hops: u8, sink: HiddenSink) -> Result<SinkId> {
        let mut state = self.lock_state()?;
        state.next_sink += 1;
        let id = SinkId(state.next_sink);
        state.sinks.insert(id, (hops, sink));
        Ok(id)
    }

    /// Return the number of live sessions.
    pub(crate) fn n_sessions(&self) -> usize {
        self.lock_state().map(|s| s.sessions.len()).unwrap_or(0)
    }

    /// Remember a new session and give it an address.
    fn add_session(
        &self,
        infohash: InfoHash,
        circ: ClientCirc,
        keys: HopKeys,
        end: End,
        hops: u8,
    ) -> Result<SocketAddrV4> {
        let mut state = self.lock_state()?;
        state.next_addr = state.next_addr.wrapping_add(1) & 0x0fff_ffff;
        if state.next_addr == 0 {
            state.next_addr = 1;
        }
        let addr = SocketAddrV4::new(
            Ipv4Addr::from(0xf000_0000 | state.next_addr),
            HIDDEN_PORT,
        );
        state.sessions.insert(
            addr,
            Session {
                infohash,
                circ,
                keys: Arc::new(keys),
                end,
                hops,
                owner: None,
            },
        );
        Ok(addr)
    }

    /// Spawn a task that opens the datagrams arriving on a session and
    /// hands them to the sink for its hop count.
    fn spawn_reader(self: &Arc<Self>, addr: SocketAddrV4, mut events: mpsc::UnboundedReceiver<CellMsg>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = events.next().await {
                let sealed = match msg {
                    CellMsg::DataHidden(d) => d.into_sealed(),
                    other => {
                        trace!("{}: ignoring {}", addr, other.kind());
                        continue;
                    }
                };
                if let Err(e) = this.deliver(addr, &sealed) {
                    debug!("{}: dropped hidden datagram: {}", addr, e);
                }
            }
            debug!("hidden session {} closed", addr);
            if let Ok(mut state) = this.lock_state() {
                state.sessions.remove(&addr);
            }
        });
    }

    /// Open one sealed datagram and pass it on.
    fn deliver(&self, addr: SocketAddrV4, sealed: &[u8]) -> Result<()> {
        let mut state = self.lock_state()?;
        let State {
            sessions, sinks, ..
        } = &mut *state;
        sinks.retain(|_, (_, sink)| !sink.is_closed());
        let s = sessions
            .get_mut(&addr)
            .ok_or_else(|| Error::Internal("session vanished".into()))?;
        let payload = match s.end {
            End::Client => s.keys.decrypt_inbound(sealed)?,
            End::Service => s.keys.decrypt_outbound(sealed)?,
        };
        let hops = s.hops;
        let owner = match s.owner.filter(|id| sinks.contains_key(id)) {
            Some(id) => id,
            None => sinks
                .iter()
                .filter(|(_, (h, _))| *h == hops)
                .map(|(id, _)| *id)
                .max()
                .ok_or_else(|| {
                    Error::Transport(format!("no listener for {}-hop sessions", hops))
                })?,
        };
        s.owner = Some(owner);
        match sinks.get(&owner) {
            Some((_, sink)) => sink
                .unbounded_send((SocketAddr::V4(addr), s.infohash, payload))
                .map_err(|_| Error::Transport("nobody is listening".into())),
            None => Err(Error::Internal("sink vanished".into())),
        }
    }

    /// Wait for the first message on `events` that `want` accepts,
    /// ignoring others, for at most `circuit_build_timeout`.
    async fn wait_for<F>(
        &self,
        events: &mut mpsc::UnboundedReceiver<CellMsg>,
        want: F,
    ) -> Result<CellMsg>
    where
        F: Fn(&CellMsg) -> bool,
    {
        let limit = self.config.circuit_build_timeout;
        let wait = async {
            while let Some(msg) = events.next().await {
                if want(&msg) {
                    return Ok(msg);
                }
                trace!("ignoring {} while waiting", msg.kind());
            }
            Err(Error::Transport("circuit closed".into()))
        };
        tokio::time::timeout(limit, wait).await?
    }

    /// Pick a random relay other than ourselves and `exclude`.
    fn pick_relay(&self, exclude: &[PeerId]) -> Result<PeerHandle> {
        let candidates: Vec<PeerHandle> = self
            .community
            .candidates(PeerFlags::RELAY)
            .into_iter()
            .map(|p| p.handle)
            .filter(|h| *h.id() != self.me && !exclude.contains(h.id()))
            .collect();
        let mut rng = self.lock_rng()?;
        candidates
            .choose(&mut *rng)
            .copied()
            .ok_or_else(|| Error::Policy("no relay available for a hidden swarm".into()))
    }

    /// Return the introduction point directory.
    fn directory(&self) -> Result<Arc<dyn IntroDirectory>> {
        self.directory
            .clone()
            .ok_or_else(|| Error::Policy("no introduction point directory configured".into()))
    }

    /// Lock our random number generator.
    fn lock_rng(&self) -> Result<MutexGuard<'_, StdRng>> {
        self.rng
            .lock()
            .map_err(|_| Error::Internal("rng lock poisoned".into()))
    }

    /// Lock our state.
    fn lock_state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("hidden swarm lock poisoned".into()))
    }
}

/// Hidden swarms never use direct (0-hop) connections.
fn check_hops(hops: u8) -> Result<()> {
    if hops == 0 {
        Err(Error::Policy("hidden swarms need at least one hop".into()))
    } else if usize::from(hops) > MAX_HOPS {
        Err(Error::Policy(format!("{} hops is too many", hops)))
    } else {
        Ok(())
    }
}
