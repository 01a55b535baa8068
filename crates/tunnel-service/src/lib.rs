//! The tunnel overlay: anonymizing circuits over a peer-to-peer
//! community.
//!
//! # Overview
//!
//! A [`TunnelService`] builds onion-encrypted circuits of one to four
//! hops through other peers, relays cells for circuits that other peers
//! build through us, and, when configured as an exit, carries their
//! UDP datagrams and TCP streams to the Internet.  On top of circuits it
//! runs hidden swarms: a seeder announces an infohash at an
//! introduction point, and downloaders meet it at a rendezvous point
//! without either side learning the other's address.
//!
//! Applications reach the tunnels through SOCKS5 listeners, one per
//! hop count (see [`TunnelService::launch_socks`]).
//!
//! The service doesn't find peers or move packets itself.  It is given
//! a [`Community`] that knows the peers and can send to them, and it is
//! handed every packet the community receives through a
//! [`TunnelHandle`].
//!
//! # Structure
//!
//! All circuit state lives in a single reactor task.  Everything else
//! (circuit builders, exits, SOCKS connections, hidden sessions, the
//! peer-mix strategy) runs in its own task and talks to the reactor
//! through a control queue.
//!
//! Errors that belong to one circuit stay with it: they are logged and
//! counted in [`TunnelStats`], and only the task waiting on that circuit
//! sees them.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![warn(clippy::clone_on_ref_ptr)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::implicit_clone)]
#![warn(clippy::needless_borrow)]
#![deny(clippy::ref_option_ref)]

mod builder;
mod circmgr;
mod circuit;
mod community;
mod config;
mod err;
mod exit;
mod exitcache;
mod hidden;
mod path;
mod peer;
mod reactor;
mod socks;
mod stats;
mod strategy;

pub use circuit::{ClientCirc, DataReader, DataStream, DataWriter};
pub use community::{Community, IntroDirectory, IntroPointInfo};
pub use config::{SocksConfig, SocksConfigBuilder, TunnelConfig, TunnelConfigBuilder};
pub use err::Error;
pub use hidden::{is_hidden_addr, HIDDEN_PORT, MAX_HIDDEN_PAYLOAD};
pub use peer::{PeerFlags, PeerInfo};
pub use stats::{StatsSnapshot, TunnelStats};

pub use tunnel_cell::datamsg::TargetAddr;
pub use tunnel_cell::msg::InfoHash;
pub use tunnel_llcrypto::pk::{IdentityKey, PeerId};
pub use tunnel_proto::peer::PeerHandle;

use builder::CircuitBuilder;
use circmgr::CircMgr;
use exitcache::{ExitCache, PeerCache};
use hidden::HiddenSwarms;
use peer::PeerHistory;
use reactor::{CtrlMsg, Reactor, ReactorHandle};
use socks::SocksCtx;

use futures::channel::mpsc;
use rand::rngs::StdRng;
use rand::{CryptoRng, Rng, SeedableRng};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tunnel_persist::StateMgr;

/// A Result as returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// How often the reactor looks for idle circuits and expired records.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How often the exit cache is written out.
const CACHE_SAVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A running tunnel service.
///
/// Cloning a `TunnelService` gives another handle to the same service.
/// The service keeps running until [`TunnelService::shutdown`] is
/// called, even if every handle is dropped.
#[derive(Clone)]
pub struct TunnelService {
    /// Shared state.
    inner: Arc<Inner>,
}

/// The shared part of a [`TunnelService`].
struct Inner {
    /// Our identity.
    me: PeerId,
    /// Configuration.
    config: Arc<TunnelConfig>,
    /// The community we run over.
    community: Arc<dyn Community>,
    /// The reactor's control queue.
    reactor: ReactorHandle,
    /// Circuit pools.
    mgr: Arc<CircMgr>,
    /// Hidden swarms.
    hidden: Arc<HiddenSwarms>,
    /// Counters.
    stats: Arc<TunnelStats>,
    /// Where to deliver inbound packets.
    handle: TunnelHandle,
    /// The exit cache, if we have one.
    cache: Mutex<Option<Arc<dyn PeerCache>>>,
    /// Background tasks, stopped on shutdown.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A handle for giving the service the packets that the community
/// receives.
#[derive(Clone, Debug)]
pub struct TunnelHandle {
    /// The reactor's input queue.
    input: Arc<Mutex<mpsc::Sender<(PeerHandle, Vec<u8>)>>>,
}

impl TunnelHandle {
    /// Hand a packet that arrived from `peer` to the service.
    ///
    /// Never waits: if the service is too far behind, the packet is
    /// dropped, just as if the network had lost it.
    pub fn on_packet(&self, peer: PeerHandle, packet: Vec<u8>) {
        let mut input = match self.input.lock() {
            Ok(i) => i,
            Err(_) => return,
        };
        if let Err(e) = input.try_send((peer, packet)) {
            if e.is_full() {
                debug!("input queue full; dropping packet from {}", peer);
            }
        }
    }
}

impl TunnelService {
    /// Start a tunnel service for `identity`, running over `community`.
    ///
    /// Hidden swarms need a `directory` to publish and find introduction
    /// points; without one, announcing and joining fail.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn launch(
        identity: &IdentityKey,
        config: TunnelConfig,
        community: Arc<dyn Community>,
        directory: Option<Arc<dyn IntroDirectory>>,
    ) -> Result<Self> {
        let mut rng = StdRng::from_entropy();
        Self::launch_with_rng(identity, config, community, directory, &mut rng)
    }

    /// As [`TunnelService::launch`], but drawing every random number from
    /// `rng`.
    pub fn launch_with_rng<R: Rng + CryptoRng>(
        identity: &IdentityKey,
        config: TunnelConfig,
        community: Arc<dyn Community>,
        directory: Option<Arc<dyn IntroDirectory>>,
        rng: &mut R,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let me = identity.peer_id();
        let stats = Arc::new(TunnelStats::default());
        let history = Arc::new(Mutex::new(PeerHistory::new(config.crypto_cooldown)));

        let parts = Reactor::new(
            identity,
            Arc::clone(&config),
            fork_rng(rng)?,
            Arc::clone(&history),
            Arc::clone(&stats),
        );
        let reactor = parts.handle.clone();
        let builder = Arc::new(CircuitBuilder::new(
            reactor.clone(),
            Arc::clone(&config),
            Arc::clone(&stats),
        ));
        let mgr = Arc::new(CircMgr::new(
            me,
            builder,
            Arc::clone(&community),
            history,
            Arc::clone(&config),
            fork_rng(rng)?,
        ));
        let hidden = Arc::new(HiddenSwarms::new(
            me,
            Arc::clone(&mgr),
            Arc::clone(&community),
            directory,
            Arc::clone(&config),
            fork_rng(rng)?,
        ));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(parts.reactor.run()));
        tasks.push(tokio::spawn(reactor::run_sender(
            Arc::clone(&community),
            parts.outbound,
            reactor.clone(),
            Arc::clone(&stats),
        )));
        tasks.push(tokio::spawn(run_sweeper(reactor.clone())));
        tasks.push(tokio::spawn(strategy::run_strategy(
            Arc::clone(&community),
            Arc::clone(&config),
            fork_rng(rng)?,
        )));

        info!(
            "{}: tunnel service started{}{}",
            me,
            if config.exit_enabled() { " (exit)" } else { "" },
            if config.testnet() { " on testnet" } else { "" }
        );

        Ok(TunnelService {
            inner: Arc::new(Inner {
                me,
                config,
                community,
                reactor,
                mgr,
                hidden,
                stats,
                handle: TunnelHandle {
                    input: Arc::new(Mutex::new(parts.input)),
                },
                cache: Mutex::new(None),
                tasks: Mutex::new(tasks),
            }),
        })
    }

    /// Return a handle for delivering inbound packets.
    pub fn handle(&self) -> TunnelHandle {
        self.inner.handle.clone()
    }

    /// Return the service's counters.
    pub fn stats(&self) -> &TunnelStats {
        &self.inner.stats
    }

    /// Return our own identity.
    pub fn peer_id(&self) -> PeerId {
        self.inner.me
    }

    /// Return the configuration the service is running with.
    pub fn config(&self) -> &TunnelConfig {
        &self.inner.config
    }

    /// Return a ready circuit with `hops` hops, ending at an exit if
    /// `exit` is true.
    ///
    /// Circuits are shared: another caller asking for the same kind of
    /// circuit may get the same one.
    pub async fn circuit(&self, hops: u8, exit: bool) -> Result<ClientCirc> {
        if hops == 0 || usize::from(hops) > tunnel_proto::MAX_HOPS {
            self.inner.stats.policy();
            return Err(Error::Policy(format!("can't build a {}-hop circuit", hops)));
        }
        self.inner.mgr.get_or_launch(hops, exit).await
    }

    /// Return the number of circuits we originated that are still open,
    /// including ones that are being built.
    pub async fn n_circuits(&self) -> Result<usize> {
        self.inner
            .reactor
            .call(|reply| CtrlMsg::NCircuits { reply })
            .await
    }

    /// Start the SOCKS5 listeners described by `socks`.
    ///
    /// Returns the address of each listener, by hop count.  A task keeps
    /// `min_circuits` exit circuits ready for every listened hop count.
    pub async fn launch_socks(&self, socks: &SocksConfig) -> Result<Vec<(u8, SocketAddr)>> {
        socks.validate()?;
        let ctx = Arc::new(SocksCtx {
            mgr: Arc::clone(&self.inner.mgr),
            hidden: Arc::clone(&self.inner.hidden),
            config: Arc::clone(&self.inner.config),
        });
        let mut bound = Vec::new();
        let mut tasks = Vec::new();
        for hops in socks.socks_hops().iter().copied() {
            let addr = SocketAddr::new(socks.listen_addr, socks.port_for(hops));
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| Error::Fatal(format!("can't listen on {}: {}", addr, e)))?;
            let local = listener.local_addr()?;
            info!("{}-hop SOCKS5 listener on {}", hops, local);
            bound.push((hops, local));
            tasks.push(tokio::spawn(socks::run_socks_listener(
                listener,
                hops,
                Arc::clone(&ctx),
            )));
        }
        tasks.push(tokio::spawn(run_maintenance(
            Arc::clone(&self.inner.mgr),
            Arc::clone(&self.inner.config),
            socks.socks_hops().to_vec(),
        )));
        self.lock_tasks()?.extend(tasks);
        Ok(bound)
    }

    /// Start seeding `infohash` as a hidden swarm over `hops`-hop
    /// circuits.
    pub async fn announce_hidden(&self, infohash: InfoHash, hops: u8) -> Result<()> {
        self.inner.hidden.announce(infohash, hops).await
    }

    /// Stop seeding `infohash`.
    pub fn withdraw_hidden(&self, infohash: &InfoHash) -> Result<()> {
        self.inner.hidden.withdraw(infohash)
    }

    /// Join the hidden swarm for `infohash` over `hops`-hop circuits.
    ///
    /// Returns the synthetic address that stands for the seeder.
    pub async fn join_hidden(&self, infohash: InfoHash, hops: u8) -> Result<SocketAddr> {
        self.inner.hidden.join(infohash, hops).await
    }

    /// Send `payload` to the hidden peer at the synthetic address `addr`.
    pub fn send_hidden(&self, addr: &SocketAddr, payload: &[u8]) -> Result<()> {
        self.inner.hidden.send(addr, payload, None)
    }

    /// Return a stream of the datagrams arriving from hidden peers on
    /// `hops`-hop sessions, with the synthetic address they came from.
    ///
    /// A session that a SOCKS5 UDP association has sent on delivers to
    /// that association.  Any other session delivers to the newest
    /// receiver for its hop count, and keeps delivering there.
    pub fn hidden_datagrams(
        &self,
        hops: u8,
    ) -> Result<mpsc::UnboundedReceiver<(SocketAddr, InfoHash, Vec<u8>)>> {
        let (tx, rx) = mpsc::unbounded();
        self.inner.hidden.register_sink(hops, tx)?;
        Ok(rx)
    }

    /// Return the number of live hidden sessions.
    pub fn n_hidden_sessions(&self) -> usize {
        self.inner.hidden.n_sessions()
    }

    /// Keep a cache of the exits we see in `store`.
    ///
    /// Every exit already in the cache is asked to introduce itself, so
    /// the community can learn about it again.  The cache is written
    /// periodically and on shutdown.
    pub fn with_exit_cache<S: StateMgr>(&self, store: S) -> Result<()> {
        let cache = ExitCache::load(store);
        let known = cache.peers();
        let cache: Arc<dyn PeerCache> = Arc::new(Mutex::new(cache));
        *self
            .inner
            .cache
            .lock()
            .map_err(|_| Error::Internal("exit cache lock poisoned".into()))? =
            Some(Arc::clone(&cache));

        let community = Arc::clone(&self.inner.community);
        let task = tokio::spawn(async move {
            for p in known {
                if let Err(e) = community.introduce(&p.handle).await {
                    debug!("couldn't reach cached exit {}: {}", p.handle, e);
                }
            }
            let mut ticker = tokio::time::interval(CACHE_SAVE_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = cache.note_and_save(&community.peers()) {
                    warn!("couldn't save exit cache: {}", e);
                }
            }
        });
        self.lock_tasks()?.push(task);
        Ok(())
    }

    /// Shut the service down.
    ///
    /// Every circuit is destroyed, every listener and background task is
    /// stopped, and the exit cache is saved.
    pub fn shutdown(&self) {
        if let Err(e) = self.inner.mgr.retire_all() {
            debug!("couldn't retire circuits: {}", e);
        }
        let cache = self.inner.cache.lock().ok().and_then(|c| c.clone());
        if let Some(cache) = cache {
            if let Err(e) = cache.note_and_save(&self.inner.community.peers()) {
                warn!("couldn't save exit cache: {}", e);
            }
        }
        let _ = self.inner.reactor.send(CtrlMsg::Shutdown);
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            // The reactor and sender go first in the list; let them
            // drain their queues and exit on their own.
            for t in tasks.drain(..).skip(2) {
                t.abort();
            }
        }
        info!("{}: tunnel service shut down", self.inner.me);
    }

    /// Lock the task list.
    fn lock_tasks(&self) -> Result<std::sync::MutexGuard<'_, Vec<JoinHandle<()>>>> {
        self.inner
            .tasks
            .lock()
            .map_err(|_| Error::Internal("task list lock poisoned".into()))
    }
}

/// Seed a new independent generator from `rng`.
fn fork_rng<R: Rng + CryptoRng>(rng: &mut R) -> Result<StdRng> {
    StdRng::from_rng(rng).map_err(|e| Error::Internal(format!("can't seed rng: {}", e)))
}

/// Tell the reactor to sweep, once a second, until it goes away.
async fn run_sweeper(reactor: ReactorHandle) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        if reactor.send(CtrlMsg::Sweep).is_err() {
            break;
        }
    }
}

/// Keep the exit circuit pools for `hop_counts` topped up.
async fn run_maintenance(mgr: Arc<CircMgr>, config: Arc<TunnelConfig>, hop_counts: Vec<u8>) {
    let mut ticker = tokio::time::interval(config.strategy_interval);
    loop {
        ticker.tick().await;
        if let Err(e) = mgr.launch_missing(&hop_counts) {
            warn!("couldn't launch circuits: {}", e);
            break;
        }
    }
}
