//! Keep pools of ready circuits, and launch new ones on demand.
//!
//! Circuits are pooled by hop count and by whether they end at an exit.
//! A request takes the least recently used ready circuit from the
//! matching pool, or builds a new one, retrying with fresh paths until
//! the build timeout runs out.  A pool never has more than
//! `max_circuits` circuits ready and being built at once.
//!
//! A caller that must not share its circuit claims one instead: it is
//! taken out of the pool, and the pool is topped up later.

use crate::builder::CircuitBuilder;
use crate::circuit::ClientCirc;
use crate::path::{PathBuilder, TunnelPath};
use crate::peer::PeerHistory;
use crate::{Community, Error, Result, TunnelConfig};

use rand::rngs::StdRng;
use retry_error::RetryError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use tunnel_llcrypto::pk::PeerId;
use tunnel_proto::peer::PeerHandle;

/// Which pool a circuit belongs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct PoolKey {
    /// Number of hops.
    hops: u8,
    /// Whether the last hop is an exit.
    exit: bool,
}

/// A circuit in a pool.
#[derive(Debug)]
struct OpenEnt {
    /// The circuit.
    circ: ClientCirc,
    /// When we last handed it out.
    last_used: Instant,
}

/// The ready and pending circuits of one kind.
#[derive(Debug, Default)]
struct Pool {
    /// Circuits that are ready to use.
    open: Vec<OpenEnt>,
    /// Number of builds in progress for this pool.
    pending: usize,
}

/// What [`CircMgr::take_or_reserve`] found.
enum Take {
    /// A ready circuit.
    Ready(ClientCirc),
    /// Nothing ready; the caller should build one.
    Build,
    /// Nothing ready, and enough builds are running already.
    Wait,
}

impl Pool {
    /// Drop circuits that have closed.
    fn prune(&mut self) {
        self.open.retain(|ent| !ent.circ.is_closing());
    }
}

/// A circuit manager: the part of the tunnel service that decides which
/// circuit to use for a request.
pub(crate) struct CircMgr {
    /// Our identity, so we never pick ourselves.
    me: PeerId,
    /// Builds circuits along a path.
    builder: Arc<CircuitBuilder>,
    /// Where we learn about peers.
    community: Arc<dyn Community>,
    /// What we know about peers.
    history: Arc<Mutex<PeerHistory>>,
    /// Configuration.
    config: Arc<TunnelConfig>,
    /// Randomness for path selection.
    rng: Mutex<StdRng>,
    /// Pools of circuits.
    pools: Mutex<HashMap<PoolKey, Pool>>,
    /// Wakes callers waiting for a pending build to finish.
    pool_changed: Notify,
}

impl CircMgr {
    /// Make a new circuit manager.
    pub(crate) fn new(
        me: PeerId,
        builder: Arc<CircuitBuilder>,
        community: Arc<dyn Community>,
        history: Arc<Mutex<PeerHistory>>,
        config: Arc<TunnelConfig>,
        rng: StdRng,
    ) -> Self {
        CircMgr {
            me,
            builder,
            community,
            history,
            config,
            rng: Mutex::new(rng),
            pools: Mutex::new(HashMap::new()),
            pool_changed: Notify::new(),
        }
    }

    /// Return a ready circuit with `hops` hops, ending at an exit if
    /// `exit` is true, building one if there isn't one.
    ///
    /// When the pool already has `max_circuits` circuits ready or being
    /// built, wait for one of the builds instead of starting another.
    pub(crate) async fn get_or_launch(self: &Arc<Self>, hops: u8, exit: bool) -> Result<ClientCirc> {
        let key = PoolKey { hops, exit };
        loop {
            let changed = self.pool_changed.notified();
            match self.take_or_reserve(key)? {
                Take::Ready(circ) => return Ok(circ),
                Take::Build => break,
                Take::Wait => changed.await,
            }
        }
        let result = self.launch(hops, exit, None).await;
        if let Ok(circ) = &result {
            self.add_open(key, circ.clone())?;
        }
        self.build_finished(key)?;
        result
    }

    /// Return a circuit with `hops` hops, ending at an exit if `exit` is
    /// true, that nobody else will be handed.
    ///
    /// A ready circuit is taken out of its pool; otherwise a new one is
    /// built and never pooled.
    pub(crate) async fn claim(&self, hops: u8, exit: bool) -> Result<ClientCirc> {
        let key = PoolKey { hops, exit };
        if let Some(circ) = self.remove_open(key)? {
            debug!("{}: claimed from the {}-hop pool", circ.unique_id(), hops);
            return Ok(circ);
        }
        self.launch(hops, exit, None).await
    }

    /// Build a fresh circuit of `hops` hops ending at `terminal`.
    ///
    /// These circuits are never pooled: they carry hidden-swarm traffic
    /// and belong to whoever asked for them.
    pub(crate) async fn build_to(&self, hops: u8, terminal: PeerHandle) -> Result<ClientCirc> {
        self.launch(hops, false, Some(terminal)).await
    }

    /// Launch exit circuits in the background until every hop count in
    /// `hop_counts` has `min_circuits` ready or pending.
    pub(crate) fn launch_missing(self: &Arc<Self>, hop_counts: &[u8]) -> Result<()> {
        for hops in hop_counts.iter().copied().filter(|h| *h > 0) {
            let key = PoolKey { hops, exit: true };
            let missing = {
                let mut pools = self.lock_pools()?;
                let pool = pools.entry(key).or_default();
                pool.prune();
                let have = pool.open.len() + pool.pending;
                let room = self.config.max_circuits.saturating_sub(have);
                let missing = self.config.min_circuits.saturating_sub(have).min(room);
                pool.pending += missing;
                missing
            };
            for _ in 0..missing {
                let mgr = Arc::clone(self);
                tokio::spawn(async move {
                    match mgr.launch(hops, true, None).await {
                        Ok(circ) => {
                            let _ = mgr.add_open(key, circ);
                        }
                        Err(e) => debug!("preemptive {}-hop circuit failed: {}", hops, e),
                    }
                    let _ = mgr.build_finished(key);
                });
            }
        }
        Ok(())
    }

    /// Close every pooled circuit.
    pub(crate) fn retire_all(&self) -> Result<()> {
        let mut pools = self.lock_pools()?;
        for pool in pools.values_mut() {
            for ent in pool.open.drain(..) {
                ent.circ.terminate();
            }
        }
        Ok(())
    }

    /// Build a circuit, picking a new path after each failure.
    ///
    /// A peer that a build failed at is left out of the following
    /// paths.  Gives up after `max_build_attempts` builds, or when
    /// `circuit_build_timeout` has passed.
    async fn launch(
        &self,
        hops: u8,
        exit: bool,
        terminal: Option<PeerHandle>,
    ) -> Result<ClientCirc> {
        let deadline = tokio::time::Instant::now() + self.config.circuit_build_timeout;
        let mut retry: RetryError<Error> = RetryError::in_attempt_to(format!(
            "build a {}-hop {} circuit",
            hops,
            if exit { "exit" } else { "internal" }
        ));
        let mut exclude: Vec<PeerId> = Vec::new();
        let mut last_err = Error::Timeout;

        for attempt in 0..self.config.max_build_attempts {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            let path = match self.pick_path(hops, exit, terminal, &exclude) {
                Ok(p) => p,
                Err(e) if attempt == 0 => return Err(e),
                Err(e) => {
                    debug!("no more paths to try: {}", e);
                    break;
                }
            };
            match self.builder.build(path.clone(), exit).await {
                Ok(circ) => return Ok(circ),
                Err(failure) => {
                    if let Some(bad) = path.get(failure.hops_built) {
                        if failure.error.is_crypto() {
                            if let Ok(mut h) = self.history.lock() {
                                h.note_crypto_failure(bad.id(), Instant::now());
                            }
                        }
                        if Some(*bad) != terminal {
                            exclude.push(*bad.id());
                        }
                    }
                    last_err = failure.error.clone();
                    retry.push(failure.error);
                }
            }
        }
        warn!("{}", retry);
        Err(last_err)
    }

    /// Choose a path that avoids `exclude`.
    fn pick_path(
        &self,
        hops: u8,
        exit: bool,
        terminal: Option<PeerHandle>,
        exclude: &[PeerId],
    ) -> Result<TunnelPath> {
        let peers = self.community.peers();
        let mut builder = PathBuilder::new(hops, exit).exclude(exclude);
        if let Some(t) = terminal {
            builder = builder.terminal(t);
        }
        let history = self
            .history
            .lock()
            .map_err(|_| Error::Internal("peer history lock poisoned".into()))?;
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| Error::Internal("rng lock poisoned".into()))?;
        builder.pick_path(&mut *rng, &self.me, &peers, &history, Instant::now())
    }

    /// Take the least recently used ready circuit from a pool.  If
    /// there is none and the pool has room, count a new build as pending
    /// for the caller to start.
    fn take_or_reserve(&self, key: PoolKey) -> Result<Take> {
        let mut pools = self.lock_pools()?;
        let pool = pools.entry(key).or_default();
        pool.prune();
        let now = Instant::now();
        if let Some(e) = pool.open.iter_mut().min_by_key(|e| e.last_used) {
            e.last_used = now;
            return Ok(Take::Ready(e.circ.clone()));
        }
        if pool.pending < self.config.max_circuits {
            pool.pending += 1;
            Ok(Take::Build)
        } else {
            Ok(Take::Wait)
        }
    }

    /// Remove the least recently used ready circuit from a pool.
    fn remove_open(&self, key: PoolKey) -> Result<Option<ClientCirc>> {
        let mut pools = self.lock_pools()?;
        let pool = match pools.get_mut(&key) {
            Some(p) => p,
            None => return Ok(None),
        };
        pool.prune();
        let idx = pool
            .open
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(i, _)| i);
        Ok(idx.map(|i| pool.open.swap_remove(i).circ))
    }

    /// Put a newly built circuit in its pool, unless the pool is full.
    fn add_open(&self, key: PoolKey, circ: ClientCirc) -> Result<()> {
        let mut pools = self.lock_pools()?;
        let pool = pools.entry(key).or_default();
        pool.prune();
        if pool.open.len() >= self.config.max_circuits {
            debug!("{}: pool for {:?} is full; not keeping it", circ.unique_id(), key);
            return Ok(());
        }
        info!(
            "{}: {}-hop {} circuit ready",
            circ.unique_id(),
            key.hops,
            if key.exit { "exit" } else { "internal" }
        );
        pool.open.push(OpenEnt {
            circ,
            last_used: Instant::now(),
        });
        Ok(())
    }

    /// Note that a build for a pool has finished, and wake anybody
    /// waiting on it.
    fn build_finished(&self, key: PoolKey) -> Result<()> {
        let mut pools = self.lock_pools()?;
        let pool = pools.entry(key).or_default();
        pool.pending = pool.pending.saturating_sub(1);
        self.pool_changed.notify_waiters();
        Ok(())
    }

    /// Lock the pools.
    fn lock_pools(&self) -> Result<std::sync::MutexGuard<'_, HashMap<PoolKey, Pool>>> {
        self.pools
            .lock()
            .map_err(|_| Error::Internal("circuit pool lock poisoned".into()))
    }
}
