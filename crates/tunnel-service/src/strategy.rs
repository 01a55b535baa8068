//! The golden-ratio peer-mix strategy.
//!
//! Once we know more peers than we want, each tick drops one peer so
//! that the share of relay-only peers moves toward the configured
//! ratio.  Peers whose flags we don't know yet are asked to introduce
//! themselves, at most once per cool-down.

use crate::peer::PeerInfo;
use crate::{Community, TunnelConfig};

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use tunnel_llcrypto::pk::PeerId;
use tunnel_proto::peer::PeerHandle;

/// Something the strategy wants done.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Action {
    /// Forget this peer.
    Drop(PeerId),
    /// Ask this peer for its flags.
    Introduce(PeerHandle),
}

/// State of the golden-ratio walker.
#[derive(Debug)]
pub(crate) struct GoldenRatio {
    /// Most peers we want to keep.
    target_peers: usize,
    /// Wanted share of relay-only peers.
    ratio: f64,
    /// How often we may ask the same peer to introduce itself.
    introduce_cooldown: Duration,
    /// When we last asked each peer.
    asked: HashMap<PeerId, Instant>,
}

impl GoldenRatio {
    /// Make a walker for `config`.
    pub(crate) fn new(config: &TunnelConfig) -> Self {
        GoldenRatio {
            target_peers: config.target_peers,
            ratio: config.golden_ratio,
            introduce_cooldown: config.introduce_cooldown,
            asked: HashMap::new(),
        }
    }

    /// Decide what to do about `peers`.
    pub(crate) fn plan<R: Rng>(&mut self, rng: &mut R, peers: &[PeerInfo], now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        if peers.len() > self.target_peers {
            let exits: Vec<&PeerInfo> = peers.iter().filter(|p| p.is_exit()).collect();
            let relay_share = 1.0 - exits.len() as f64 / peers.len() as f64;
            let victim = if relay_share < self.ratio {
                exits.choose(rng).copied()
            } else if relay_share > self.ratio {
                let relays: Vec<&PeerInfo> = peers
                    .iter()
                    .filter(|p| p.flags.is_some() && !p.is_exit())
                    .collect();
                relays.choose(rng).copied()
            } else {
                None
            };
            if let Some(p) = victim {
                trace!(
                    "relay share {:.3}, want {:.3}: dropping {}",
                    relay_share,
                    self.ratio,
                    p.id()
                );
                actions.push(Action::Drop(*p.id()));
            }
        }

        let cooldown = self.introduce_cooldown;
        self.asked
            .retain(|_, when| now.saturating_duration_since(*when) < cooldown);
        for p in peers.iter().filter(|p| p.flags.is_none()) {
            if !self.asked.contains_key(p.id()) {
                self.asked.insert(*p.id(), now);
                actions.push(Action::Introduce(p.handle));
            }
        }
        actions
    }
}

/// Run the strategy against `community` every `strategy_interval`.
pub(crate) async fn run_strategy<R: Rng + Send>(
    community: Arc<dyn Community>,
    config: Arc<TunnelConfig>,
    mut rng: R,
) {
    let mut walker = GoldenRatio::new(&config);
    let mut ticker = tokio::time::interval(config.strategy_interval);
    loop {
        ticker.tick().await;
        let peers = community.peers();
        let actions = walker.plan(&mut rng, &peers[..], Instant::now());
        for action in actions {
            match action {
                Action::Drop(id) => {
                    debug!("peer mix: dropping {}", id);
                    community.remove_peer(&id);
                }
                Action::Introduce(h) => {
                    if let Err(e) = community.introduce(&h).await {
                        debug!("couldn't ask {} to introduce itself: {}", h, e);
                    }
                }
            }
        }
    }
}
