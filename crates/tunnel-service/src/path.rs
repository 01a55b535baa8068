//! Choosing the peers for a circuit.
//!
//! The terminal hop is chosen first, since it has the strictest
//! requirements; the other hops are then filled in from the remaining
//! relays.  No peer appears twice on one path, and we never pick
//! ourselves.

use crate::peer::{PeerFlags, PeerHistory, PeerInfo};
use crate::{Error, Result};

use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Instant;
use tunnel_llcrypto::pk::PeerId;
use tunnel_proto::peer::PeerHandle;

/// A list of peers to build a circuit through, first hop first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TunnelPath {
    /// The hops, in order.
    hops: Vec<PeerHandle>,
}

impl TunnelPath {
    /// Return the hops of this path.
    pub(crate) fn hops(&self) -> &[PeerHandle] {
        &self.hops[..]
    }

    /// Return the number of hops on this path.
    pub(crate) fn len(&self) -> usize {
        self.hops.len()
    }

    /// Return the hop at index `i`, if any.
    pub(crate) fn get(&self, i: usize) -> Option<&PeerHandle> {
        self.hops.get(i)
    }
}

/// The requirements for a new path.
#[derive(Clone, Debug)]
pub(crate) struct PathBuilder {
    /// How many hops.
    hops: u8,
    /// Whether the terminal hop has to be an exit.
    exit: bool,
    /// A terminal hop chosen by the caller.
    terminal: Option<PeerHandle>,
    /// Peers not to use.
    exclude: Vec<PeerId>,
}

impl PathBuilder {
    /// Create a builder for a path of `hops` hops.
    pub(crate) fn new(hops: u8, exit: bool) -> Self {
        PathBuilder {
            hops,
            exit,
            terminal: None,
            exclude: Vec::new(),
        }
    }

    /// Require the path to end at `peer`.
    pub(crate) fn terminal(mut self, peer: PeerHandle) -> Self {
        self.terminal = Some(peer);
        self
    }

    /// Don't use any of `peers`.
    pub(crate) fn exclude<'a>(mut self, peers: impl IntoIterator<Item = &'a PeerId>) -> Self {
        self.exclude.extend(peers.into_iter().copied());
        self
    }

    /// Pick a path from `peers`.
    ///
    /// Peers whose flags are unknown, peers on cool-down and excluded
    /// peers are never chosen.  Peers we built through recently are
    /// twice as likely to be picked as the others.
    pub(crate) fn pick_path<R: Rng>(
        &self,
        rng: &mut R,
        me: &PeerId,
        peers: &[PeerInfo],
        history: &PeerHistory,
        now: Instant,
    ) -> Result<TunnelPath> {
        if self.hops == 0 {
            return Err(Error::Internal("asked for a zero-hop path".into()));
        }
        let mut chosen: Vec<PeerId> = vec![*me];
        chosen.extend(self.exclude.iter().copied());

        let terminal = match &self.terminal {
            Some(t) => {
                if self.exit {
                    let known_exit = peers.iter().any(|p| p.id() == t.id() && p.is_exit());
                    if !known_exit {
                        return Err(Error::Policy(format!(
                            "{} can't be the last hop of an exit circuit",
                            t
                        )));
                    }
                }
                *t
            }
            None => {
                let want = if self.exit {
                    PeerFlags::EXIT
                } else {
                    PeerFlags::RELAY
                };
                self.pick_one(rng, peers, want, &chosen, history, now)
                    .ok_or_else(|| {
                        if self.exit {
                            Error::Policy("no exit peer available".into())
                        } else {
                            Error::Policy("no relay peer available".into())
                        }
                    })?
            }
        };
        chosen.push(*terminal.id());

        // Fill in from the terminal hop backwards.
        let mut hops = vec![terminal];
        for _ in 1..self.hops {
            let p = self
                .pick_one(rng, peers, PeerFlags::RELAY, &chosen, history, now)
                .ok_or_else(|| {
                    Error::Policy(format!("not enough relays for a {}-hop path", self.hops))
                })?;
            chosen.push(*p.id());
            hops.push(p);
        }
        hops.reverse();
        Ok(TunnelPath { hops })
    }

    /// Choose a single peer with `flags`, not in `chosen`.
    fn pick_one<R: Rng>(
        &self,
        rng: &mut R,
        peers: &[PeerInfo],
        flags: PeerFlags,
        chosen: &[PeerId],
        history: &PeerHistory,
        now: Instant,
    ) -> Option<PeerHandle> {
        let usable: Vec<&PeerInfo> = peers
            .iter()
            .filter(|p| p.has(flags))
            .filter(|p| !chosen.contains(p.id()))
            .filter(|p| history.usable(p.id(), now))
            .collect();
        usable
            .choose_weighted(rng, |p| {
                if history.recently_used(p.id(), now) {
                    2
                } else {
                    1
                }
            })
            .ok()
            .map(|p| p.handle)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use std::time::Duration;

    fn peer(n: u8, flags: Option<PeerFlags>) -> PeerInfo {
        let h = PeerHandle::new(
            PeerId::from([n; 32]),
            format!("10.0.0.{}:7759", n).parse().unwrap(),
        );
        PeerInfo::new(h, flags)
    }

    fn network() -> Vec<PeerInfo> {
        let relay = Some(PeerFlags::RELAY);
        let exit = Some(PeerFlags::RELAY | PeerFlags::EXIT);
        vec![
            peer(1, relay),
            peer(2, relay),
            peer(3, relay),
            peer(4, exit),
            peer(5, exit),
            peer(6, None),
        ]
    }

    #[test]
    fn exit_paths() {
        let mut rng = StdRng::seed_from_u64(7);
        let me = PeerId::from([0; 32]);
        let peers = network();
        let history = PeerHistory::new(Duration::from_secs(60));
        let now = Instant::now();
        for _ in 0..200 {
            let path = PathBuilder::new(3, true)
                .pick_path(&mut rng, &me, &peers, &history, now)
                .unwrap();
            assert_eq!(path.len(), 3);
            let ids: HashSet<_> = path.hops().iter().map(|h| *h.id()).collect();
            assert_eq!(ids.len(), 3);
            let last = path.get(2).unwrap();
            assert!(peers.iter().any(|p| p.id() == last.id() && p.is_exit()));
            // unknown flags are never used
            assert!(!ids.contains(&PeerId::from([6; 32])));
        }
    }

    #[test]
    fn single_hop_needs_exit() {
        let mut rng = StdRng::seed_from_u64(8);
        let me = PeerId::from([0; 32]);
        let relays: Vec<_> = network().into_iter().filter(|p| !p.is_exit()).collect();
        let history = PeerHistory::new(Duration::from_secs(60));
        let r = PathBuilder::new(1, true).pick_path(&mut rng, &me, &relays, &history, Instant::now());
        assert!(matches!(r, Err(Error::Policy(_))));
        let r = PathBuilder::new(1, false).pick_path(&mut rng, &me, &relays, &history, Instant::now());
        assert!(r.is_ok());
    }

    #[test]
    fn forced_terminal() {
        let mut rng = StdRng::seed_from_u64(9);
        let me = PeerId::from([0; 32]);
        let peers = network();
        let history = PeerHistory::new(Duration::from_secs(60));
        let now = Instant::now();

        // a relay-only terminal can't end an exit circuit
        let d = peers[2].handle;
        let r = PathBuilder::new(3, true)
            .terminal(d)
            .pick_path(&mut rng, &me, &peers, &history, now);
        assert!(matches!(r, Err(Error::Policy(_))));

        // but it can end a plain one
        let path = PathBuilder::new(3, false)
            .terminal(d)
            .pick_path(&mut rng, &me, &peers, &history, now)
            .unwrap();
        assert_eq!(path.get(2), Some(&d));
    }

    #[test]
    fn exclusions_and_cooldown() {
        let mut rng = StdRng::seed_from_u64(10);
        let me = PeerId::from([0; 32]);
        let peers = network();
        let now = Instant::now();
        let mut history = PeerHistory::new(Duration::from_secs(60));
        history.note_crypto_failure(&PeerId::from([4; 32]), now);
        for _ in 0..50 {
            let path = PathBuilder::new(2, true)
                .exclude(&[PeerId::from([1; 32])])
                .pick_path(&mut rng, &me, &peers, &history, now)
                .unwrap();
            assert_eq!(path.get(1).unwrap().id(), &PeerId::from([5; 32]));
            assert_ne!(path.get(0).unwrap().id(), &PeerId::from([1; 32]));
        }
        // too few relays left
        let r = PathBuilder::new(4, true)
            .exclude(&[PeerId::from([1; 32]), PeerId::from([2; 32])])
            .pick_path(&mut rng, &me, &peers, &history, now);
        assert!(matches!(r, Err(Error::Policy(_))));
    }
}
