//! What we know about other peers: their advertised capabilities, and
//! our own experience using them.

use bitflags::bitflags;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tunnel_llcrypto::pk::PeerId;
use tunnel_proto::peer::PeerHandle;

bitflags! {
    /// Roles that a peer has said it is willing to take.
    ///
    /// Peers learn each other's flags from introduction messages; until
    /// then, a peer's flags are unknown and it is never chosen for a
    /// circuit.
    pub struct PeerFlags: u8 {
        /// Forwards cells for circuits it doesn't terminate.
        const RELAY = (1<<0);
        /// Carries DATA to and from the Internet.
        const EXIT = (1<<1);
        /// Passed a bandwidth test.
        const SPEED_TESTED = (1<<2);
    }
}

impl From<u8> for PeerFlags {
    fn from(v: u8) -> Self {
        PeerFlags::from_bits_truncate(v)
    }
}

/// A peer, as reported by the community.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    /// How to reach the peer.
    pub handle: PeerHandle,
    /// What the peer offers, if we know.
    pub flags: Option<PeerFlags>,
}

impl PeerInfo {
    /// Construct a new PeerInfo.
    pub fn new(handle: PeerHandle, flags: Option<PeerFlags>) -> Self {
        PeerInfo { handle, flags }
    }

    /// Return this peer's identity.
    pub fn id(&self) -> &PeerId {
        self.handle.id()
    }

    /// Return true if we know this peer has every flag in `flags`.
    pub fn has(&self, flags: PeerFlags) -> bool {
        self.flags.map(|f| f.contains(flags)).unwrap_or(false)
    }

    /// Return true if this peer is known to be an exit.
    pub fn is_exit(&self) -> bool {
        self.has(PeerFlags::EXIT)
    }
}

/// How long a successful hop counts as "recently used".
const RECENT_USE: Duration = Duration::from_secs(60 * 60);

/// Our history with other peers.
///
/// Path selection prefers peers we have built through recently, and
/// skips peers that are cooling down after a failure.
#[derive(Debug)]
pub(crate) struct PeerHistory {
    /// When we last extended a circuit through each peer.
    used: HashMap<PeerId, Instant>,
    /// Peers we won't pick again until the given time.
    cooldown: HashMap<PeerId, Instant>,
    /// How long a crypto failure keeps a peer out.
    crypto_cooldown: Duration,
}

impl PeerHistory {
    /// Make a new empty history.
    pub(crate) fn new(crypto_cooldown: Duration) -> Self {
        PeerHistory {
            used: HashMap::new(),
            cooldown: HashMap::new(),
            crypto_cooldown,
        }
    }

    /// Record that a hop through `id` completed.
    pub(crate) fn note_success(&mut self, id: &PeerId, now: Instant) {
        self.used.insert(*id, now);
    }

    /// Record that `id` failed a handshake or sent a cell that didn't
    /// authenticate.
    pub(crate) fn note_crypto_failure(&mut self, id: &PeerId, now: Instant) {
        self.cooldown.insert(*id, now + self.crypto_cooldown);
    }

    /// Record that we couldn't send to `id` at all.
    pub(crate) fn note_unreachable(&mut self, id: &PeerId, now: Instant) {
        self.cooldown.insert(*id, now + self.crypto_cooldown);
    }

    /// Return true if `id` may be used for new circuits.
    pub(crate) fn usable(&self, id: &PeerId, now: Instant) -> bool {
        match self.cooldown.get(id) {
            Some(until) => *until <= now,
            None => true,
        }
    }

    /// Return true if we built through `id` recently.
    pub(crate) fn recently_used(&self, id: &PeerId, now: Instant) -> bool {
        match self.used.get(id) {
            Some(when) => now.saturating_duration_since(*when) < RECENT_USE,
            None => false,
        }
    }

    /// Forget stale entries.
    pub(crate) fn expire(&mut self, now: Instant) {
        self.cooldown.retain(|_, until| *until > now);
        self.used
            .retain(|_, when| now.saturating_duration_since(*when) < RECENT_USE);
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn id(n: u8) -> PeerId {
        PeerId::from([n; 32])
    }

    #[test]
    fn flags() {
        let h = PeerHandle::new(id(1), "10.0.0.1:7759".parse().unwrap());
        let p = PeerInfo::new(h, Some(PeerFlags::RELAY | PeerFlags::EXIT));
        assert!(p.is_exit());
        assert!(p.has(PeerFlags::RELAY));
        assert!(!p.has(PeerFlags::SPEED_TESTED));
        let unknown = PeerInfo::new(h, None);
        assert!(!unknown.has(PeerFlags::empty()));
        assert_eq!(PeerFlags::from(0xff), PeerFlags::all());
    }

    #[test]
    fn cooldown() {
        let now = Instant::now();
        let mut h = PeerHistory::new(Duration::from_secs(60));
        assert!(h.usable(&id(1), now));
        h.note_crypto_failure(&id(1), now);
        assert!(!h.usable(&id(1), now + Duration::from_secs(30)));
        assert!(h.usable(&id(1), now + Duration::from_secs(61)));

        h.note_success(&id(2), now);
        assert!(h.recently_used(&id(2), now + Duration::from_secs(5)));
        assert!(!h.recently_used(&id(3), now));

        h.expire(now + Duration::from_secs(2 * 60 * 60));
        assert!(!h.recently_used(&id(2), now + Duration::from_secs(2 * 60 * 60)));
        assert!(h.cooldown.is_empty());
    }
}
