//! Records for circuits that this peer originates.
//!
//! An [`OriginCirc`] holds everything the originator knows about one of
//! its circuits: the hops, the keys shared with each, the state of the
//! extension process, and traffic counters.  It does no IO; the
//! builder and the router call into it as cells come and go.

use crate::circmap::LinkKey;
use crate::crypto::cell::{ClientCrypt, HopKeys, HopNum};
use crate::peer::PeerHandle;
use crate::{Error, Result};
use tunnel_cell::cell::CircId;
use tunnel_llcrypto::pk::PeerId;

use rand_core::{CryptoRng, RngCore};
use std::fmt::{self, Display};
use std::time::{Duration, Instant};

/// Identifier for a circuit for logging purposes.
///
/// The circuit ID is a large random number that only means something
/// on one link, and that can be reused over time.  This is less likely
/// to repeat.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct UniqId(u64);

impl UniqId {
    /// Construct a new circuit UniqId from a counter value.
    pub fn new(n: u64) -> Self {
        UniqId(n)
    }
}

impl Display for UniqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Circ {}", self.0)
    }
}

/// The state of an originated circuit.
///
/// ```text
/// New -> Extending(1) -> ... -> Extending(h) -> Ready -> Closing -> Closed
/// ```
///
/// Any non-terminal state can become `Broken`.  `Closed` and `Broken`
/// are terminal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CircState {
    /// Nothing has been sent yet.
    New,
    /// Waiting for the handshake with the hop at this (1-based) position.
    Extending(u8),
    /// All hops are in place; the circuit carries traffic.
    Ready,
    /// We have decided to close the circuit.
    Closing,
    /// The circuit is closed.
    Closed,
    /// The circuit failed.
    Broken,
}

impl CircState {
    /// Return true if this state can never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CircState::Closed | CircState::Broken)
    }
}

impl Display for CircState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircState::New => write!(f, "new"),
            CircState::Extending(i) => write!(f, "extending({})", i),
            CircState::Ready => write!(f, "ready"),
            CircState::Closing => write!(f, "closing"),
            CircState::Closed => write!(f, "closed"),
            CircState::Broken => write!(f, "broken"),
        }
    }
}

/// One hop of an originated circuit.
#[derive(Clone, Debug)]
pub struct HopInfo {
    /// The peer at this hop.
    peer: PeerHandle,
    /// When the handshake with this hop finished.
    extended_at: Instant,
}

impl HopInfo {
    /// Return the peer at this hop.
    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }
    /// Return when this hop was added.
    pub fn extended_at(&self) -> Instant {
        self.extended_at
    }
}

/// A circuit that this peer originates.
#[derive(Debug)]
pub struct OriginCirc {
    /// Logging identifier.
    unique_id: UniqId,
    /// The circuit ID on the link to the first hop.
    id: CircId,
    /// Hops that have finished their handshake, first hop first.
    hops: Vec<HopInfo>,
    /// The hop we are currently extending to, if any.
    pending: Option<PeerHandle>,
    /// Keys for every hop in `hops`, in the same order.
    crypto: ClientCrypt,
    /// True if the last hop must be able to exit.
    exit: bool,
    /// How many hops this circuit will have when it is ready.
    target_hops: u8,
    /// Current state.
    state: CircState,
    /// Payload bytes sent on this circuit.
    bytes_up: u64,
    /// Payload bytes received on this circuit.
    bytes_down: u64,
    /// When the circuit record was made.
    created: Instant,
    /// When traffic last went over this circuit.
    last_activity: Instant,
}

impl OriginCirc {
    /// Make a record for a new circuit that will use `id` on the link to
    /// its first hop.
    pub fn new(unique_id: UniqId, id: CircId, target_hops: u8, exit: bool, now: Instant) -> Self {
        OriginCirc {
            unique_id,
            id,
            hops: Vec::new(),
            pending: None,
            crypto: ClientCrypt::new(),
            exit,
            target_hops,
            state: CircState::New,
            bytes_up: 0,
            bytes_down: 0,
            created: now,
            last_activity: now,
        }
    }

    /// Return the logging identifier for this circuit.
    pub fn unique_id(&self) -> UniqId {
        self.unique_id
    }
    /// Return the circuit ID on the link to the first hop.
    pub fn id(&self) -> CircId {
        self.id
    }
    /// Return the key that cells for this circuit arrive under, if we
    /// know the first hop yet.
    pub fn link_key(&self) -> Option<LinkKey> {
        self.first_hop().map(|p| (*p.id(), self.id))
    }
    /// Return the current state.
    pub fn state(&self) -> CircState {
        self.state
    }
    /// Return true if this circuit must end at an exit.
    pub fn wants_exit(&self) -> bool {
        self.exit
    }
    /// Return the number of hops this circuit will have.
    pub fn target_hops(&self) -> u8 {
        self.target_hops
    }
    /// Return the hops that are in place.
    pub fn hops(&self) -> &[HopInfo] {
        &self.hops[..]
    }
    /// Return the number of session keys we hold for this circuit.
    pub fn n_keys(&self) -> usize {
        self.crypto.n_layers()
    }
    /// Return the peer at the first hop: either one that has finished
    /// its handshake, or the one we are waiting on.
    pub fn first_hop(&self) -> Option<&PeerHandle> {
        self.hops.first().map(HopInfo::peer).or(self.pending.as_ref())
    }
    /// Return the last hop that has finished its handshake.
    pub fn last_hop(&self) -> Option<&PeerHandle> {
        self.hops.last().map(HopInfo::peer)
    }
    /// Return the identities of every peer on the circuit, including
    /// one we are extending to.
    pub fn path_ids(&self) -> Vec<PeerId> {
        self.hops
            .iter()
            .map(|h| *h.peer.id())
            .chain(self.pending.iter().map(|p| *p.id()))
            .collect()
    }
    /// Return true if `id` is on this circuit.
    pub fn contains_peer(&self, id: &PeerId) -> bool {
        self.path_ids().iter().any(|p| p == id)
    }
    /// Return true if this circuit can carry traffic.
    pub fn is_ready(&self) -> bool {
        self.state == CircState::Ready
    }

    /// Start extending to `peer`.
    ///
    /// Fails if a handshake is already outstanding, if the circuit is
    /// long enough, or if `peer` is already on the circuit.
    pub fn begin_extend(&mut self, peer: PeerHandle) -> Result<()> {
        let next = match self.state {
            CircState::New => 1,
            CircState::Extending(i) if self.pending.is_none() && usize::from(i) == self.hops.len() => {
                i + 1
            }
            _ => return Err(Error::BadTransition("not ready to extend")),
        };
        if next > self.target_hops {
            return Err(Error::BadTransition("circuit already long enough"));
        }
        if self.contains_peer(peer.id()) {
            return Err(Error::BadTransition("peer already on circuit"));
        }
        self.pending = Some(peer);
        self.state = CircState::Extending(next);
        Ok(())
    }

    /// Record that the outstanding handshake finished with `keys`.
    ///
    /// Returns true if the circuit is now ready.
    pub fn complete_hop(&mut self, keys: HopKeys, now: Instant) -> Result<bool> {
        let peer = match (self.state, self.pending.take()) {
            (CircState::Extending(_), Some(peer)) => peer,
            (_, pending) => {
                self.pending = pending;
                return Err(Error::BadTransition("no handshake outstanding"));
            }
        };
        self.hops.push(HopInfo {
            peer,
            extended_at: now,
        });
        self.crypto.add_layer(keys);
        self.last_activity = now;
        if self.hops.len() == usize::from(self.target_hops) {
            self.state = CircState::Ready;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Mark this circuit as closing.  Returns false if it was already
    /// closing or finished.
    pub fn start_close(&mut self) -> bool {
        match self.state {
            CircState::Closing | CircState::Closed | CircState::Broken => false,
            _ => {
                self.state = CircState::Closing;
                true
            }
        }
    }
    /// Mark this circuit as closed.  Returns false if it was already
    /// in a terminal state.
    pub fn mark_closed(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = CircState::Closed;
        true
    }
    /// Mark this circuit as broken.  Returns false if it was already in
    /// a terminal state.
    pub fn mark_broken(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = CircState::Broken;
        self.pending = None;
        true
    }

    /// Seal `body` for the last hop that has finished its handshake.
    pub fn encrypt<R: RngCore + CryptoRng>(&self, rng: &mut R, body: &[u8]) -> Result<Vec<u8>> {
        let n = self.crypto.n_layers();
        if n == 0 {
            return Err(Error::NoSuchHop);
        }
        // n <= MAX_HOPS, so this fits.
        self.crypto.encrypt(rng, body, HopNum::from(n as u8 - 1))
    }
    /// Remove every layer from a body sent by the last hop.
    pub fn decrypt(&self, body: &[u8]) -> Result<Vec<u8>> {
        self.crypto.decrypt(body)
    }
    /// Return the largest body we can send to the last hop.
    pub fn max_payload(&self) -> usize {
        self.crypto.max_plaintext()
    }

    /// Count `n` payload bytes sent.
    pub fn record_sent(&mut self, n: usize, now: Instant) {
        self.bytes_up += n as u64;
        self.last_activity = now;
    }
    /// Count `n` payload bytes received.
    pub fn record_received(&mut self, n: usize, now: Instant) {
        self.bytes_down += n as u64;
        self.last_activity = now;
    }
    /// Return (bytes up, bytes down).
    pub fn byte_counts(&self) -> (u64, u64) {
        (self.bytes_up, self.bytes_down)
    }
    /// Return when this record was made.
    pub fn created(&self) -> Instant {
        self.created
    }
    /// Return how long this circuit has gone without traffic.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::crypto::cell::HOP_KEY_LEN;

    fn peer(n: u8) -> PeerHandle {
        PeerHandle::new(PeerId::from([n; 32]), format!("10.0.0.{}:7759", n).parse().unwrap())
    }

    fn keys(n: u8) -> HopKeys {
        HopKeys::from_seed(&[n; HOP_KEY_LEN][..]).unwrap()
    }

    #[test]
    fn lifecycle() {
        let now = Instant::now();
        let mut c = OriginCirc::new(UniqId::new(1), 99.into(), 3, true, now);
        assert_eq!(c.state(), CircState::New);
        assert!(c.first_hop().is_none());

        c.begin_extend(peer(1)).unwrap();
        assert_eq!(c.state(), CircState::Extending(1));
        assert_eq!(c.first_hop(), Some(&peer(1)));
        // only one handshake at a time
        assert!(c.begin_extend(peer(2)).is_err());
        assert!(!c.complete_hop(keys(1), now).unwrap());

        c.begin_extend(peer(2)).unwrap();
        assert_eq!(c.state(), CircState::Extending(2));
        assert!(!c.complete_hop(keys(2), now).unwrap());
        c.begin_extend(peer(3)).unwrap();
        assert!(c.complete_hop(keys(3), now).unwrap());

        assert!(c.is_ready());
        assert_eq!(c.n_keys(), 3);
        assert_eq!(c.hops().len(), 3);
        assert_eq!(c.last_hop(), Some(&peer(3)));
        assert_eq!(c.link_key(), Some((*peer(1).id(), 99.into())));
        assert!(c.begin_extend(peer(4)).is_err());

        assert!(c.start_close());
        assert!(!c.start_close());
        assert!(c.mark_closed());
        // Closing twice is a no-op.
        assert!(!c.mark_closed());
        assert!(!c.mark_broken());
        assert_eq!(c.state(), CircState::Closed);
    }

    #[test]
    fn no_repeated_peer() {
        let now = Instant::now();
        let mut c = OriginCirc::new(UniqId::new(2), 5.into(), 3, false, now);
        c.begin_extend(peer(1)).unwrap();
        c.complete_hop(keys(1), now).unwrap();
        assert_eq!(
            c.begin_extend(peer(1)),
            Err(Error::BadTransition("peer already on circuit"))
        );
        assert!(c.complete_hop(keys(2), now).is_err());
        assert_eq!(c.path_ids(), vec![*peer(1).id()]);
    }

    #[test]
    fn broken_is_terminal() {
        let now = Instant::now();
        let mut c = OriginCirc::new(UniqId::new(3), 5.into(), 2, false, now);
        c.begin_extend(peer(1)).unwrap();
        assert!(c.mark_broken());
        assert!(c.state().is_terminal());
        assert!(c.begin_extend(peer(2)).is_err());
        assert!(!c.start_close());
        assert_eq!(c.state().to_string(), "broken");
    }

    #[test]
    fn traffic() {
        let now = Instant::now();
        let mut c = OriginCirc::new(UniqId::new(4), 5.into(), 1, true, now);
        assert_eq!(c.encrypt(&mut rand::thread_rng(), b"x").err(), Some(Error::NoSuchHop));
        c.begin_extend(peer(1)).unwrap();
        c.complete_hop(keys(1), now).unwrap();
        let sealed = c.encrypt(&mut rand::thread_rng(), b"hello").unwrap();
        assert_eq!(keys(1).decrypt_outbound(&sealed[..]).unwrap(), b"hello");

        let later = now + Duration::from_secs(5);
        c.record_sent(10, later);
        c.record_received(20, later);
        assert_eq!(c.byte_counts(), (10, 20));
        assert_eq!(c.idle_for(later + Duration::from_secs(1)), Duration::from_secs(1));
        assert_eq!(c.max_payload(), crate::crypto::cell::max_plaintext(1));
        assert_eq!(UniqId::new(4).to_string(), "Circ 4");
    }
}
