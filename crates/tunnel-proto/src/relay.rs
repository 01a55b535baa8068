//! Relay entries: blind forwarding between two circuit halves.
//!
//! When this peer extends a circuit on behalf of somebody else, it
//! pairs the link the circuit came in on with the link it went out on.
//! From then on, a body arriving on either side is forwarded to the
//! other after one crypto step, and is never parsed here.
//!
//! A rendezvous point uses the same machinery to splice two circuits
//! that both end at it.  Then both sides carry a key: a body from one
//! side loses that side's layer and gains the other side's.

use crate::crypto::cell::HopKeys;
use crate::peer::PeerHandle;
use crate::{Error, Result};
use tunnel_cell::cell::{CircId, CELL_BODY_LEN};

use rand_core::{CryptoRng, RngCore};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::trace;

/// One side of a relay entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    /// The side toward the originator of the circuit (for a splice,
    /// the client's circuit).
    Origin,
    /// The side away from the originator (for a splice, the
    /// service's circuit).
    Away,
}

impl Side {
    /// Return the other side.
    pub fn other(self) -> Side {
        match self {
            Side::Origin => Side::Away,
            Side::Away => Side::Origin,
        }
    }
}

/// One end of a relay entry: where cells go, and the key shared with
/// the originator on that side, if we share one.
#[derive(Debug)]
pub struct RelaySide {
    /// The peer on this side.
    peer: PeerHandle,
    /// The circuit ID on the link to that peer.
    circ: CircId,
    /// The key we share with the originator on this side.
    keys: Option<HopKeys>,
}

impl RelaySide {
    /// Return the peer on this side.
    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }
    /// Return the circuit ID used on this side.
    pub fn circ(&self) -> CircId {
        self.circ
    }
}

/// A local pairing of two (peer, circuit ID) endpoints.
#[derive(Debug)]
pub struct RelayEntry {
    /// The side toward the originator.
    origin: RelaySide,
    /// The side away from the originator.
    away: RelaySide,
    /// When this entry was installed.
    created: Instant,
    /// When the entry last forwarded anything.
    last_activity: Instant,
    /// Bytes forwarded from the origin side to the away side.
    bytes_out: u64,
    /// Bytes forwarded from the away side to the origin side.
    bytes_in: u64,
}

impl RelayEntry {
    /// Make an entry for an ordinary relay hop.
    ///
    /// `keys` are the keys we agreed on with the originator when it
    /// created its circuit through `origin`.
    pub fn new_forward(
        origin: (PeerHandle, CircId),
        keys: HopKeys,
        away: (PeerHandle, CircId),
        now: Instant,
    ) -> Self {
        Self::new(
            RelaySide {
                peer: origin.0,
                circ: origin.1,
                keys: Some(keys),
            },
            RelaySide {
                peer: away.0,
                circ: away.1,
                keys: None,
            },
            now,
        )
    }

    /// Make an entry that splices a client's circuit to a service's
    /// circuit at a rendezvous point.
    pub fn new_splice(
        client: (PeerHandle, CircId, HopKeys),
        service: (PeerHandle, CircId, HopKeys),
        now: Instant,
    ) -> Self {
        Self::new(
            RelaySide {
                peer: client.0,
                circ: client.1,
                keys: Some(client.2),
            },
            RelaySide {
                peer: service.0,
                circ: service.1,
                keys: Some(service.2),
            },
            now,
        )
    }

    /// Helper: make a new entry from its sides.
    fn new(origin: RelaySide, away: RelaySide, now: Instant) -> Self {
        RelayEntry {
            origin,
            away,
            created: now,
            last_activity: now,
            bytes_out: 0,
            bytes_in: 0,
        }
    }

    /// Return the requested side of this entry.
    pub fn side(&self, side: Side) -> &RelaySide {
        match side {
            Side::Origin => &self.origin,
            Side::Away => &self.away,
        }
    }

    /// Return true if this entry splices two circuits together.
    pub fn is_splice(&self) -> bool {
        self.away.keys.is_some()
    }

    /// Forward a body that arrived on side `from`.
    ///
    /// Returns the peer and circuit ID to send it on, and the body to
    /// send.  Fails if the body doesn't authenticate, or would no longer
    /// fit in a cell.
    pub fn relay<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        from: Side,
        body: &[u8],
        now: Instant,
    ) -> Result<(PeerHandle, CircId, Vec<u8>)> {
        let (src, dst) = match from {
            Side::Origin => (&self.origin, &self.away),
            Side::Away => (&self.away, &self.origin),
        };
        let mut cur = match &src.keys {
            Some(k) => k.decrypt_outbound(body)?,
            None => body.to_vec(),
        };
        if let Some(k) = &dst.keys {
            cur = k.encrypt_inbound(rng, &cur[..])?;
        }
        if cur.len() > CELL_BODY_LEN {
            return Err(Error::TooLong(cur.len()));
        }
        let out = (dst.peer, dst.circ);
        match from {
            Side::Origin => self.bytes_out += cur.len() as u64,
            Side::Away => self.bytes_in += cur.len() as u64,
        }
        self.last_activity = now;
        Ok((out.0, out.1, cur))
    }

    /// Return (bytes forwarded away from the originator, bytes forwarded
    /// toward it).
    pub fn byte_counts(&self) -> (u64, u64) {
        (self.bytes_out, self.bytes_in)
    }
    /// Return when this entry was installed.
    pub fn created(&self) -> Instant {
        self.created
    }
    /// Return how long this entry has gone without traffic.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

/// Identifier for a relay entry within a [`RelayTable`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RelayId(u64);

impl std::fmt::Display for RelayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Relay {}", self.0)
    }
}

/// All the relay entries on this peer.
#[derive(Debug, Default)]
pub struct RelayTable {
    /// The entries.
    entries: HashMap<RelayId, RelayEntry>,
    /// Next identifier to hand out.
    next_id: u64,
}

impl RelayTable {
    /// Make a new empty table.
    pub fn new() -> Self {
        Self::default()
    }
    /// Add an entry, returning its identifier.
    pub fn insert(&mut self, ent: RelayEntry) -> RelayId {
        let id = RelayId(self.next_id);
        self.next_id += 1;
        trace!("{}: {} <-> {}", id, ent.origin.peer, ent.away.peer);
        self.entries.insert(id, ent);
        id
    }
    /// Return the entry with identifier `id`.
    pub fn get(&self, id: RelayId) -> Option<&RelayEntry> {
        self.entries.get(&id)
    }
    /// Return a mutable reference to the entry with identifier `id`.
    pub fn get_mut(&mut self, id: RelayId) -> Option<&mut RelayEntry> {
        self.entries.get_mut(&id)
    }
    /// Remove the entry with identifier `id`.
    pub fn remove(&mut self, id: RelayId) -> Option<RelayEntry> {
        self.entries.remove(&id)
    }
    /// Return the identifiers of every entry that has been idle for at
    /// least `timeout`.
    pub fn idle_entries(&self, now: Instant, timeout: Duration) -> Vec<RelayId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.idle_for(now) >= timeout)
            .map(|(id, _)| *id)
            .collect()
    }
    /// Return the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    /// Return true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::crypto::cell::{ClientCrypt, HOP_KEY_LEN};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tunnel_llcrypto::pk::PeerId;

    fn peer(n: u8) -> PeerHandle {
        PeerHandle::new(PeerId::from([n; 32]), format!("10.1.0.{}:1", n).parse().unwrap())
    }

    fn keys(n: u8) -> HopKeys {
        HopKeys::from_seed(&[n; HOP_KEY_LEN][..]).unwrap()
    }

    #[test]
    fn forward_both_ways() {
        let mut rng = StdRng::seed_from_u64(77);
        let now = Instant::now();
        // Originator O -> us (hop 0) -> peer 3 (hop 1).
        let mut cc = ClientCrypt::new();
        cc.add_layer(keys(1));
        cc.add_layer(keys(2));
        let hop1 = keys(2);

        let mut e = RelayEntry::new_forward((peer(9), 10.into()), keys(1), (peer(3), 20.into()), now);
        assert!(!e.is_splice());

        let body = cc.encrypt(&mut rng, b"payload", 1.into()).unwrap();
        let (to, circ, out) = e.relay(&mut rng, Side::Origin, &body[..], now).unwrap();
        assert_eq!(to, peer(3));
        assert_eq!(circ, 20.into());
        assert_eq!(hop1.decrypt_outbound(&out[..]).unwrap(), b"payload");

        let back = hop1.encrypt_inbound(&mut rng, b"reply").unwrap();
        let (to, circ, out) = e.relay(&mut rng, Side::Away, &back[..], now).unwrap();
        assert_eq!(to, peer(9));
        assert_eq!(circ, 10.into());
        assert_eq!(cc.decrypt(&out[..]).unwrap(), b"reply");

        // Garbage from the origin side doesn't authenticate.
        assert_eq!(
            e.relay(&mut rng, Side::Origin, &[0; 64], now).err(),
            Some(Error::BadCellAuth)
        );
        let (o, i) = e.byte_counts();
        assert!(o > 0 && i > 0);
    }

    #[test]
    fn splice() {
        let mut rng = StdRng::seed_from_u64(78);
        let now = Instant::now();
        // The client and the service both end their circuits at us;
        // each shares one key with us.
        let client = keys(5);
        let service = keys(6);
        let mut e = RelayEntry::new_splice(
            (peer(1), 100.into(), keys(5)),
            (peer(2), 200.into(), keys(6)),
            now,
        );
        assert!(e.is_splice());

        let c2s = client.encrypt_outbound(&mut rng, b"to service").unwrap();
        let (to, _, out) = e.relay(&mut rng, Side::Origin, &c2s[..], now).unwrap();
        assert_eq!(to, peer(2));
        assert_eq!(service.decrypt_inbound(&out[..]).unwrap(), b"to service");

        let s2c = service.encrypt_outbound(&mut rng, b"to client").unwrap();
        let (to, _, out) = e.relay(&mut rng, Side::Away, &s2c[..], now).unwrap();
        assert_eq!(to, peer(1));
        assert_eq!(client.decrypt_inbound(&out[..]).unwrap(), b"to client");
    }

    #[test]
    fn too_long_to_rewrap() {
        let mut rng = StdRng::seed_from_u64(79);
        let now = Instant::now();
        let mut e = RelayEntry::new_forward((peer(1), 1.into()), keys(1), (peer(2), 2.into()), now);
        let full = vec![0_u8; CELL_BODY_LEN];
        assert_eq!(
            e.relay(&mut rng, Side::Away, &full[..], now).err(),
            Some(Error::TooLong(CELL_BODY_LEN + 28))
        );
    }

    #[test]
    fn table() {
        let now = Instant::now();
        let mut t = RelayTable::new();
        let a = t.insert(RelayEntry::new_forward((peer(1), 1.into()), keys(1), (peer(2), 2.into()), now));
        let b = t.insert(RelayEntry::new_forward((peer(3), 3.into()), keys(3), (peer(4), 4.into()), now));
        assert_ne!(a, b);
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(a).unwrap().side(Side::Away).circ(), 2.into());
        let later = now + Duration::from_secs(100);
        assert_eq!(t.idle_entries(later, Duration::from_secs(200)).len(), 0);
        assert_eq!(t.idle_entries(later, Duration::from_secs(50)).len(), 2);
        assert!(t.remove(a).is_some());
        assert!(t.remove(a).is_none());
        assert_eq!(t.len(), 1);
    }
}
