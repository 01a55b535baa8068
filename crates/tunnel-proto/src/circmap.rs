//! Types and code to map (peer, circuit ID) pairs to local entries.
//!
//! Circuit IDs only mean something on the link between two peers.  So
//! every entry is keyed by the peer on the other side of the link and
//! the ID used there.  Both peers on a link allocate IDs, so each
//! allocates from its own half of the ID space; which half is decided
//! by comparing the two peer identities.

use crate::{Error, Result};
use tunnel_cell::cell::CircId;
use tunnel_llcrypto::pk::PeerId;

use rand::distributions::Distribution;
use rand::Rng;
use std::collections::{hash_map::Entry, HashMap};
use tracing::{debug, warn};

/// Which group of circuit IDs are we allowed to allocate on a link?
///
/// The peer with the lower identity uses High circuit ids; the other
/// peer uses Low circuit ids.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CircIdRange {
    /// Only use circuit IDs with the MSB cleared.
    Low,
    /// Only use circuit IDs with the MSB set.
    High,
}

impl CircIdRange {
    /// Return the range that `me` allocates from on its link to `them`.
    pub fn for_link(me: &PeerId, them: &PeerId) -> Self {
        if me < them {
            CircIdRange::High
        } else {
            CircIdRange::Low
        }
    }

    /// Return true if `id` is a valid ID in this range.
    pub fn contains(&self, id: CircId) -> bool {
        let v: u32 = id.into();
        v != 0
            && match self {
                CircIdRange::Low => v & 0x8000_0000 == 0,
                CircIdRange::High => v & 0x8000_0000 != 0,
            }
    }
}

impl Distribution<CircId> for CircIdRange {
    /// Return a random circuit ID in the appropriate range.
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> CircId {
        loop {
            // Force the high bit of v to the appropriate value.
            let v: u32 = match self {
                CircIdRange::Low => rng.gen::<u32>() & 0x7fff_ffff,
                CircIdRange::High => rng.gen::<u32>() | 0x8000_0000,
            };
            // zero is not a valid circuit ID
            if v != 0 {
                return v.into();
            }
        }
    }
}

/// Key for a [`CircMap`] entry: the peer on the other end of the link,
/// and the circuit ID used on that link.
pub type LinkKey = (PeerId, CircId);

/// A map from link keys to local entries.
///
/// One of these is shared by all the circuits a peer takes part in,
/// whatever the role, so that an incoming cell can be matched to
/// exactly one entry.
#[derive(Debug)]
pub struct CircMap<T> {
    /// Our own identity, to decide on ID ranges.
    me: PeerId,
    /// Map from link keys to entries
    m: HashMap<LinkKey, T>,
}

impl<T> CircMap<T> {
    /// Make a new empty CircMap for a peer with identity `me`.
    pub fn new(me: PeerId) -> Self {
        CircMap {
            me,
            m: HashMap::new(),
        }
    }

    /// Allocate a fresh circuit ID on the link to `peer`, and add `ent`
    /// under it.
    ///
    /// On success return the allocated circuit ID.
    pub fn add_ent<R: Rng>(&mut self, rng: &mut R, peer: &PeerId, ent: T) -> Result<CircId> {
        /// How many times do we probe for a random circuit ID before
        /// we assume that the range is fully populated?
        const N_ATTEMPTS: usize = 16;
        let range = CircIdRange::for_link(&self.me, peer);
        for id in range.sample_iter(rng).take(N_ATTEMPTS) {
            if let Entry::Vacant(v) = self.m.entry((*peer, id)) {
                v.insert(ent);
                return Ok(id);
            }
        }
        warn!("no free circuit id on link to {} after {} tries", peer, N_ATTEMPTS);
        Err(Error::IdRangeFull)
    }

    /// Add `ent` under an ID that `peer` chose.
    ///
    /// Fails if the ID is in our half of the space, or already in use.
    pub fn add_remote_ent(&mut self, peer: &PeerId, id: CircId, ent: T) -> Result<()> {
        let theirs = CircIdRange::for_link(peer, &self.me);
        if !theirs.contains(id) {
            debug!("{} used {} from our half of the id space", peer, id);
            return Err(Error::BadCircId(id.into()));
        }
        match self.m.entry((*peer, id)) {
            Entry::Vacant(v) => {
                v.insert(ent);
                Ok(())
            }
            Entry::Occupied(_) => Err(Error::BadCircId(id.into())),
        }
    }

    /// Return the entry for `(peer, id)` in this map, if any.
    pub fn get(&self, peer: &PeerId, id: CircId) -> Option<&T> {
        self.m.get(&(*peer, id))
    }

    /// Return a mutable reference to the entry for `(peer, id)`, if any.
    pub fn get_mut(&mut self, peer: &PeerId, id: CircId) -> Option<&mut T> {
        self.m.get_mut(&(*peer, id))
    }

    /// Replace the entry for `(peer, id)`, returning the old one.
    pub fn replace(&mut self, peer: &PeerId, id: CircId, ent: T) -> Option<T> {
        self.m.insert((*peer, id), ent)
    }

    /// Remove the entry for `(peer, id)`, if any.
    pub fn remove(&mut self, peer: &PeerId, id: CircId) -> Option<T> {
        self.m.remove(&(*peer, id))
    }

    /// Return every circuit ID in use on the link to `peer`.
    pub fn ids_for_peer(&self, peer: &PeerId) -> Vec<CircId> {
        self.m
            .keys()
            .filter(|(p, _)| p == peer)
            .map(|(_, id)| *id)
            .collect()
    }

    /// Return the number of entries in this map.
    pub fn len(&self) -> usize {
        self.m.len()
    }

    /// Return true if this map is empty.
    pub fn is_empty(&self) -> bool {
        self.m.is_empty()
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&LinkKey, &T)> {
        self.m.iter()
    }
}
