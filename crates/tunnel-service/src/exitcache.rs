//! A persistent list of exits we have seen, so that a restarted peer
//! can find exits before the community has gossiped them again.

use crate::peer::{PeerFlags, PeerInfo};
use crate::Result;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::SystemTime;
use tracing::{debug, warn};
use tunnel_llcrypto::pk::PeerId;
use tunnel_persist::StateMgr;
use tunnel_proto::peer::PeerHandle;

/// The key the cache is stored under.
const CACHE_KEY: &str = "exit_cache";

/// Most exits we remember.
pub(crate) const MAX_CACHED_EXITS: usize = 64;

/// One exit in the cache.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct CachedExit {
    /// Peer id, as hex.
    id: String,
    /// Where it was.
    addr: SocketAddr,
    /// The flags it advertised.
    flags: u8,
    /// When we last saw it.
    #[serde(with = "humantime_serde")]
    last_seen: SystemTime,
}

/// The stored form of the cache.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    /// The exits, most recently seen first.
    #[serde(default)]
    exits: Vec<CachedExit>,
}

/// The exit cache, and the store it lives in.
#[derive(Debug)]
pub(crate) struct ExitCache<S: StateMgr> {
    /// Where the cache is kept.
    store: S,
    /// What we know.
    file: CacheFile,
}

impl<S: StateMgr> ExitCache<S> {
    /// Load the cache from `store`.
    ///
    /// A cache that can't be read is discarded.
    pub(crate) fn load(store: S) -> Self {
        let file = match store.load::<CacheFile>(CACHE_KEY) {
            Ok(Some(f)) => f,
            Ok(None) => CacheFile::default(),
            Err(e) => {
                warn!("discarding unreadable exit cache: {}", e);
                CacheFile::default()
            }
        };
        debug!("loaded {} cached exits", file.exits.len());
        ExitCache { store, file }
    }

    /// Return the exits in the cache, as peers to contact.
    pub(crate) fn peers(&self) -> Vec<PeerInfo> {
        self.file
            .exits
            .iter()
            .filter_map(|e| {
                let id: PeerId = e.id.parse().ok()?;
                Some(PeerInfo::new(
                    PeerHandle::new(id, e.addr),
                    Some(PeerFlags::from(e.flags)),
                ))
            })
            .collect()
    }

    /// Remember the exits among `peers`, seen at `now`.
    pub(crate) fn note(&mut self, peers: &[PeerInfo], now: SystemTime) {
        for p in peers.iter().filter(|p| p.is_exit()) {
            let id = p.id().to_string();
            self.file.exits.retain(|e| e.id != id);
            self.file.exits.push(CachedExit {
                id,
                addr: p.handle.addr(),
                flags: p.flags.map(|f| f.bits()).unwrap_or(0),
                last_seen: now,
            });
        }
        self.file
            .exits
            .sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        self.file.exits.truncate(MAX_CACHED_EXITS);
    }

    /// Write the cache to its store, if we may.
    pub(crate) fn save(&self) -> Result<()> {
        if !self.store.can_store() {
            debug!("not storing exit cache: another process holds the lock");
            return Ok(());
        }
        self.store.store(CACHE_KEY, &self.file)?;
        Ok(())
    }
}

/// Something that can record and save the peers we've seen.
///
/// This lets the service hold an exit cache without being generic over
/// its store.
pub(crate) trait PeerCache: Send + Sync {
    /// Record the exits among `peers` and save.
    fn note_and_save(&self, peers: &[PeerInfo]) -> Result<()>;
}

impl<S: StateMgr> PeerCache for std::sync::Mutex<ExitCache<S>> {
    fn note_and_save(&self, peers: &[PeerInfo]) -> Result<()> {
        let mut cache = self
            .lock()
            .map_err(|_| crate::Error::Internal("exit cache lock poisoned".into()))?;
        cache.note(peers, SystemTime::now());
        cache.save()
    }
}
