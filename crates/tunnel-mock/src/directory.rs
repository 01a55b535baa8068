//! An in-memory introduction point directory.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tunnel_service::{InfoHash, IntroDirectory, IntroPointInfo, Result};

/// A directory that keeps every announcement in memory, and never
/// forgets one.
#[derive(Debug, Default)]
pub struct MockDirectory {
    /// Introduction points by infohash, oldest first.
    records: Mutex<HashMap<InfoHash, Vec<IntroPointInfo>>>,
}

impl MockDirectory {
    /// Make a new empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the number of introduction points known for `infohash`.
    pub fn n_records(&self, infohash: &InfoHash) -> usize {
        self.records
            .lock()
            .expect("poisoned")
            .get(infohash)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl IntroDirectory for MockDirectory {
    async fn announce(&self, infohash: InfoHash, info: IntroPointInfo) -> Result<()> {
        let mut records = self.records.lock().expect("poisoned");
        let list = records.entry(infohash).or_default();
        list.retain(|i| i.intro != info.intro);
        list.push(info);
        Ok(())
    }

    async fn lookup(&self, infohash: InfoHash) -> Result<Vec<IntroPointInfo>> {
        let records = self.records.lock().expect("poisoned");
        Ok(records.get(&infohash).cloned().unwrap_or_default())
    }
}
