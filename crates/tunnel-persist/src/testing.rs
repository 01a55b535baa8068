//! An in-memory state manager, for tests and for running without a
//! state directory.

use crate::{Error, Result, StateMgr};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A [`StateMgr`] that keeps serialized values in memory.
///
/// Values still go through TOML, so a type that `FsStateMgr` would
/// refuse is refused here as well.
#[derive(Clone, Debug, Default)]
pub struct TestingStateMgr {
    /// Shared state.
    inner: Arc<Mutex<Inner>>,
}

/// Shared part of a `TestingStateMgr`.
#[derive(Debug, Default)]
struct Inner {
    /// Serialized values by key.
    entries: HashMap<String, String>,
    /// Whether `try_lock` has been called.
    locked: bool,
}

impl TestingStateMgr {
    /// Create a new empty, unlocked store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put raw text under `key`, bypassing serialization.
    pub fn set_raw(&self, key: &str, text: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.insert(key.to_string(), text.to_string());
        }
    }
}

impl StateMgr for TestingStateMgr {
    fn load<D>(&self, key: &str) -> Result<Option<D>>
    where
        D: DeserializeOwned,
    {
        let inner = self.inner.lock().map_err(|_| Error::NoLock)?;
        match inner.entries.get(key) {
            Some(s) => Ok(Some(toml::from_str(s)?)),
            None => Ok(None),
        }
    }

    fn store<S>(&self, key: &str, val: &S) -> Result<()>
    where
        S: Serialize,
    {
        let mut inner = self.inner.lock().map_err(|_| Error::NoLock)?;
        if !inner.locked {
            return Err(Error::NoLock);
        }
        let s = toml::ser::to_string(val)?;
        inner.entries.insert(key.to_string(), s);
        Ok(())
    }

    fn can_store(&self) -> bool {
        self.inner.lock().map(|i| i.locked).unwrap_or(false)
    }

    fn try_lock(&self) -> Result<bool> {
        let mut inner = self.inner.lock().map_err(|_| Error::NoLock)?;
        inner.locked = true;
        Ok(true)
    }
}
