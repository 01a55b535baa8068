//! A state manager that keeps TOML files in a directory.

use crate::{Error, Result, StateMgr};
use serde::{de::DeserializeOwned, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[cfg(target_family = "unix")]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

/// A [`StateMgr`] that stores each key as a TOML file on disk.
///
/// # Locking
///
/// A lock file decides who may write.  Any number of processes may
/// read, but only the one holding the lock may store.  Every
/// `FsStateMgr` starts out read-only; call [`StateMgr::try_lock`] to
/// take the lock.
///
/// # Keys
///
/// Keys are normalized to a filesystem-safe name, so two different keys
/// can collide.  Use short ascii keys chosen by the program, never by a
/// remote peer.
#[derive(Clone, Debug)]
pub struct FsStateMgr {
    /// Shared state.
    inner: Arc<Inner>,
}

/// Shared part of an `FsStateMgr`.
#[derive(Debug)]
struct Inner {
    /// Directory holding one file per key.
    statepath: PathBuf,
    /// Lock for exclusive write access.
    lockfile: Mutex<fslock::LockFile>,
}

impl FsStateMgr {
    /// Open (creating if needed) a store under `path`.
    ///
    /// Files go in `path/state`; the lock is `path/state.lock`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let statepath = path.join("state");
        let lockpath = path.join("state.lock");

        let mut builder = std::fs::DirBuilder::new();
        #[cfg(target_family = "unix")]
        builder.mode(0o700);
        builder.recursive(true).create(&statepath)?;

        let lockfile = Mutex::new(fslock::LockFile::open(&lockpath)?);
        debug!("opened state directory {:?}", statepath);

        Ok(FsStateMgr {
            inner: Arc::new(Inner {
                statepath,
                lockfile,
            }),
        })
    }

    /// Return the file that holds `key`.
    fn filename(&self, key: &str) -> PathBuf {
        self.inner
            .statepath
            .join(sanitize_filename::sanitize(key) + ".toml")
    }

    /// Return the directory holding the state files.
    pub fn path(&self) -> &Path {
        &self.inner.statepath
    }
}

impl StateMgr for FsStateMgr {
    fn can_store(&self) -> bool {
        self.inner
            .lockfile
            .lock()
            .map(|l| l.owns_lock())
            .unwrap_or(false)
    }

    fn try_lock(&self) -> Result<bool> {
        let mut lockfile = self.inner.lockfile.lock().map_err(|_| Error::NoLock)?;
        if lockfile.owns_lock() {
            return Ok(true);
        }
        let locked = lockfile.try_lock()?;
        if locked {
            info!("holding the state lock in {:?}", self.inner.statepath);
        }
        Ok(locked)
    }

    fn load<D>(&self, key: &str) -> Result<Option<D>>
    where
        D: DeserializeOwned,
    {
        let string = match std::fs::read_to_string(self.filename(key)) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(toml::from_str(&string)?))
    }

    fn store<S>(&self, key: &str, val: &S) -> Result<()>
    where
        S: Serialize,
    {
        if !self.can_store() {
            return Err(Error::NoLock);
        }

        let fname = self.filename(key);
        let output = toml::ser::to_string(val)?;

        // Write then rename, so that readers see the old file or the new
        // one and never half of either.
        let fname_tmp = fname.with_extension("tmp");
        {
            let mut opts = std::fs::OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            #[cfg(target_family = "unix")]
            opts.mode(0o600);
            let mut f = opts.open(&fname_tmp)?;
            f.write_all(output.as_bytes())?;
            f.sync_all()?;
        }
        std::fs::rename(fname_tmp, fname)?;

        Ok(())
    }
}
