//! Persistent state for the tunnel overlay.
//!
//! The tunnel daemon keeps very little on disk: a cache of exit peers it
//! has seen, so that it can find exits again quickly after a restart.
//! State is a key-value store of serde objects.  Users construct a
//! store directly (for example with [`FsStateMgr::from_path()`]) and use
//! it through the [`StateMgr`] trait.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![warn(clippy::clone_on_ref_ptr)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::implicit_clone)]
#![warn(clippy::needless_borrow)]
#![deny(clippy::ref_option_ref)]

mod err;
mod fs;
mod testing;

pub use err::Error;
pub use fs::FsStateMgr;
pub use testing::TestingStateMgr;

use serde::{de::DeserializeOwned, Serialize};

/// Wrapper type for Results returned from this crate.
pub type Result<T> = std::result::Result<T, crate::Error>;

/// An object that can manage persistent state.
///
/// Values are stored under string keys and must serialize as a TOML
/// document (a struct or a map, not a bare list or string).
pub trait StateMgr: Clone + Send + Sync + 'static {
    /// Try to load the object with key `key` from the store.
    ///
    /// Return None if no such object exists.  An object that exists but
    /// can't be parsed is an error.
    fn load<D>(&self, key: &str) -> Result<Option<D>>
    where
        D: DeserializeOwned;
    /// Try to save `val` with key `key` in the store, replacing any
    /// previous value.
    fn store<S>(&self, key: &str, val: &S) -> Result<()>
    where
        S: Serialize;
    /// Return true if this is a read-write state manager.
    ///
    /// If it returns false, then attempts to `store` will fail with
    /// [`Error::NoLock`].
    fn can_store(&self) -> bool;
    /// Try to become a read-write state manager without blocking.
    ///
    /// Return `Ok(false)` if some other process holds the lock.
    fn try_lock(&self) -> Result<bool>;
}
