//! Error type for the state store.

use std::sync::Arc;

/// An error returned from a persistent state manager.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An IO error occurred.
    #[error("IO error: {0}")]
    IoError(#[source] Arc<std::io::Error>),

    /// Tried to save without holding the lock.
    #[error("Storage not locked")]
    NoLock,

    /// Unable to serialize data as TOML.
    #[error("Toml serialization error: {0}")]
    TomlWriteError(#[from] toml::ser::Error),

    /// Unable to deserialize data from TOML.
    #[error("Toml deserialization error: {0}")]
    TomlReadError(#[from] toml::de::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::IoError(Arc::new(e))
    }
}
