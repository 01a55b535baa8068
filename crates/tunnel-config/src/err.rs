//! Errors from loading configuration.

use std::path::PathBuf;
use thiserror::Error;

/// An error that occurred while assembling a configuration.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The built-in defaults could not be parsed.
    #[error("bad built-in configuration defaults: {0}")]
    Defaults(#[source] config::ConfigError),
    /// A configuration file was missing or could not be parsed.
    #[error("can't load configuration file {0:?}: {1}")]
    File(PathBuf, #[source] config::ConfigError),
    /// A command-line override was not valid.
    #[error("bad configuration option: {0}")]
    CmdLine(#[source] config::ConfigError),
}
