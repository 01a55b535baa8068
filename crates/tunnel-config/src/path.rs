//! Paths written in configuration files.

use std::path::{Path, PathBuf};

use directories::{BaseDirs, ProjectDirs};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// A path in a configuration file.
///
/// A leading `~` expands to the user's home directory.  These variables
/// expand to per-application directories chosen by the `directories`
/// crate for the current platform:
///
///   * `APP_CACHE`: cache directory (the default home of the state
///     directory).
///   * `APP_CONFIG`: configuration directory.
///   * `APP_LOCAL_DATA`: local data directory (the default home of the
///     key file).
///   * `USER_HOME`: the user's home directory.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct CfgPath(String);

/// An error from expanding a [`CfgPath`].
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum PathError {
    /// The path named a variable we don't know.
    #[error("unrecognized variable")]
    UnknownVar,
    /// The platform gave us no per-application directories.
    #[error("can't construct project directories")]
    NoProjectDirs,
    /// The platform gave us no home directory.
    #[error("can't construct base directories")]
    NoBaseDirs,
    /// A directory name was not UTF-8.
    #[error("can't convert to UTF-8")]
    BadUtf8,
}

impl CfgPath {
    /// Create a new configuration path.
    pub fn new<S: Into<String>>(s: S) -> Self {
        CfgPath(s.into())
    }

    /// Return the path on disk designated by this path.
    pub fn path(&self) -> Result<PathBuf, shellexpand::LookupError<PathError>> {
        Ok(shellexpand::full_with_context(&self.0, home_dir, lookup_var)?
            .into_owned()
            .into())
    }

    /// Return the unexpanded text of this path.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Shellexpand helper: the user's home directory, if we have one.
fn home_dir() -> Option<&'static Path> {
    base_dirs().ok().map(BaseDirs::home_dir)
}

/// Shellexpand helper: the value of a path variable.
///
/// Never returns `Ok(None)`: an unknown variable is an error rather
/// than an empty string.
fn lookup_var(var: &str) -> Result<Option<&'static str>, PathError> {
    let path = match var {
        "APP_CACHE" => project_dirs()?.cache_dir(),
        "APP_CONFIG" => project_dirs()?.config_dir(),
        "APP_LOCAL_DATA" => project_dirs()?.data_local_dir(),
        "USER_HOME" => base_dirs()?.home_dir(),
        _ => return Err(PathError::UnknownVar),
    };

    path.to_str().map(Some).ok_or(PathError::BadUtf8)
}

impl std::fmt::Display for CfgPath {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(fmt)
    }
}

/// Return the per-application directories for the tunnel daemon.
pub fn project_dirs() -> Result<&'static ProjectDirs, PathError> {
    /// Computed once.
    static PROJECT_DIRS: Lazy<Option<ProjectDirs>> =
        Lazy::new(|| ProjectDirs::from("net", "tunnel-overlay", "tunneld"));

    PROJECT_DIRS.as_ref().ok_or(PathError::NoProjectDirs)
}

/// Return the current user's base directories.
pub fn base_dirs() -> Result<&'static BaseDirs, PathError> {
    /// Computed once.
    static BASE_DIRS: Lazy<Option<BaseDirs>> = Lazy::new(BaseDirs::new);

    BASE_DIRS.as_ref().ok_or(PathError::NoBaseDirs)
}
