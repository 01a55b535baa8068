//! Configuration loading for the tunnel overlay.
//!
//! Configuration is plain TOML, deserialized with `serde` through the
//! `config` crate.  Sources are layered, later ones overriding earlier
//! ones:
//!
//!  1. built-in defaults, usually compiled into the binary;
//!  2. configuration files, or the per-user default file if none were
//!     given;
//!  3. `key=value` overrides from the command line (see [`CmdLine`]).
//!
//! Paths inside the configuration are written as [`CfgPath`], which
//! understands `~` and a handful of per-application directory variables.

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

mod cmdline;
mod err;
mod path;

pub use cmdline::CmdLine;
pub use err::Error;
pub use path::{base_dirs, project_dirs, CfgPath, PathError};

use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the configuration file looked for in the per-user
/// configuration directory.
pub const CONFIG_FILE_NAME: &str = "tunneld.toml";

/// Merge a set of configuration sources into `cfg`.
///
/// `defaults`, if present, is a TOML document merged first.  Every
/// file in `files` is then merged and must exist.  If `files` is empty
/// and `default_path` is given, that file is merged instead if it
/// exists.  Last come the command-line overrides in `opts`, which use
/// the syntax of [`CmdLine`].
pub fn load<'a, P1, C1, P2, C2>(
    cfg: &mut config::Config,
    defaults: Option<&str>,
    default_path: Option<P1>,
    files: C1,
    opts: C2,
) -> Result<(), Error>
where
    P1: AsRef<Path> + 'a,
    C1: IntoIterator<Item = &'a P2>,
    P2: AsRef<Path> + 'a,
    C2: IntoIterator,
    C2::Item: AsRef<str>,
{
    if let Some(defaults) = defaults {
        cfg.merge(config::File::from_str(defaults, config::FileFormat::Toml))
            .map_err(Error::Defaults)?;
    }

    let mut search_path: Vec<(&Path, bool)> =
        files.into_iter().map(|f| (f.as_ref(), true)).collect();
    if search_path.is_empty() {
        if let Some(f) = &default_path {
            debug!("looking for default configuration in {:?}", f.as_ref());
            search_path.push((f.as_ref(), false));
        }
    }

    for (p, required) in search_path {
        if required || p.exists() {
            info!("reading configuration from {:?}", p);
        }
        let f: config::File<_> = p.into();
        cfg.merge(f.format(config::FileFormat::Toml).required(required))
            .map_err(|e| Error::File(p.to_path_buf(), e))?;
    }

    let mut cmdline = CmdLine::new();
    for opt in opts {
        cmdline.push_toml_line(opt.as_ref().to_string());
    }
    if !cmdline.is_empty() {
        cfg.merge(cmdline).map_err(Error::CmdLine)?;
    }

    Ok(())
}

/// Return the name of the per-user default configuration file, if the
/// platform gives us a configuration directory.
pub fn default_config_file() -> Option<PathBuf> {
    project_dirs()
        .ok()
        .map(|pd| pd.config_dir().join(CONFIG_FILE_NAME))
}
