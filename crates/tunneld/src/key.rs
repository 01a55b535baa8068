//! Loading and creating our long-term identity key.

use anyhow::{anyhow, Context, Result};
use std::convert::TryInto;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::info;
use tunnel_service::IdentityKey;

#[cfg(target_family = "unix")]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

/// Length of a key file: the raw 32-byte secret.
const KEY_LEN: usize = 32;

/// Load the identity key stored at `path`, or generate one and store it
/// there if the file doesn't exist.
///
/// A new key file is only readable by its owner.
pub(crate) fn load_or_create(path: &Path) -> Result<IdentityKey> {
    match fs::read(path) {
        Ok(bytes) => {
            let secret: [u8; KEY_LEN] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("key file {:?} has the wrong length", path))?;
            Ok(IdentityKey::from_secret_bytes(secret))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => create(path),
        Err(e) => Err(e).with_context(|| format!("can't read key file {:?}", path)),
    }
}

/// Generate a new identity key and write it to `path`.
fn create(path: &Path) -> Result<IdentityKey> {
    if let Some(parent) = path.parent() {
        let mut builder = fs::DirBuilder::new();
        #[cfg(target_family = "unix")]
        builder.mode(0o700);
        builder
            .recursive(true)
            .create(parent)
            .with_context(|| format!("can't create {:?}", parent))?;
    }

    let key = IdentityKey::generate(&mut rand::thread_rng());
    let mut opts = OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(target_family = "unix")]
    opts.mode(0o600);
    let mut f = opts
        .open(path)
        .with_context(|| format!("can't create key file {:?}", path))?;
    f.write_all(&key.secret_bytes())
        .with_context(|| format!("can't write key file {:?}", path))?;
    info!("generated a new identity {} in {:?}", key.peer_id(), path);
    Ok(key)
}
