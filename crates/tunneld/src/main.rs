//! A daemon that joins the tunnel overlay and offers SOCKS5 proxies
//! over it.
//!
//! `tunneld` binds a UDP socket for the peer-to-peer community, starts a
//! tunnel service over it, and opens one SOCKS5 listener per configured
//! hop count.  It relays for other peers, and carries their traffic to
//! the Internet if `tunnel.exit_enabled` is set.  On ctrl-c it tears its
//! circuits down and saves what it knows about exits.
//!
//! Configuration comes from the built-in defaults (see
//! `tunneld_defaults.toml`), then the per-user configuration file or the
//! files given with `-f`, then `-c key=value` options.

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

mod community;
mod exit;
mod key;

use community::UdpCommunity;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tunnel_config::CfgPath;
use tunnel_persist::{FsStateMgr, StateMgr};
use tunnel_service::{Community, PeerHandle, PeerId, SocksConfig, TunnelConfig, TunnelService};

use anyhow::{anyhow, Context, Result};
use argh::FromArgs;
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(FromArgs, Debug, Clone)]
/// Join the tunnel overlay, open SOCKS ports, and proxy traffic through
/// anonymizing circuits.
struct Args {
    /// override the default location(s) for the configuration file
    #[argh(option, short = 'f')]
    rc: Vec<String>,
    /// override a configuration option (uses toml syntax)
    #[argh(option, short = 'c')]
    cfg: Vec<String>,
}

/// Default options to use for our configuration.
const TUNNELD_DEFAULTS: &str = include_str!("./tunneld_defaults.toml");

/// Structure to hold our configuration options, whether from a
/// configuration file or the command line.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct TunneldConfig {
    /// How to build circuits, and what to do for other peers.
    tunnel: TunnelConfig,
    /// Where to listen for SOCKS connections.
    socks: SocksConfig,
    /// How to reach the rest of the overlay.
    community: CommunityConfig,
    /// Where things live on disk.
    storage: StorageConfig,
    /// What to log.
    logging: LoggingConfig,
}

/// Configuration for the UDP community.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct CommunityConfig {
    /// Address to bind the community socket to.
    listen: SocketAddr,
    /// Peers to contact at startup.
    #[serde(default)]
    bootstrap: Vec<BootstrapPeer>,
}

/// Configuration for where information should be stored on disk.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct StorageConfig {
    /// Directory for persistent state, such as the exit cache.
    state_dir: CfgPath,
    /// File holding our long-term identity key.
    key_file: CfgPath,
}

/// Configuration for logging.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct LoggingConfig {
    /// A `tracing` filter, used when `RUST_LOG` isn't set.
    trace_filter: String,
}

/// A peer given as `hexid@address:port`.
#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(try_from = "String")]
struct BootstrapPeer(PeerHandle);

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        let (id, addr) = s
            .split_once('@')
            .ok_or_else(|| anyhow!("bootstrap peer {:?} is not hexid@address", s))?;
        let id: PeerId = id
            .parse()
            .with_context(|| format!("bad peer id in bootstrap peer {:?}", s))?;
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("bad address in bootstrap peer {:?}", s))?;
        Ok(BootstrapPeer(PeerHandle::new(id, addr)))
    }
}

impl std::convert::TryFrom<String> for BootstrapPeer {
    type Error = anyhow::Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Assemble our configuration from the defaults, files, and command
/// line.
fn load_config(args: &Args) -> Result<TunneldConfig> {
    let dflt_config = tunnel_config::default_config_file();
    let mut cfg = config::Config::new();
    tunnel_config::load(
        &mut cfg,
        Some(TUNNELD_DEFAULTS),
        dflt_config,
        &args.rc,
        &args.cfg,
    )?;
    let config: TunneldConfig = cfg.try_into().context("invalid configuration")?;
    config.tunnel.validate()?;
    config.socks.validate()?;
    Ok(config)
}

/// Send our log messages to stderr.
fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let filter = match std::env::var_os("RUST_LOG") {
        Some(_) => EnvFilter::try_from_default_env().context("bad RUST_LOG")?,
        None => EnvFilter::try_new(&config.trace_filter).context("bad logging.trace_filter")?,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Run the daemon until we are told to stop.
async fn run(config: TunneldConfig) -> Result<()> {
    let key_file = config.storage.key_file.path()?;
    let identity = key::load_or_create(&key_file)?;

    let community = UdpCommunity::bind(
        config.community.listen,
        identity.peer_id(),
        community::flags_for(&config.tunnel),
        config.tunnel.testnet(),
    )
    .await
    .with_context(|| format!("can't bind community socket on {}", config.community.listen))?;
    info!(
        "{} joined the {} community on {}",
        identity.peer_id(),
        if config.tunnel.testnet() { "test" } else { "main" },
        community.local_addr()?
    );

    let service = TunnelService::launch(
        &identity,
        config.tunnel.clone(),
        Arc::clone(&community) as Arc<dyn Community>,
        None,
    )?;
    tokio::spawn(Arc::clone(&community).run(service.handle()));

    for BootstrapPeer(peer) in &config.community.bootstrap {
        community.learn(*peer, None);
        if let Err(e) = community.introduce(peer).await {
            warn!("can't reach bootstrap peer {}: {}", peer, e);
        }
    }

    let state_dir = config.storage.state_dir.path()?;
    let store = FsStateMgr::from_path(&state_dir)?;
    if !store.try_lock()? {
        warn!(
            "another process is using {:?}; the exit cache will not be saved",
            state_dir
        );
    }
    service.with_exit_cache(store)?;

    for (hops, addr) in service.launch_socks(&config.socks).await? {
        info!("listening for SOCKS on {} ({} hops)", addr, hops);
    }

    exit::wait_for_ctrl_c().await?;
    info!("shutting down");
    service.shutdown();
    Ok(())
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();
    let config = load_config(&args)?;
    setup_logging(&config.logging)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("can't start runtime")?;
    runtime.block_on(run(config))
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::path::Path;

    fn parse(opts: &[&str]) -> Result<TunneldConfig> {
        let mut cfg = config::Config::new();
        tunnel_config::load(
            &mut cfg,
            Some(TUNNELD_DEFAULTS),
            None::<&Path>,
            &Vec::<String>::new(),
            opts,
        )?;
        Ok(cfg.try_into()?)
    }

    #[test]
    fn load_default_config() {
        let config = parse(&[]).unwrap();
        assert!(!config.tunnel.exit_enabled());
        assert_eq!(config.socks.socks_hops(), &[1, 2, 3]);
        assert_eq!(config.community.listen.port(), 7759);
        assert!(config.community.bootstrap.is_empty());
        assert!(config.tunnel.validate().is_ok());
        assert_eq!(
            community::flags_for(&config.tunnel),
            tunnel_service::PeerFlags::RELAY
        );
    }

    #[test]
    fn overrides() {
        let id = "ab".repeat(32);
        let boot = format!("community.bootstrap=[\"{}@192.0.2.7:7759\"]", id);
        let config = parse(&[
            "tunnel.exit_enabled=true",
            "tunnel.testnet=true",
            "socks.socks_hops=[0,2]",
            boot.as_str(),
        ])
        .unwrap();
        assert!(config.tunnel.exit_enabled());
        assert!(config.tunnel.testnet());
        assert_eq!(config.socks.socks_hops(), &[0, 2]);
        let BootstrapPeer(peer) = config.community.bootstrap[0];
        assert_eq!(peer.id().to_string(), id);
        assert_eq!(peer.addr(), "192.0.2.7:7759".parse().unwrap());
        assert!(community::flags_for(&config.tunnel).contains(tunnel_service::PeerFlags::EXIT));
    }

    #[test]
    fn bad_bootstrap() {
        assert!("nonsense".parse::<BootstrapPeer>().is_err());
        assert!("abcd@192.0.2.7:7759".parse::<BootstrapPeer>().is_err());
        let id = "ab".repeat(32);
        assert!(format!("{}@nowhere", id).parse::<BootstrapPeer>().is_err());
        // Unknown sections are refused.
        assert!(parse(&["bogus.x=1"]).is_err());
    }
}
