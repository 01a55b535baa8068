//! Configuration logic for launching a tunnel service.

use crate::{Error, Result};

use derive_builder::Builder;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tunnel_proto::MAX_HOPS;

/// Default values, shared between the builders and deserialization.
mod defaults {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    pub(super) fn min_circuits() -> usize {
        2
    }
    pub(super) fn max_circuits() -> usize {
        8
    }
    pub(super) fn hop_count_default() -> u8 {
        1
    }
    pub(super) fn circuit_build_timeout() -> Duration {
        Duration::from_secs(30)
    }
    pub(super) fn hop_build_timeout() -> Duration {
        Duration::from_secs(10)
    }
    pub(super) fn circuit_idle_timeout() -> Duration {
        Duration::from_secs(10 * 60)
    }
    pub(super) fn target_peers() -> usize {
        20
    }
    pub(super) fn golden_ratio() -> f64 {
        9.0 / 16.0
    }
    pub(super) fn max_build_attempts() -> u32 {
        8
    }
    pub(super) fn intro_lifetime() -> Duration {
        Duration::from_secs(10 * 60)
    }
    pub(super) fn rendezvous_cookie_lifetime() -> Duration {
        Duration::from_secs(30)
    }
    pub(super) fn introduce_cooldown() -> Duration {
        Duration::from_secs(60)
    }
    pub(super) fn strategy_interval() -> Duration {
        Duration::from_secs(5)
    }
    pub(super) fn crypto_cooldown() -> Duration {
        Duration::from_secs(60)
    }
    pub(super) fn listen_addr() -> IpAddr {
        Ipv4Addr::LOCALHOST.into()
    }
    pub(super) fn socks_port_base() -> u16 {
        1080
    }
    pub(super) fn socks_hops() -> Vec<u8> {
        vec![1, 2, 3]
    }
}

/// Configuration for circuits, relaying, exits and the peer-mix
/// strategy.
///
/// This type is immutable once constructed.  To create an object of
/// this type, use [`TunnelConfigBuilder`], or deserialize it from the
/// `[tunnel]` section of a configuration file.
#[derive(Debug, Clone, Builder, Deserialize)]
#[builder(setter(prefix = "set"))]
#[builder(build_fn(validate = "Self::validate", error = "Error"))]
pub struct TunnelConfig {
    /// Launch circuits until each SOCKS hop count has at least this
    /// many ready exit circuits.
    #[builder(default = "defaults::min_circuits()")]
    #[serde(default = "defaults::min_circuits")]
    pub(crate) min_circuits: usize,

    /// Never keep more than this many circuits of one hop count.
    #[builder(default = "defaults::max_circuits()")]
    #[serde(default = "defaults::max_circuits")]
    pub(crate) max_circuits: usize,

    /// Hop count used when a caller doesn't ask for one.
    #[builder(default = "defaults::hop_count_default()")]
    #[serde(default = "defaults::hop_count_default")]
    pub(crate) hop_count_default: u8,

    /// Give up on getting a circuit (across all retries) after this long.
    #[builder(default = "defaults::circuit_build_timeout()")]
    #[serde(with = "humantime_serde", default = "defaults::circuit_build_timeout")]
    pub(crate) circuit_build_timeout: Duration,

    /// Give up on a single CREATED or EXTENDED after this long.
    #[builder(default = "defaults::hop_build_timeout()")]
    #[serde(with = "humantime_serde", default = "defaults::hop_build_timeout")]
    pub(crate) hop_build_timeout: Duration,

    /// Destroy circuits, relay entries and exit sockets that carried
    /// nothing for this long.
    #[builder(default = "defaults::circuit_idle_timeout()")]
    #[serde(with = "humantime_serde", default = "defaults::circuit_idle_timeout")]
    pub(crate) circuit_idle_timeout: Duration,

    /// Whether we carry traffic to the Internet for others.
    #[builder(default)]
    #[serde(default)]
    pub(crate) exit_enabled: bool,

    /// Keep about this many peers.
    #[builder(default = "defaults::target_peers()")]
    #[serde(default = "defaults::target_peers")]
    pub(crate) target_peers: usize,

    /// Target fraction of relay-only peers.
    #[builder(default = "defaults::golden_ratio()")]
    #[serde(default = "defaults::golden_ratio")]
    pub(crate) golden_ratio: f64,

    /// Whether we're on the test network.
    #[builder(default)]
    #[serde(default)]
    pub(crate) testnet: bool,

    /// Try at most this many paths for one circuit request.
    #[builder(default = "defaults::max_build_attempts()")]
    #[serde(default = "defaults::max_build_attempts")]
    pub(crate) max_build_attempts: u32,

    /// Introduction points forget a service after this long unless it
    /// re-establishes.
    #[builder(default = "defaults::intro_lifetime()")]
    #[serde(with = "humantime_serde", default = "defaults::intro_lifetime")]
    pub(crate) intro_lifetime: Duration,

    /// Rendezvous points forget an unpaired cookie after this long.
    #[builder(default = "defaults::rendezvous_cookie_lifetime()")]
    #[serde(
        with = "humantime_serde",
        default = "defaults::rendezvous_cookie_lifetime"
    )]
    pub(crate) rendezvous_cookie_lifetime: Duration,

    /// Ask a peer with unknown flags to introduce itself at most this
    /// often.
    #[builder(default = "defaults::introduce_cooldown()")]
    #[serde(with = "humantime_serde", default = "defaults::introduce_cooldown")]
    pub(crate) introduce_cooldown: Duration,

    /// How often the peer-mix strategy runs.
    #[builder(default = "defaults::strategy_interval()")]
    #[serde(with = "humantime_serde", default = "defaults::strategy_interval")]
    pub(crate) strategy_interval: Duration,

    /// Don't pick a peer whose handshake failed for this long.
    #[builder(default = "defaults::crypto_cooldown()")]
    #[serde(with = "humantime_serde", default = "defaults::crypto_cooldown")]
    pub(crate) crypto_cooldown: Duration,
}

impl TunnelConfigBuilder {
    /// Check the values that the builder is about to use.
    fn validate(&self) -> std::result::Result<(), String> {
        let min = self.min_circuits.unwrap_or_else(defaults::min_circuits);
        let max = self.max_circuits.unwrap_or_else(defaults::max_circuits);
        let hops = self
            .hop_count_default
            .unwrap_or_else(defaults::hop_count_default);
        let ratio = self.golden_ratio.unwrap_or_else(defaults::golden_ratio);
        let attempts = self
            .max_build_attempts
            .unwrap_or_else(defaults::max_build_attempts);
        check_values(min, max, hops, ratio, attempts)
    }
}

/// Shared range checks for [`TunnelConfig`].
fn check_values(
    min: usize,
    max: usize,
    hops: u8,
    ratio: f64,
    attempts: u32,
) -> std::result::Result<(), String> {
    if max == 0 {
        return Err("max_circuits must be at least 1".into());
    }
    if min > max {
        return Err(format!(
            "min_circuits ({}) is larger than max_circuits ({})",
            min, max
        ));
    }
    if hops == 0 || usize::from(hops) > MAX_HOPS {
        return Err(format!(
            "hop_count_default must be between 1 and {}, not {}",
            MAX_HOPS, hops
        ));
    }
    if !(ratio > 0.0 && ratio < 1.0) {
        return Err(format!("golden_ratio must be in (0, 1), not {}", ratio));
    }
    if attempts == 0 {
        return Err("max_build_attempts must be at least 1".into());
    }
    Ok(())
}

impl From<String> for Error {
    fn from(s: String) -> Error {
        Error::Fatal(s)
    }
}

impl From<derive_builder::UninitializedFieldError> for Error {
    fn from(e: derive_builder::UninitializedFieldError) -> Error {
        Error::Fatal(e.to_string())
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            min_circuits: defaults::min_circuits(),
            max_circuits: defaults::max_circuits(),
            hop_count_default: defaults::hop_count_default(),
            circuit_build_timeout: defaults::circuit_build_timeout(),
            hop_build_timeout: defaults::hop_build_timeout(),
            circuit_idle_timeout: defaults::circuit_idle_timeout(),
            exit_enabled: false,
            target_peers: defaults::target_peers(),
            golden_ratio: defaults::golden_ratio(),
            testnet: false,
            max_build_attempts: defaults::max_build_attempts(),
            intro_lifetime: defaults::intro_lifetime(),
            rendezvous_cookie_lifetime: defaults::rendezvous_cookie_lifetime(),
            introduce_cooldown: defaults::introduce_cooldown(),
            strategy_interval: defaults::strategy_interval(),
            crypto_cooldown: defaults::crypto_cooldown(),
        }
    }
}

impl TunnelConfig {
    /// Check a configuration that didn't come through the builder (for
    /// example, one that was deserialized).
    pub fn validate(&self) -> Result<()> {
        check_values(
            self.min_circuits,
            self.max_circuits,
            self.hop_count_default,
            self.golden_ratio,
            self.max_build_attempts,
        )
        .map_err(Error::Fatal)
    }

    /// Return true if this node carries exit traffic.
    pub fn exit_enabled(&self) -> bool {
        self.exit_enabled
    }

    /// Return true if this node is on the test network.
    pub fn testnet(&self) -> bool {
        self.testnet
    }

    /// Return the default hop count for new circuits.
    pub fn hop_count_default(&self) -> u8 {
        self.hop_count_default
    }
}

/// Configuration for the SOCKS5 listeners.
///
/// This type is immutable once constructed.  To create an object of
/// this type, use [`SocksConfigBuilder`].
#[derive(Debug, Clone, Builder, Deserialize)]
#[builder(setter(prefix = "set"))]
#[builder(build_fn(validate = "Self::validate", error = "Error"))]
pub struct SocksConfig {
    /// Address to listen on.
    #[builder(default = "defaults::listen_addr()")]
    #[serde(default = "defaults::listen_addr")]
    pub(crate) listen_addr: IpAddr,

    /// The listener for hop count `h` is on `socks_port_base + h`.  Zero
    /// means "let the OS pick".
    #[builder(default = "defaults::socks_port_base()")]
    #[serde(default = "defaults::socks_port_base")]
    pub(crate) socks_port_base: u16,

    /// Hop counts to listen for.
    #[builder(default = "defaults::socks_hops()")]
    #[serde(default = "defaults::socks_hops")]
    pub(crate) socks_hops: Vec<u8>,
}

impl SocksConfigBuilder {
    /// Check the hop counts that the builder is about to use.
    fn validate(&self) -> std::result::Result<(), String> {
        match &self.socks_hops {
            Some(hops) => check_hops(hops),
            None => Ok(()),
        }
    }
}

/// Every SOCKS hop count must fit on a circuit.
fn check_hops(hops: &[u8]) -> std::result::Result<(), String> {
    match hops.iter().find(|h| usize::from(**h) > MAX_HOPS) {
        Some(h) => Err(format!(
            "SOCKS hop count {} is larger than the maximum of {}",
            h, MAX_HOPS
        )),
        None => Ok(()),
    }
}

impl Default for SocksConfig {
    fn default() -> Self {
        SocksConfig {
            listen_addr: defaults::listen_addr(),
            socks_port_base: defaults::socks_port_base(),
            socks_hops: defaults::socks_hops(),
        }
    }
}

impl SocksConfig {
    /// Check a configuration that didn't come through the builder.
    pub fn validate(&self) -> Result<()> {
        check_hops(&self.socks_hops).map_err(Error::Fatal)
    }

    /// Return the hop counts we listen for.
    pub fn socks_hops(&self) -> &[u8] {
        &self.socks_hops[..]
    }

    /// Return the port for the listener with hop count `hops`.
    pub(crate) fn port_for(&self, hops: u8) -> u16 {
        if self.socks_port_base == 0 {
            0
        } else {
            self.socks_port_base.saturating_add(u16::from(hops))
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn defaults() {
        let cfg = TunnelConfigBuilder::default().build().unwrap();
        assert_eq!(cfg.min_circuits, 2);
        assert_eq!(cfg.max_circuits, 8);
        assert_eq!(cfg.golden_ratio, 0.5625);
        assert_eq!(cfg.hop_build_timeout, Duration::from_secs(10));
        assert!(!cfg.exit_enabled());
        assert!(TunnelConfig::default().validate().is_ok());

        let socks = SocksConfig::default();
        assert_eq!(socks.socks_hops(), &[1, 2, 3]);
        assert_eq!(socks.port_for(2), 1082);
    }

    #[test]
    fn bad_values() {
        let r = TunnelConfigBuilder::default()
            .set_min_circuits(5)
            .set_max_circuits(3)
            .build();
        assert!(matches!(r, Err(Error::Fatal(_))));

        let r = TunnelConfigBuilder::default()
            .set_min_circuits(0)
            .set_max_circuits(0)
            .build();
        assert!(matches!(r, Err(Error::Fatal(_))));

        let r = TunnelConfigBuilder::default().set_hop_count_default(0).build();
        assert!(matches!(r, Err(Error::Fatal(_))));

        let r = TunnelConfigBuilder::default().set_golden_ratio(1.5).build();
        assert!(matches!(r, Err(Error::Fatal(_))));

        let r = SocksConfigBuilder::default()
            .set_socks_hops(vec![1, 9])
            .build();
        assert!(matches!(r, Err(Error::Fatal(_))));
    }

    #[test]
    fn partial_toml() {
        #[derive(Deserialize)]
        struct Top {
            tunnel: TunnelConfig,
            socks: SocksConfig,
        }
        let top: Top = toml::from_str(
            r#"
            [tunnel]
            exit_enabled = true
            hop_build_timeout = "3s"
            [socks]
            socks_hops = [0, 1]
            "#,
        )
        .unwrap();
        assert!(top.tunnel.exit_enabled());
        assert_eq!(top.tunnel.hop_build_timeout, Duration::from_secs(3));
        assert_eq!(top.tunnel.max_circuits, 8);
        assert_eq!(top.socks.socks_hops(), &[0, 1]);
        assert!(top.socks.validate().is_ok());
    }
}
