//! Counters for things that went right and wrong.
//!
//! Errors that are confined to one circuit are never returned to the
//! application; these counters are where they show up instead.

use std::sync::atomic::{AtomicU64, Ordering};

/// Declare the counter struct and its snapshot together, so that they
/// can't drift apart.
macro_rules! counters {
    { $( $(#[$meta:meta])* $name:ident ),* $(,)? } => {
        /// Live counters for a running tunnel service.
        #[derive(Debug, Default)]
        pub struct TunnelStats {
            $( $(#[$meta])* $name: AtomicU64, )*
        }

        /// A copy of [`TunnelStats`] at one moment.
        #[derive(Clone, Debug, Default, PartialEq, Eq)]
        #[non_exhaustive]
        pub struct StatsSnapshot {
            $( $(#[$meta])* pub $name: u64, )*
        }

        impl TunnelStats {
            /// Return the current value of every counter.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $( $name: self.$name.load(Ordering::Relaxed), )*
                }
            }
        }
    }
}

counters! {
    /// Cells we parsed from the network.
    cells_received,
    /// Cells we handed to the community.
    cells_sent,
    /// Packets that weren't a well-formed cell.
    malformed_dropped,
    /// Cells on a circuit we don't know.
    unknown_dropped,
    /// CREATED or EXTENDED replies that nobody was waiting for.
    stale_dropped,
    /// Failed handshakes and cells that didn't authenticate.
    crypto_failures,
    /// Circuits that reached the ready state.
    circuits_built,
    /// Circuit builds that failed.
    build_failures,
    /// Cells we forwarded as a relay.
    relay_forwarded,
    /// Bytes our exits sent to the Internet.
    exit_bytes_up,
    /// Bytes our exits received from the Internet.
    exit_bytes_down,
    /// Requests refused by policy.
    policy_rejections,
    /// Sends the community reported as failed.
    transport_failures,
}

impl TunnelStats {
    /// Add one to `counter`.
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n` to `counter`.
    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn cell_received(&self) {
        Self::bump(&self.cells_received);
    }
    pub(crate) fn cell_sent(&self) {
        Self::bump(&self.cells_sent);
    }
    pub(crate) fn malformed(&self) {
        Self::bump(&self.malformed_dropped);
    }
    pub(crate) fn unknown(&self) {
        Self::bump(&self.unknown_dropped);
    }
    pub(crate) fn stale(&self) {
        Self::bump(&self.stale_dropped);
    }
    pub(crate) fn crypto_failure(&self) {
        Self::bump(&self.crypto_failures);
    }
    pub(crate) fn circuit_built(&self) {
        Self::bump(&self.circuits_built);
    }
    pub(crate) fn build_failed(&self) {
        Self::bump(&self.build_failures);
    }
    pub(crate) fn relayed(&self) {
        Self::bump(&self.relay_forwarded);
    }
    pub(crate) fn exit_up(&self, n: usize) {
        Self::add(&self.exit_bytes_up, n);
    }
    pub(crate) fn exit_down(&self, n: usize) {
        Self::add(&self.exit_bytes_down, n);
    }
    pub(crate) fn policy(&self) {
        Self::bump(&self.policy_rejections);
    }
    pub(crate) fn transport_failure(&self) {
        Self::bump(&self.transport_failures);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot() {
        let s = TunnelStats::default();
        s.cell_received();
        s.cell_received();
        s.exit_up(100);
        s.policy();
        let snap = s.snapshot();
        assert_eq!(snap.cells_received, 2);
        assert_eq!(snap.exit_bytes_up, 100);
        assert_eq!(snap.policy_rejections, 1);
        assert_eq!(snap.crypto_failures, 0);
    }
}
