//! Facilities to build circuits along a chosen path.

use crate::circuit::ClientCirc;
use crate::path::TunnelPath;
use crate::reactor::{CtrlMsg, HopDone, ReactorHandle};
use crate::{Error, Result, TunnelConfig, TunnelStats};

use futures::channel::oneshot;
use futures::Future;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tunnel_cell::msg::DestroyReason;

/// Why a build failed, and how far it got.
#[derive(Debug, Clone)]
pub(crate) struct BuildFailure {
    /// What went wrong.
    pub(crate) error: Error,
    /// How many hops had finished their handshake.
    pub(crate) hops_built: usize,
}

/// A factory object to build circuits.
///
/// A `CircuitBuilder` doesn't choose paths; it just walks a circuit
/// hop by hop along the path it is given, with a timeout per hop and
/// one for the whole circuit.
#[derive(Debug)]
pub(crate) struct CircuitBuilder {
    /// The reactor that will own the circuits.
    reactor: ReactorHandle,
    /// Timeouts.
    config: Arc<TunnelConfig>,
    /// Where to count failures.
    stats: Arc<TunnelStats>,
}

impl CircuitBuilder {
    /// Construct a new [`CircuitBuilder`].
    pub(crate) fn new(
        reactor: ReactorHandle,
        config: Arc<TunnelConfig>,
        stats: Arc<TunnelStats>,
    ) -> Self {
        CircuitBuilder {
            reactor,
            config,
            stats,
        }
    }

    /// Build a circuit, without the overall timeout.
    ///
    /// After each hop is built, increments n_hops_built.
    async fn build_notimeout(
        self: Arc<Self>,
        path: TunnelPath,
        exit: bool,
        n_hops_built: Arc<AtomicU32>,
    ) -> Result<ClientCirc> {
        let hop_timeout = self.config.hop_build_timeout;
        let hops = u8::try_from(path.len())
            .map_err(|_| Error::Internal("absurdly long path".into()))?;
        let first = *path
            .get(0)
            .ok_or_else(|| Error::Internal("empty path".into()))?;
        let (circ, done) = self
            .reactor
            .call(|reply| CtrlMsg::Create {
                hops,
                exit,
                first,
                reply,
            })
            .await?;
        await_hop(&circ, done, hop_timeout).await?;
        n_hops_built.fetch_add(1, Ordering::SeqCst);
        for hop in &path.hops()[1..] {
            let done = circ.extend(*hop)?;
            await_hop(&circ, done, hop_timeout).await?;
            n_hops_built.fetch_add(1, Ordering::SeqCst);
        }
        Ok(circ)
    }

    /// Try to construct a new circuit along `path`, using appropriate
    /// timeouts.
    ///
    /// The circuit is not registered with any manager; if nobody holds
    /// on to it, it goes away when the last handle is dropped.
    pub(crate) async fn build(
        self: &Arc<Self>,
        path: TunnelPath,
        exit: bool,
    ) -> std::result::Result<ClientCirc, BuildFailure> {
        let timeout = self.config.circuit_build_timeout;
        let abandon = timeout * 2;
        let hops_built = Arc::new(AtomicU32::new(0));
        let desc = path
            .hops()
            .iter()
            .map(|h| h.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        let fut = Arc::clone(self).build_notimeout(path, exit, Arc::clone(&hops_built));
        match double_timeout(fut, timeout, abandon).await {
            Ok(circ) => {
                debug!("{}: built through [{}]", circ.unique_id(), desc);
                Ok(circ)
            }
            Err(error) => {
                self.stats.build_failed();
                let n = hops_built.load(Ordering::SeqCst);
                debug!("build through [{}] failed after {} hops: {}", desc, n, error);
                Err(BuildFailure {
                    error,
                    hops_built: n as usize,
                })
            }
        }
    }
}

/// Wait up to `limit` for one hop of `circ` to finish.
///
/// On timeout, the circuit is torn down.
async fn await_hop(circ: &ClientCirc, done: HopDone, limit: Duration) -> Result<()> {
    match tokio::time::timeout(limit, done).await {
        Ok(outcome) => outcome?,
        Err(_) => {
            circ.terminate_with(DestroyReason::TIMEOUT);
            Err(Error::Timeout)
        }
    }
}

/// Helper function: spawn a future as a background task, and run it with
/// two separate timeouts.
///
/// If the future does not complete by `timeout`, then return a
/// timeout error immediately, but keep running the future in the
/// background.
///
/// If the future does not complete by `abandon`, then abandon the
/// future completely.
async fn double_timeout<F, T>(fut: F, timeout: Duration, abandon: Duration) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let (snd, rcv) = oneshot::channel();
    tokio::spawn(async move {
        let result = tokio::time::timeout(abandon, fut).await;
        let _ignore_cancelled_error = snd.send(result);
    });

    let outcome = tokio::time::timeout(timeout, rcv).await;
    // 4 layers of error to collapse:
    //     One from the receiver being cancelled.
    //     One from the outer timeout.
    //     One from the inner timeout.
    //     One from the actual future's result.
    Ok(outcome????)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_double_timeout() {
        let t1 = Duration::from_secs(1);
        let t10 = Duration::from_secs(10);
        /// Return a future that sleeps for `d`, then returns `v`.
        fn duration_then_val(d: Duration, v: u32) -> impl Future<Output = Result<u32>> {
            async move {
                tokio::time::sleep(d).await;
                Ok(v)
            }
        }

        // Try a future that's ready immediately.
        let x = double_timeout(async { Ok(3_u32) }, t1, t10).await;
        assert_eq!(x.unwrap(), 3);

        // Try a future that's ready after a short delay.
        let x = double_timeout(duration_then_val(Duration::from_millis(500), 4), t1, t10).await;
        assert_eq!(x.unwrap(), 4);

        // Try a future that passes the first timeout, and make sure that
        // it keeps running after it times out.
        let (snd, rcv) = oneshot::channel();
        let fut = async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            snd.send(()).unwrap();
            Ok(4_u32)
        };
        let x = double_timeout(fut, t1, t10).await;
        assert!(matches!(x, Err(Error::Timeout)));
        assert!(rcv.await.is_ok());

        // Try a future that passes the second timeout, and make sure that
        // it is dropped.
        let (snd, rcv) = oneshot::channel::<()>();
        let fut = async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            snd.send(()).unwrap();
            Ok(5_u32)
        };
        let x = double_timeout(fut, t1, t10).await;
        assert!(matches!(x, Err(Error::Timeout)));
        // The sender was dropped without sending.
        assert!(rcv.await.is_err());
    }
}
