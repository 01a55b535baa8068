//! The exit side of a circuit: sockets that talk to the Internet on
//! behalf of the circuit's originator.
//!
//! Every exit circuit gets its own task, which owns the circuit's UDP
//! sockets and the writers of its TCP streams.  The reactor hands it
//! the data messages that arrive on the circuit; whatever comes back
//! from the Internet is posted to the reactor to be sealed and sent
//! back toward the originator.
//!
//! Reads from the Internet stop while too many cells for the circuit
//! are waiting to be sent, and resume once the queue has drained.

use crate::reactor::{CtrlMsg, ReactorHandle};
use crate::TunnelStats;

use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use tunnel_cell::datamsg::{DataMsg, EndReason, StreamId, TargetAddr, STREAM_DATA_OVERHEAD};
use tunnel_cell::msg::DestroyReason;
use tunnel_proto::circmap::LinkKey;
use tunnel_proto::crypto::cell::MAX_INBOUND_PLAINTEXT;

/// Stop reading from the Internet when this many cells are queued.
pub(crate) const HIGH_WATER: usize = 64;
/// Start reading again once the queue is down to this many cells.
pub(crate) const LOW_WATER: usize = 16;

/// How long to wait for a TCP connection to the Internet.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The largest chunk of a TCP stream that fits in one inbound cell,
/// whatever the originator's hop count.
const STREAM_CHUNK: usize = MAX_INBOUND_PLAINTEXT - STREAM_DATA_OVERHEAD;

/// A count of cells queued toward an originator, with a way to wait
/// for it to drain.
#[derive(Debug, Default)]
pub(crate) struct Backpressure {
    /// Number of outstanding tokens.
    queued: AtomicUsize,
    /// Woken when `queued` falls to [`LOW_WATER`].
    drained: Notify,
}

impl Backpressure {
    /// Count one more queued cell; the count goes down when the token
    /// is dropped.
    pub(crate) fn token(self: &Arc<Self>) -> BpToken {
        self.queued.fetch_add(1, Ordering::SeqCst);
        BpToken(Arc::clone(self))
    }

    /// Return the number of queued cells.
    pub(crate) fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Wait until it's fine to queue more cells.
    pub(crate) async fn wait_for_room(&self) {
        if self.queued() < HIGH_WATER {
            return;
        }
        loop {
            let drained = self.drained.notified();
            if self.queued() <= LOW_WATER {
                return;
            }
            drained.await;
        }
    }
}

/// One cell counted against a [`Backpressure`].
#[derive(Debug)]
pub(crate) struct BpToken(Arc<Backpressure>);

impl Drop for BpToken {
    fn drop(&mut self) {
        let prev = self.0.queued.fetch_sub(1, Ordering::SeqCst);
        if prev <= LOW_WATER + 1 {
            self.0.drained.notify_waiters();
        }
    }
}

/// Tasks that die with their owner.
#[derive(Debug, Default)]
struct TaskSet(Vec<JoinHandle<()>>);

impl TaskSet {
    /// Add a task.
    fn push(&mut self, t: JoinHandle<()>) {
        self.0.retain(|t| !t.is_finished());
        self.0.push(t);
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        for t in &self.0 {
            t.abort();
        }
    }
}

/// Bytes an exit has carried, in each direction.
#[derive(Debug, Default)]
struct ExitBytes {
    /// Sent to the Internet.
    up: AtomicU64,
    /// Received from the Internet.
    down: AtomicU64,
}

/// The reactor's record of a running exit.
#[derive(Debug)]
pub(crate) struct ExitEnt {
    /// The circuit we're the exit for.
    key: LinkKey,
    /// Data messages for the exit task.
    tx: mpsc::UnboundedSender<DataMsg>,
    /// The exit task.
    task: JoinHandle<()>,
    /// What this exit has carried.
    bytes: Arc<ExitBytes>,
}

impl ExitEnt {
    /// Start an exit for the circuit at `key`.
    pub(crate) fn launch(key: LinkKey, reactor: ReactorHandle, stats: Arc<TunnelStats>) -> Self {
        let (tx, rx) = mpsc::unbounded();
        let bytes = Arc::new(ExitBytes::default());
        let ctx = ExitCtx {
            key,
            reactor,
            bp: Arc::new(Backpressure::default()),
            stats,
            bytes: Arc::clone(&bytes),
        };
        let task = tokio::spawn(run_exit(rx, ctx));
        ExitEnt {
            key,
            tx,
            task,
            bytes,
        }
    }

    /// Return the number of bytes this exit has sent to the Internet.
    pub(crate) fn bytes_up(&self) -> u64 {
        self.bytes.up.load(Ordering::Relaxed)
    }

    /// Return the number of bytes this exit has received from the
    /// Internet.
    pub(crate) fn bytes_down(&self) -> u64 {
        self.bytes.down.load(Ordering::Relaxed)
    }

    /// Give a data message to the exit.  Return false if the exit has
    /// gone away.
    pub(crate) fn deliver(&self, msg: DataMsg) -> bool {
        self.tx.unbounded_send(msg).is_ok()
    }
}

impl Drop for ExitEnt {
    fn drop(&mut self) {
        self.task.abort();
        debug!(
            "{:?}: exit closed; {} bytes up, {} down",
            self.key.1,
            self.bytes_up(),
            self.bytes_down()
        );
    }
}

/// What every part of an exit needs to talk to the reactor.
#[derive(Clone, Debug)]
struct ExitCtx {
    /// The circuit we're the exit for.
    key: LinkKey,
    /// Where to post replies.
    reactor: ReactorHandle,
    /// Cells queued toward the originator.
    bp: Arc<Backpressure>,
    /// Where to count bytes for the whole service.
    stats: Arc<TunnelStats>,
    /// Where to count bytes for this exit.
    bytes: Arc<ExitBytes>,
}

impl ExitCtx {
    /// Count `n` bytes sent to the Internet.
    fn count_up(&self, n: usize) {
        self.bytes.up.fetch_add(n as u64, Ordering::Relaxed);
        self.stats.exit_up(n);
    }

    /// Count `n` bytes received from the Internet.
    fn count_down(&self, n: usize) {
        self.bytes.down.fetch_add(n as u64, Ordering::Relaxed);
        self.stats.exit_down(n);
    }

    /// Send `msg` back toward the originator.  Return false if the
    /// circuit is gone.
    fn post(&self, msg: &DataMsg) -> bool {
        let body = match msg.encode() {
            Ok(b) => b,
            Err(e) => {
                debug!("{:?}: can't encode reply: {}", self.key.1, e);
                return true;
            }
        };
        if body.len() > MAX_INBOUND_PLAINTEXT {
            trace!(
                "{:?}: dropping {}-byte reply that won't fit a cell",
                self.key.1,
                body.len()
            );
            return true;
        }
        self.reactor
            .send(CtrlMsg::ExitData {
                key: self.key,
                body,
                token: self.bp.token(),
            })
            .is_ok()
    }

    /// Tell the reactor the exit has failed.
    fn fail(&self, reason: DestroyReason) {
        let _ = self.reactor.send(CtrlMsg::ExitFailed {
            key: self.key,
            reason,
        });
    }
}

/// Resolve `target` to a socket address.
async fn resolve(target: &TargetAddr) -> io::Result<SocketAddr> {
    match target {
        TargetAddr::Ip(a) => Ok(*a),
        TargetAddr::Hostname(h, p) => tokio::net::lookup_host((h.as_str(), *p))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses")),
        _ => Err(io::Error::new(io::ErrorKind::Unsupported, "unknown target type")),
    }
}

/// The UDP sockets of one exit, one per address family.
#[derive(Default)]
struct UdpSockets {
    /// IPv4 socket.
    v4: Option<Arc<UdpSocket>>,
    /// IPv6 socket.
    v6: Option<Arc<UdpSocket>>,
}

impl UdpSockets {
    /// Return the socket for sending to `dest`, binding it (and
    /// starting its reader) if needed.
    async fn for_dest(
        &mut self,
        dest: &SocketAddr,
        ctx: &ExitCtx,
        tasks: &mut TaskSet,
    ) -> io::Result<Arc<UdpSocket>> {
        let (slot, bind): (_, SocketAddr) = if dest.is_ipv4() {
            (&mut self.v4, (Ipv4Addr::UNSPECIFIED, 0).into())
        } else {
            (&mut self.v6, (Ipv6Addr::UNSPECIFIED, 0).into())
        };
        if let Some(s) = slot {
            return Ok(Arc::clone(s));
        }
        let sock = Arc::new(UdpSocket::bind(bind).await?);
        debug!(
            "{:?}: exit bound UDP socket on {}",
            ctx.key.1,
            sock.local_addr()?
        );
        tasks.push(tokio::spawn(udp_reader(Arc::clone(&sock), ctx.clone())));
        *slot = Some(Arc::clone(&sock));
        Ok(sock)
    }
}

/// Main loop for an exit.
async fn run_exit(mut rx: mpsc::UnboundedReceiver<DataMsg>, ctx: ExitCtx) {
    let mut sockets = UdpSockets::default();
    let mut streams: HashMap<StreamId, mpsc::UnboundedSender<Vec<u8>>> = HashMap::new();
    let mut tasks = TaskSet::default();

    while let Some(msg) = rx.next().await {
        match msg {
            DataMsg::Datagram { target, payload } => {
                let dest = match resolve(&target).await {
                    Ok(d) => d,
                    Err(e) => {
                        debug!("{:?}: can't resolve {}: {}", ctx.key.1, target, e);
                        continue;
                    }
                };
                let sock = match sockets.for_dest(&dest, &ctx, &mut tasks).await {
                    Ok(s) => s,
                    Err(e) => {
                        debug!("{:?}: can't bind exit socket: {}", ctx.key.1, e);
                        ctx.fail(DestroyReason::CONNECTFAILED);
                        return;
                    }
                };
                match sock.send_to(&payload[..], dest).await {
                    Ok(n) => ctx.count_up(n),
                    Err(e) => {
                        debug!("{:?}: exit send to {} failed: {}", ctx.key.1, dest, e);
                        ctx.fail(DestroyReason::CONNECTFAILED);
                        return;
                    }
                }
            }
            DataMsg::Begin { stream_id, target } => {
                if streams.contains_key(&stream_id) {
                    debug!("{:?}: stream {} opened twice", ctx.key.1, stream_id);
                    continue;
                }
                let (tx, writes) = mpsc::unbounded();
                streams.insert(stream_id, tx);
                tasks.push(tokio::spawn(run_stream(
                    stream_id,
                    target,
                    writes,
                    ctx.clone(),
                )));
            }
            DataMsg::StreamData { stream_id, data } => {
                if let Some(tx) = streams.get(&stream_id) {
                    if tx.unbounded_send(data).is_err() {
                        streams.remove(&stream_id);
                    }
                }
            }
            DataMsg::End { stream_id, .. } => {
                streams.remove(&stream_id);
            }
            other => {
                debug!("{:?}: unexpected {:?} at exit", ctx.key.1, other.cmd());
            }
        }
    }
}

/// Read datagrams from the Internet and send them back on the circuit.
async fn udp_reader(sock: Arc<UdpSocket>, ctx: ExitCtx) {
    let mut buf = vec![0_u8; 65536];
    loop {
        ctx.bp.wait_for_room().await;
        match sock.recv_from(&mut buf[..]).await {
            Ok((n, src)) => {
                ctx.count_down(n);
                let msg = DataMsg::Datagram {
                    target: src.into(),
                    payload: buf[..n].to_vec(),
                };
                if !ctx.post(&msg) {
                    return;
                }
            }
            Err(e) => {
                debug!("{:?}: exit socket failed: {}", ctx.key.1, e);
                ctx.fail(DestroyReason::CONNECTFAILED);
                return;
            }
        }
    }
}

/// Map a connection error to the reason we give the originator.
fn end_reason(e: &io::Error) -> EndReason {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => EndReason::CONNECTREFUSED,
        io::ErrorKind::TimedOut => EndReason::TIMEOUT,
        io::ErrorKind::NotFound => EndReason::RESOLVEFAILED,
        _ => EndReason::MISC,
    }
}

/// Connect one TCP stream and shuttle bytes until either side ends it.
async fn run_stream(
    stream_id: StreamId,
    target: TargetAddr,
    mut writes: mpsc::UnboundedReceiver<Vec<u8>>,
    ctx: ExitCtx,
) {
    let end = |reason| DataMsg::End { stream_id, reason };
    let conn = async {
        let addr = resolve(&target).await?;
        TcpStream::connect(addr).await
    };
    let conn = match tokio::time::timeout(CONNECT_TIMEOUT, conn).await {
        Ok(Ok(c)) => c,
        Ok(Err(e)) => {
            debug!("{:?}: stream {} to {} failed: {}", ctx.key.1, stream_id, target, e);
            ctx.post(&end(end_reason(&e)));
            return;
        }
        Err(_) => {
            debug!("{:?}: stream {} to {} timed out", ctx.key.1, stream_id, target);
            ctx.post(&end(EndReason::TIMEOUT));
            return;
        }
    };
    trace!("{:?}: stream {} connected to {}", ctx.key.1, stream_id, target);
    if !ctx.post(&DataMsg::Connected { stream_id }) {
        return;
    }

    let (mut r, mut w) = conn.into_split();
    let mut buf = vec![0_u8; STREAM_CHUNK];
    loop {
        tokio::select! {
            n = async {
                ctx.bp.wait_for_room().await;
                r.read(&mut buf[..]).await
            } => match n {
                Ok(0) => {
                    ctx.post(&end(EndReason::DONE));
                    return;
                }
                Ok(n) => {
                    ctx.count_down(n);
                    let msg = DataMsg::StreamData {
                        stream_id,
                        data: buf[..n].to_vec(),
                    };
                    if !ctx.post(&msg) {
                        return;
                    }
                }
                Err(e) => {
                    debug!("{:?}: stream {} read failed: {}", ctx.key.1, stream_id, e);
                    ctx.post(&end(EndReason::MISC));
                    return;
                }
            },
            data = writes.next() => match data {
                Some(data) => {
                    if let Err(e) = w.write_all(&data[..]).await {
                        debug!("{:?}: stream {} write failed: {}", ctx.key.1, stream_id, e);
                        ctx.post(&end(EndReason::MISC));
                        return;
                    }
                    ctx.count_up(data.len());
                }
                None => {
                    let _ = w.shutdown().await;
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn watermarks() {
        let bp = Arc::new(Backpressure::default());
        let mut tokens: Vec<BpToken> = (0..HIGH_WATER).map(|_| bp.token()).collect();
        assert_eq!(bp.queued(), HIGH_WATER);

        let waiter = {
            let bp = Arc::clone(&bp);
            tokio::spawn(async move { bp.wait_for_room().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        // Dropping to just above the low mark isn't enough.
        tokens.truncate(LOW_WATER + 1);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tokens.pop();
        waiter.await.unwrap();
        assert_eq!(bp.queued(), LOW_WATER);
    }

    #[tokio::test]
    async fn room_below_high() {
        let bp = Arc::new(Backpressure::default());
        let _t = bp.token();
        // returns at once
        bp.wait_for_room().await;
    }

    #[tokio::test]
    async fn bytes_are_counted_per_exit() {
        let echo = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0_u8; 256];
            while let Ok((n, from)) = echo.recv_from(&mut buf[..]).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let (tx, mut rx) = mpsc::unbounded();
        let stats = Arc::new(TunnelStats::default());
        let key = (tunnel_llcrypto::pk::PeerId::from([3; 32]), 9.into());
        let ent = ExitEnt::launch(key, ReactorHandle::from_sender(tx), Arc::clone(&stats));
        assert!(ent.deliver(DataMsg::Datagram {
            target: TargetAddr::Ip(echo_addr),
            payload: b"hello".to_vec(),
        }));

        let reply = tokio::time::timeout(Duration::from_secs(5), rx.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reply, CtrlMsg::ExitData { .. }));
        assert_eq!(ent.bytes_up(), 5);
        assert_eq!(ent.bytes_down(), 5);
        assert_eq!(stats.snapshot().exit_bytes_up, 5);
        assert_eq!(stats.snapshot().exit_bytes_down, 5);
    }

    #[test]
    fn reasons() {
        let e = io::Error::new(io::ErrorKind::ConnectionRefused, "no");
        assert_eq!(end_reason(&e), EndReason::CONNECTREFUSED);
        let e = io::Error::new(io::ErrorKind::Other, "no");
        assert_eq!(end_reason(&e), EndReason::MISC);
    }
}
