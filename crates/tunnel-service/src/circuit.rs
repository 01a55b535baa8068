//! Handles for circuits this peer originates.
//!
//! A [`ClientCirc`] is a cheap, cloneable reference to a circuit that
//! lives in the reactor.  When the last clone is dropped, the circuit
//! is closed.

use crate::reactor::{CtrlMsg, HopDone, ReactorHandle};
use crate::{Error, Result};

use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;
use tunnel_cell::datamsg::{DataMsg, EndReason, StreamId, TargetAddr, STREAM_DATA_OVERHEAD};
use tunnel_cell::msg::{CellMsg, DestroyReason};
use tunnel_proto::circuit::UniqId;
use tunnel_proto::crypto::cell::max_plaintext;
use tunnel_proto::peer::PeerHandle;

/// The part of a circuit handle that is shared between clones.
#[derive(Debug)]
struct CircInner {
    /// Logging identifier; also the reactor's key for this circuit.
    unique_id: UniqId,
    /// Number of hops when complete.
    hops: u8,
    /// True if the last hop is an exit.
    exit: bool,
    /// The reactor that owns the circuit.
    reactor: ReactorHandle,
    /// Set by the reactor once the circuit is gone.
    closed: Arc<AtomicBool>,
}

impl Drop for CircInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            trace!("{}: last handle dropped; closing", self.unique_id);
            let _ = self.reactor.send(CtrlMsg::Close {
                circ: self.unique_id,
                reason: DestroyReason::FINISHED,
            });
        }
    }
}

/// A circuit that we have constructed over the tunnel overlay.
#[derive(Clone, Debug)]
pub struct ClientCirc {
    /// Shared state.
    inner: Arc<CircInner>,
}

/// Something that happened on a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum StreamEvent {
    /// The exit connected.
    Connected,
    /// Bytes from the exit.
    Data(Vec<u8>),
    /// The stream is closed.
    End(EndReason),
}

impl ClientCirc {
    /// Make a handle for a circuit the reactor just created.
    pub(crate) fn new(
        unique_id: UniqId,
        hops: u8,
        exit: bool,
        reactor: ReactorHandle,
        closed: Arc<AtomicBool>,
    ) -> Self {
        ClientCirc {
            inner: Arc::new(CircInner {
                unique_id,
                hops,
                exit,
                reactor,
                closed,
            }),
        }
    }

    /// Return the logging identifier for this circuit.
    pub fn unique_id(&self) -> UniqId {
        self.inner.unique_id
    }

    /// Return the number of hops this circuit has when complete.
    pub fn n_hops(&self) -> u8 {
        self.inner.hops
    }

    /// Return true if this circuit ends at an exit.
    pub fn wants_exit(&self) -> bool {
        self.inner.exit
    }

    /// Return true if this circuit is closed or closing.
    pub fn is_closing(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Return the largest message body that fits in one cell on this
    /// circuit.
    pub fn max_payload(&self) -> usize {
        max_plaintext(usize::from(self.inner.hops))
    }

    /// Ask the reactor to extend this circuit to `target`.
    pub(crate) fn extend(&self, target: PeerHandle) -> Result<HopDone> {
        let (done, rx) = oneshot::channel();
        self.inner.reactor.send(CtrlMsg::Extend {
            circ: self.unique_id(),
            target,
            done,
        })?;
        Ok(rx)
    }

    /// Send `msg` to the last hop.
    pub(crate) fn send_msg(&self, msg: CellMsg) -> Result<()> {
        if self.is_closing() {
            return Err(Error::Transport(format!("{} is closed", self.unique_id())));
        }
        self.inner.reactor.send(CtrlMsg::Send {
            circ: self.unique_id(),
            msg,
        })
    }

    /// Send one UDP datagram to `target` through the exit.
    ///
    /// Datagrams that don't fit in one cell are refused.
    pub fn send_datagram(&self, target: TargetAddr, payload: &[u8]) -> Result<()> {
        let msg = DataMsg::Datagram {
            target,
            payload: payload.to_vec(),
        };
        let len = msg.encode().map(|b| b.len()).map_err(Error::from)?;
        if len > self.max_payload() {
            return Err(Error::Protocol(format!(
                "{}-byte datagram is too big for a {}-hop circuit",
                payload.len(),
                self.n_hops()
            )));
        }
        self.send_msg(CellMsg::Data(msg))
    }

    /// Return a stream of the datagrams that arrive on this circuit,
    /// with the address they came from.
    ///
    /// Only the most recent receiver gets datagrams.
    pub fn datagrams(&self) -> mpsc::UnboundedReceiver<(TargetAddr, Vec<u8>)> {
        let (sink, rx) = mpsc::unbounded();
        let _ = self.inner.reactor.send(CtrlMsg::ListenDatagrams {
            circ: self.unique_id(),
            sink,
        });
        rx
    }

    /// Return a stream of the hidden-swarm messages that arrive on this
    /// circuit.
    pub(crate) fn events(&self) -> mpsc::UnboundedReceiver<CellMsg> {
        let (sink, rx) = mpsc::unbounded();
        let _ = self.inner.reactor.send(CtrlMsg::ListenEvents {
            circ: self.unique_id(),
            sink,
        });
        rx
    }

    /// Send a PING to the last hop and wait for the answer.
    ///
    /// Returns the round-trip time.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration> {
        let start = Instant::now();
        let (reply, rx) = oneshot::channel();
        self.inner.reactor.send(CtrlMsg::Ping {
            circ: self.unique_id(),
            reply,
        })?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(start.elapsed()),
            Ok(Err(_)) => Err(Error::Transport("circuit closed before PONG".into())),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Open a TCP stream to `target` through the exit.
    pub async fn begin_stream(&self, target: TargetAddr) -> Result<DataStream> {
        if !self.wants_exit() {
            return Err(Error::Policy("streams need an exit circuit".into()));
        }
        let (sink, mut events) = mpsc::unbounded();
        let uid = self.unique_id();
        let stream_id = self
            .inner
            .reactor
            .call(|reply| CtrlMsg::OpenStream {
                circ: uid,
                target,
                sink,
                reply,
            })
            .await?;
        let guard = Arc::new(StreamGuard {
            circ: self.clone(),
            stream_id,
        });
        match events.next().await {
            Some(StreamEvent::Connected) => (),
            Some(StreamEvent::End(reason)) => {
                return Err(Error::Transport(format!("exit refused stream: {}", reason)))
            }
            Some(StreamEvent::Data(_)) => {
                return Err(Error::Protocol("data before stream connected".into()))
            }
            None => return Err(Error::Transport("circuit closed".into())),
        }
        Ok(DataStream {
            reader: DataReader {
                events,
                done: false,
                _guard: Arc::clone(&guard),
            },
            writer: DataWriter {
                chunk: self.max_payload() - STREAM_DATA_OVERHEAD,
                guard,
            },
        })
    }

    /// Close this circuit, sending DESTROY with `reason`.
    pub(crate) fn terminate_with(&self, reason: DestroyReason) {
        let _ = self.inner.reactor.send(CtrlMsg::Close {
            circ: self.unique_id(),
            reason,
        });
    }

    /// Close this circuit, even if other handles to it remain.
    pub fn terminate(&self) {
        self.terminate_with(DestroyReason::FINISHED);
    }
}

/// Closes a stream when both halves are gone.
#[derive(Debug)]
struct StreamGuard {
    /// The circuit the stream is on.
    circ: ClientCirc,
    /// The stream.
    stream_id: StreamId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let _ = self.circ.inner.reactor.send(CtrlMsg::CloseStream {
            circ: self.circ.unique_id(),
            stream_id: self.stream_id,
        });
    }
}

/// A TCP stream carried to an exit over a circuit.
#[derive(Debug)]
pub struct DataStream {
    /// Reading half.
    reader: DataReader,
    /// Writing half.
    writer: DataWriter,
}

impl DataStream {
    /// Split this stream into a reader and a writer.
    pub fn split(self) -> (DataReader, DataWriter) {
        (self.reader, self.writer)
    }
}

/// The reading half of a [`DataStream`].
#[derive(Debug)]
pub struct DataReader {
    /// Events from the reactor.
    events: mpsc::UnboundedReceiver<StreamEvent>,
    /// True once the stream has ended.
    done: bool,
    /// Keeps the stream open.
    _guard: Arc<StreamGuard>,
}

impl DataReader {
    /// Return the next chunk of bytes from the exit, or None if the exit
    /// closed the stream cleanly.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        loop {
            match self.events.next().await {
                Some(StreamEvent::Data(d)) => return Ok(Some(d)),
                Some(StreamEvent::Connected) => continue,
                Some(StreamEvent::End(EndReason::DONE)) => {
                    self.done = true;
                    return Ok(None);
                }
                Some(StreamEvent::End(reason)) => {
                    self.done = true;
                    return Err(Error::Transport(format!("stream closed: {}", reason)));
                }
                None => {
                    self.done = true;
                    return Err(Error::Transport("circuit closed".into()));
                }
            }
        }
    }
}

/// The writing half of a [`DataStream`].
#[derive(Debug)]
pub struct DataWriter {
    /// Largest chunk that fits one cell.
    chunk: usize,
    /// The stream, and the circuit it's on.
    guard: Arc<StreamGuard>,
}

impl DataWriter {
    /// Send `data` to the exit, split into as many cells as needed.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        for piece in data.chunks(self.chunk) {
            self.guard.circ.send_msg(CellMsg::Data(DataMsg::StreamData {
                stream_id: self.guard.stream_id,
                data: piece.to_vec(),
            }))?;
        }
        Ok(())
    }
}
