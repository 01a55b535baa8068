//! The SOCKS5 frontend: one local listener per hop count.
//!
//! A CONNECT is carried as a stream over an exit circuit of the
//! listener's hop count.  A UDP ASSOCIATE gets a local UDP socket whose
//! datagrams are sent through an exit circuit of its own, or to a
//! hidden session when their destination is a synthetic hidden address.
//! A listener for hop count 0 skips the tunnels and connects directly.

use crate::circmgr::CircMgr;
use crate::circuit::ClientCirc;
use crate::hidden::{is_hidden_addr, HiddenSwarms, SinkId};
use crate::{Error, Result, TunnelConfig};

use futures::channel::mpsc;
use futures::StreamExt;
use std::convert::TryFrom;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, trace, warn};
use tunnel_cell::datamsg::TargetAddr;
use tunnel_socksproto::{
    decode_udp_datagram, encode_udp_datagram, SocksAddr, SocksCmd, SocksHandshake,
    SocksHostname, SocksRequest, SocksStatus,
};

/// What a SOCKS connection needs from the tunnel service.
pub(crate) struct SocksCtx {
    /// Where circuits come from.
    pub(crate) mgr: Arc<CircMgr>,
    /// Hidden sessions.
    pub(crate) hidden: Arc<HiddenSwarms>,
    /// Configuration.
    pub(crate) config: Arc<TunnelConfig>,
}

/// Accept connections on `listener` forever, handling each in its own
/// task.
pub(crate) async fn run_socks_listener(listener: TcpListener, hops: u8, ctx: Arc<SocksCtx>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                warn!("{}-hop SOCKS listener failed: {}", hops, e);
                return;
            }
        };
        trace!("{}-hop SOCKS connection from {}", hops, peer);
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(e) = handle_socks_conn(ctx, hops, stream).await {
                debug!("SOCKS connection from {} ended: {}", peer, e);
            }
        });
    }
}

/// Given a just-received TCP connection on a SOCKS port, run the SOCKS
/// handshake, then carry the request over the tunnels.
async fn handle_socks_conn(ctx: Arc<SocksCtx>, hops: u8, stream: TcpStream) -> Result<()> {
    let local = stream.local_addr()?;
    let (mut socks_r, mut socks_w) = stream.into_split();

    // SOCKS5 always needs at least two round trips, so this runs in a
    // loop.
    let mut handshake = SocksHandshake::new();
    let mut inbuf = [0_u8; 1024];
    let mut n_read = 0;
    let request = loop {
        if n_read == inbuf.len() {
            return Err(Error::Protocol("SOCKS handshake too long".into()));
        }
        let n = socks_r.read(&mut inbuf[n_read..]).await?;
        if n == 0 {
            return Err(Error::Transport("SOCKS client went away".into()));
        }
        n_read += n;

        let action = match handshake.handshake(&inbuf[..n_read]) {
            Err(tunnel_socksproto::Error::Truncated) => continue,
            Err(e) => return Err(e.into()),
            Ok(action) => action,
        };
        if action.drain > 0 {
            inbuf.copy_within(action.drain..n_read, 0);
            n_read -= action.drain;
        }
        if !action.reply.is_empty() {
            socks_w.write_all(&action.reply[..]).await?;
        }
        if action.finished {
            break handshake.into_request();
        }
    };
    let request = match request {
        Some(r) => r,
        // We already sent the refusal.
        None => return Ok(()),
    };
    info!(
        "{}-hop SOCKS request: {} {}:{}",
        hops,
        request.command(),
        request.addr(),
        request.port()
    );

    match request.command() {
        SocksCmd::CONNECT => connect(ctx, hops, &request, socks_r, socks_w).await,
        SocksCmd::UDP_ASSOCIATE => associate(ctx, hops, &request, local, socks_r, socks_w).await,
        _ => {
            let reply = request.reply(SocksStatus::COMMAND_NOT_SUPPORTED, None);
            socks_w.write_all(&reply[..]).await?;
            Ok(())
        }
    }
}

/// Return the tunnel address for a SOCKS address and port.
fn target_addr(addr: &SocksAddr, port: u16) -> TargetAddr {
    match addr {
        SocksAddr::Ip(ip) => TargetAddr::Ip(SocketAddr::new(*ip, port)),
        SocksAddr::Hostname(h) => TargetAddr::Hostname(h.as_ref().to_owned(), port),
    }
}

/// Return the SOCKS address and port for a tunnel address.
fn socks_addr(addr: &TargetAddr) -> Option<(SocksAddr, u16)> {
    match addr {
        TargetAddr::Ip(a) => Some((SocksAddr::Ip(a.ip()), a.port())),
        TargetAddr::Hostname(h, p) => SocksHostname::try_from(h.clone())
            .ok()
            .map(|h| (SocksAddr::Hostname(h), *p)),
        _ => None,
    }
}

/// Wait for a ready exit circuit, for no longer than a circuit build.
async fn exit_circuit(ctx: &SocksCtx, hops: u8) -> Result<ClientCirc> {
    let limit = ctx.config.circuit_build_timeout;
    tokio::time::timeout(limit, ctx.mgr.get_or_launch(hops, true)).await?
}

/// Wait for an exit circuit that no other session uses.
///
/// Datagrams coming back on a circuit carry no session, so a UDP
/// association needs a circuit to itself.
async fn own_exit_circuit(ctx: &SocksCtx, hops: u8) -> Result<ClientCirc> {
    let limit = ctx.config.circuit_build_timeout;
    tokio::time::timeout(limit, ctx.mgr.claim(hops, true)).await?
}

/// Send a failure reply.
async fn refuse(socks_w: &mut OwnedWriteHalf, request: &SocksRequest, e: &Error) -> Result<()> {
    debug!("refusing SOCKS request: {}", e);
    let reply = request.reply(SocksStatus::GENERAL_FAILURE, None);
    socks_w.write_all(&reply[..]).await?;
    Ok(())
}

/// Handle a CONNECT request.
async fn connect(
    ctx: Arc<SocksCtx>,
    hops: u8,
    request: &SocksRequest,
    mut socks_r: OwnedReadHalf,
    mut socks_w: OwnedWriteHalf,
) -> Result<()> {
    let target = target_addr(request.addr(), request.port());
    if hops == 0 {
        return connect_direct(ctx, request, target, socks_r, socks_w).await;
    }

    let circ = match exit_circuit(&ctx, hops).await {
        Ok(c) => c,
        Err(e) => return refuse(&mut socks_w, request, &e).await,
    };
    let stream = match circ.begin_stream(target.clone()).await {
        Ok(s) => s,
        Err(e) => return refuse(&mut socks_w, request, &e).await,
    };
    info!("{}: stream open to {}", circ.unique_id(), target);
    let bound = socks_w.as_ref().local_addr().ok();
    let reply = request.reply(SocksStatus::SUCCEEDED, bound);
    socks_w.write_all(&reply[..]).await?;

    let (mut reader, writer) = stream.split();
    let upstream = async {
        let mut buf = vec![0_u8; 4096];
        loop {
            let n = socks_r.read(&mut buf[..]).await?;
            if n == 0 {
                return Ok::<(), Error>(());
            }
            writer.write(&buf[..n])?;
        }
    };
    let downstream = async {
        while let Some(data) = reader.recv().await? {
            socks_w.write_all(&data[..]).await?;
        }
        socks_w.shutdown().await?;
        Ok::<(), Error>(())
    };
    tokio::pin!(downstream);

    tokio::select! {
        r = upstream => {
            // The client finished sending; let the replies drain.
            r?;
            (&mut downstream).await
        }
        r = &mut downstream => r,
    }
}

/// Handle a CONNECT on the 0-hop listener: no tunnel, no anonymity.
async fn connect_direct(
    ctx: Arc<SocksCtx>,
    request: &SocksRequest,
    target: TargetAddr,
    socks_r: OwnedReadHalf,
    mut socks_w: OwnedWriteHalf,
) -> Result<()> {
    let limit = ctx.config.circuit_build_timeout;
    let attempt = async {
        let dest = resolve(&target).await?;
        Ok::<_, Error>(TcpStream::connect(dest).await?)
    };
    let outbound = match tokio::time::timeout(limit, attempt).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return refuse(&mut socks_w, request, &e).await,
        Err(_) => return refuse(&mut socks_w, request, &Error::Timeout).await,
    };
    let reply = request.reply(SocksStatus::SUCCEEDED, outbound.local_addr().ok());
    socks_w.write_all(&reply[..]).await?;

    let mut client = socks_r.reunite(socks_w).map_err(|e| Error::Internal(e.to_string()))?;
    let mut outbound = outbound;
    tokio::io::copy_bidirectional(&mut client, &mut outbound).await?;
    Ok(())
}

/// Resolve `target` with the system resolver.
async fn resolve(target: &TargetAddr) -> Result<SocketAddr> {
    match target {
        TargetAddr::Ip(a) => Ok(*a),
        TargetAddr::Hostname(h, p) => tokio::net::lookup_host((h.as_str(), *p))
            .await?
            .next()
            .ok_or_else(|| Error::Transport(format!("{} has no addresses", h))),
        _ => Err(Error::Protocol("unsupported address type".into())),
    }
}

/// Return the next item from `rx`, or wait forever if there is none.
async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.next().await,
        None => futures::future::pending().await,
    }
}

/// Largest datagram we read from a socket.
const UDP_BUF: usize = 65536;

/// The state of one UDP association.
struct Association {
    /// Hop count.
    hops: u8,
    /// The socket the SOCKS client talks to.
    sock: UdpSocket,
    /// The SOCKS client's UDP address, once we've heard from it.
    client: Option<SocketAddr>,
    /// Our own exit circuit, once we have needed one.
    circ: Option<ClientCirc>,
    /// Our sink for hidden-session datagrams.
    hidden_sink: Option<SinkId>,
}

impl Association {
    /// Wrap a datagram from `from` and pass it to the SOCKS client.
    async fn to_client(&self, from: &TargetAddr, payload: &[u8]) {
        let client = match self.client {
            Some(c) => c,
            None => return,
        };
        if let Some((addr, port)) = socks_addr(from) {
            let pkt = encode_udp_datagram(&addr, port, payload);
            if let Err(e) = self.sock.send_to(&pkt[..], client).await {
                debug!("couldn't pass datagram to SOCKS client: {}", e);
            }
        }
    }
}

/// Handle a UDP ASSOCIATE request.
async fn associate(
    ctx: Arc<SocksCtx>,
    hops: u8,
    request: &SocksRequest,
    local: SocketAddr,
    mut socks_r: OwnedReadHalf,
    mut socks_w: OwnedWriteHalf,
) -> Result<()> {
    let sock = UdpSocket::bind(SocketAddr::new(local.ip(), 0)).await?;
    let bound = sock.local_addr()?;
    let reply = request.reply(SocksStatus::SUCCEEDED, Some(bound));
    socks_w.write_all(&reply[..]).await?;
    info!("{}-hop UDP association on {}", hops, bound);

    let (mut hidden_rx, hidden_sink) = if hops > 0 {
        let (tx, rx) = mpsc::unbounded();
        let id = ctx.hidden.register_sink(hops, tx)?;
        (Some(rx), Some(id))
    } else {
        (None, None)
    };

    let mut circ_rx = None;
    let mut assoc = Association {
        hops,
        sock,
        client: None,
        circ: None,
        hidden_sink,
    };
    let mut buf = vec![0_u8; UDP_BUF];
    let mut ctl = [0_u8; 64];
    loop {
        tokio::select! {
            r = assoc.sock.recv_from(&mut buf[..]) => {
                let (n, from) = r?;
                if assoc.client.is_none() || assoc.client == Some(from) {
                    assoc.client = Some(from);
                    if let Err(e) = from_client(&ctx, &mut assoc, &mut circ_rx, &buf[..n]).await {
                        debug!("dropped datagram from SOCKS client: {}", e);
                    }
                } else if assoc.hops == 0 {
                    assoc.to_client(&TargetAddr::Ip(from), &buf[..n]).await;
                } else {
                    trace!("ignoring datagram from stranger {}", from);
                }
            }
            d = recv_opt(&mut circ_rx) => match d {
                Some((from, payload)) => assoc.to_client(&from, &payload[..]).await,
                None => {
                    debug!("exit circuit for UDP association on {} closed", bound);
                    circ_rx = None;
                    assoc.circ = None;
                }
            },
            d = recv_opt(&mut hidden_rx) => match d {
                Some((from, _infohash, payload)) => {
                    assoc.to_client(&TargetAddr::Ip(from), &payload[..]).await
                }
                None => hidden_rx = None,
            },
            r = socks_r.read(&mut ctl[..]) => match r {
                Ok(0) | Err(_) => break,
                Ok(_) => (),
            },
        }
    }
    info!("UDP association on {} closed", bound);
    Ok(())
}

/// Send one datagram from the SOCKS client on its way.
async fn from_client(
    ctx: &SocksCtx,
    assoc: &mut Association,
    circ_rx: &mut Option<mpsc::UnboundedReceiver<(TargetAddr, Vec<u8>)>>,
    packet: &[u8],
) -> Result<()> {
    let dgram = decode_udp_datagram(packet)?;
    let target = target_addr(&dgram.addr, dgram.port);

    if let TargetAddr::Ip(a) = &target {
        if is_hidden_addr(a) {
            if assoc.hops == 0 {
                return Err(Error::Policy("hidden swarms need at least one hop".into()));
            }
            return ctx.hidden.send(a, dgram.payload, assoc.hidden_sink);
        }
    }

    if assoc.hops == 0 {
        let dest = resolve(&target).await?;
        assoc.sock.send_to(dgram.payload, dest).await?;
        return Ok(());
    }

    let circ = match &assoc.circ {
        Some(c) if !c.is_closing() => c.clone(),
        _ => {
            let c = own_exit_circuit(ctx, assoc.hops).await?;
            *circ_rx = Some(c.datagrams());
            assoc.circ = Some(c.clone());
            c
        }
    };
    circ.send_datagram(target, dgram.payload)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn addr_conversions() {
        let ip: SocksAddr = SocksAddr::Ip("192.0.2.1".parse().unwrap());
        let t = target_addr(&ip, 443);
        assert_eq!(t, TargetAddr::Ip("192.0.2.1:443".parse().unwrap()));
        assert_eq!(socks_addr(&t), Some((ip, 443)));

        let host = SocksAddr::Hostname(SocksHostname::try_from("tracker.example".to_owned()).unwrap());
        let t = target_addr(&host, 6969);
        assert_eq!(t, TargetAddr::Hostname("tracker.example".into(), 6969));
        assert_eq!(socks_addr(&t), Some((host, 6969)));
    }
}
