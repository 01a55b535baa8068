//! Types to implement the SOCKS5 handshake.

use crate::msg::{status_reply, SocksAddr, SocksCmd, SocksRequest, SocksStatus};
use crate::{Error, Result};

use tunnel_bytes::Reader;

/// Constant for "no authentication".
const NO_AUTHENTICATION: u8 = 0x00;
/// Reply method meaning "none of your methods are acceptable".
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

/// An ongoing SOCKS handshake.
///
/// To perform a handshake, call the [SocksHandshake::handshake]
/// method repeatedly with new inputs, until the resulting [Action]
/// has `finished` set to true.  Then, if the client asked for
/// something we can do, [SocksHandshake::into_request] returns it.
#[derive(Clone, Debug)]
pub struct SocksHandshake {
    /// Current state of the handshake. Each completed message
    /// advances the state.
    state: State,
    /// Completed SOCKS handshake.
    handshake: Option<SocksRequest>,
}

/// Possible state for a Socks connection.
///
/// Each completed message advances the state.
#[derive(Clone, Debug, Copy, PartialEq)]
enum State {
    /// Starting state: no messages have been handled yet.
    Initial,
    /// We've agreed on no authentication, and we're waiting for the
    /// actual request.
    Socks5Wait,
    /// Ending (successful) state: the client has sent all its messages.
    ///
    /// (Note that we still need to send a reply.)
    Done,
    /// Ending state: we've sent the client a refusal.
    Failed,
}

/// An action to take in response to a SOCKS handshake message.
#[derive(Clone, Debug)]
pub struct Action {
    /// If nonzero, this many bytes should be drained from the
    /// client's inputs.
    pub drain: usize,
    /// If nonempty, this reply should be sent to the client.
    pub reply: Vec<u8>,
    /// If true, then this handshake is over, either successfully or not.
    pub finished: bool,
}

impl SocksHandshake {
    /// Construct a new SocksHandshake in its initial state
    pub fn new() -> Self {
        SocksHandshake {
            state: State::Initial,
            handshake: None,
        }
    }

    /// Try to advance a SocksHandshake, given some client input in
    /// `input`.
    ///
    /// If there isn't enough input, gives [Error::Truncated].  Other
    /// errors indicate a failure.
    ///
    /// On success, return an Action describing what to tell the client,
    /// and how much of its input to consume.
    pub fn handshake(&mut self, input: &[u8]) -> Result<Action> {
        if input.is_empty() {
            return Err(Error::Truncated);
        }
        match (self.state, input[0]) {
            (State::Initial, 5) => self.s5_initial(input),
            (State::Initial, v) => Err(Error::BadProtocol(v)),
            (State::Socks5Wait, 5) => self.s5(input),
            (State::Done, _) | (State::Failed, _) => Err(Error::AlreadyFinished),
            (_, _) => Err(Error::Syntax),
        }
    }

    /// Socks5: initial handshake to negotiate authentication method.
    fn s5_initial(&mut self, input: &[u8]) -> Result<Action> {
        let mut r = Reader::from_slice(input);
        let _version = r.take_u8()?;
        let nmethods = r.take_u8()?;
        let methods = r.take(nmethods as usize)?;

        if methods.contains(&NO_AUTHENTICATION) {
            self.state = State::Socks5Wait;
            Ok(Action {
                drain: r.consumed(),
                reply: vec![5, NO_AUTHENTICATION],
                finished: false,
            })
        } else {
            self.state = State::Failed;
            Ok(Action {
                drain: r.consumed(),
                reply: vec![5, NO_ACCEPTABLE_METHODS],
                finished: true,
            })
        }
    }

    /// Socks5: final step, to receive client's request.
    fn s5(&mut self, input: &[u8]) -> Result<Action> {
        let mut r = Reader::from_slice(input);

        let _version = r.take_u8()?;
        let cmd: SocksCmd = r.take_u8()?.into();
        let _ignore = r.take_u8()?;
        let addr: SocksAddr = r.extract()?;
        let port = r.take_u16()?;

        let request = match SocksRequest::new(cmd, addr, port) {
            Ok(request) => request,
            Err(Error::NoSupport) => {
                self.state = State::Failed;
                return Ok(Action {
                    drain: r.consumed(),
                    reply: status_reply(SocksStatus::COMMAND_NOT_SUPPORTED, None),
                    finished: true,
                });
            }
            Err(e) => return Err(e),
        };

        self.state = State::Done;
        self.handshake = Some(request);

        Ok(Action {
            drain: r.consumed(),
            reply: Vec::new(),
            finished: true,
        })
    }

    /// Return true if this handshake is finished.
    pub fn finished(&self) -> bool {
        matches!(self.state, State::Done | State::Failed)
    }

    /// Consume this handshake's state; if it finished successfully,
    /// return a SocksRequest.
    pub fn into_request(self) -> Option<SocksRequest> {
        self.handshake
    }
}

impl Default for SocksHandshake {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use hex_literal::hex;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn socks5_connect() {
        let mut h = SocksHandshake::new();
        let a = h.handshake(&hex!("05 02 00 02")[..]).unwrap();
        assert_eq!(a.drain, 4);
        assert_eq!(a.reply, vec![5, 0]);
        assert!(!a.finished);

        let a = h
            .handshake(&hex!("05 01 00 01 c0000201 01bb")[..])
            .unwrap();
        assert!(a.finished);
        assert!(a.reply.is_empty());
        assert_eq!(a.drain, 10);
        assert!(h.finished());
        let req = h.into_request().unwrap();
        assert_eq!(req.command(), SocksCmd::CONNECT);
        assert_eq!(
            req.addr(),
            &SocksAddr::Ip(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))
        );
        assert_eq!(req.port(), 443);
        assert_eq!(
            req.reply(SocksStatus::SUCCEEDED, Some("127.0.0.1:5000".parse().unwrap())),
            hex!("05 00 00 01 7f000001 1388").to_vec()
        );
    }

    #[test]
    fn socks5_hostname_udp() {
        let mut h = SocksHandshake::new();
        h.handshake(&hex!("05 01 00")[..]).unwrap();
        let mut req = hex!("05 03 00 03").to_vec();
        req.push(11);
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&[0, 0]);
        let a = h.handshake(&req[..]).unwrap();
        assert!(a.finished);
        let req = h.into_request().unwrap();
        assert_eq!(req.command(), SocksCmd::UDP_ASSOCIATE);
        assert_eq!(req.addr().to_string(), "example.com");
    }

    #[test]
    fn truncated() {
        let mut h = SocksHandshake::new();
        assert_eq!(h.handshake(&hex!("05 02 00")[..]).err(), Some(Error::Truncated));
        assert_eq!(h.handshake(&[]).err(), Some(Error::Truncated));
        h.handshake(&hex!("05 01 00")[..]).unwrap();
        assert_eq!(
            h.handshake(&hex!("05 01 00 01 c000")[..]).err(),
            Some(Error::Truncated)
        );
    }

    #[test]
    fn refusals() {
        // SOCKS4 is not for us.
        let mut h = SocksHandshake::new();
        assert_eq!(
            h.handshake(&hex!("04 01 0050 7f000001 00")[..]).err(),
            Some(Error::BadProtocol(4))
        );

        // Username/password only.
        let mut h = SocksHandshake::new();
        let a = h.handshake(&hex!("05 01 02")[..]).unwrap();
        assert_eq!(a.reply, vec![5, 0xFF]);
        assert!(a.finished);
        assert!(h.clone().into_request().is_none());
        assert_eq!(h.handshake(&hex!("05")[..]).err(), Some(Error::AlreadyFinished));

        // BIND.
        let mut h = SocksHandshake::new();
        h.handshake(&hex!("05 01 00")[..]).unwrap();
        let a = h
            .handshake(&hex!("05 02 00 01 7f000001 0050")[..])
            .unwrap();
        assert!(a.finished);
        assert_eq!(a.reply, hex!("05 07 00 01 00000000 0000").to_vec());
        assert!(h.into_request().is_none());

        // Unknown address type.
        let mut h = SocksHandshake::new();
        h.handshake(&hex!("05 01 00")[..]).unwrap();
        assert_eq!(
            h.handshake(&hex!("05 01 00 09 00")[..]).err(),
            Some(Error::Syntax)
        );
    }
}
