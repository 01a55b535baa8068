//! Declare an error type for tunnel-service

use futures::channel::oneshot;
use thiserror::Error;

/// An error returned by the tunnel service.
///
/// Errors caused by a single circuit stay with that circuit: they are
/// logged, counted in [`TunnelStats`](crate::TunnelStats), and reported
/// to whoever was waiting on that circuit.  Only [`Error::Fatal`] is
/// meant to reach the enclosing application.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A peer link closed, or a send failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A peer sent something malformed, or something we didn't expect
    /// in our current state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A handshake failed, or a cell didn't authenticate.
    #[error("cryptographic failure: {0}")]
    Crypto(String),

    /// A circuit hop, a whole circuit, or a request took too long.
    #[error("operation timed out")]
    Timeout,

    /// The request isn't allowed here.
    #[error("refused by policy: {0}")]
    Policy(String),

    /// The service can't start with this configuration.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The service is shutting down, or already has.
    #[error("tunnel service is shut down")]
    Shutdown,

    /// A programming error, or a failure in a library we can't work
    /// around.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Return true if this error means the peer's keys or handshake
    /// were bad, so the peer should be cooled down.
    pub fn is_crypto(&self) -> bool {
        matches!(self, Error::Crypto(_))
    }
}

impl From<tunnel_proto::Error> for Error {
    fn from(e: tunnel_proto::Error) -> Error {
        use tunnel_proto::Error as E;
        match e {
            E::MissingKey | E::BadCellAuth | E::BadHandshake => Error::Crypto(e.to_string()),
            E::Internal(s) => Error::Internal(s.into()),
            _ => Error::Protocol(e.to_string()),
        }
    }
}

impl From<tunnel_cell::Error> for Error {
    fn from(e: tunnel_cell::Error) -> Error {
        Error::Protocol(e.to_string())
    }
}

impl From<oneshot::Canceled> for Error {
    fn from(_: oneshot::Canceled) -> Error {
        Error::Shutdown
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Error {
        Error::Timeout
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Transport(e.to_string())
    }
}

impl From<tunnel_socksproto::Error> for Error {
    fn from(e: tunnel_socksproto::Error) -> Error {
        Error::Protocol(format!("SOCKS: {}", e))
    }
}

impl From<tunnel_persist::Error> for Error {
    fn from(e: tunnel_persist::Error) -> Error {
        Error::Internal(format!("state storage: {}", e))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn proto_errors() {
        let e: Error = tunnel_proto::Error::BadCellAuth.into();
        assert!(e.is_crypto());
        let e: Error = tunnel_proto::Error::TooLong(2000).into();
        assert!(matches!(e, Error::Protocol(_)));
        let e: Error = tunnel_proto::Error::Internal("oops").into();
        assert_eq!(e.to_string(), "internal error: oops");
    }
}
