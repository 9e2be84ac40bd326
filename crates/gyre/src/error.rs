//! Framework errors.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// An error occuring in the reactor or on a connection.
///
/// The same type serves both planes: contract errors are returned
/// synchronously from the misused call, operational errors are captured on
/// the connection and delivered once through
/// [`Protocol::connection_lost`](crate::Protocol::connection_lost).
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The timer behind a `DelayedCall` already fired or was cancelled.
    #[error("timer was already cancelled")]
    AlreadyCancelled,

    /// The operation requires a running reactor.
    #[error("reactor is not running")]
    ReactorNotRunning,

    /// `run` was called on a reactor that is already running.
    #[error("reactor is already running")]
    ReactorAlreadyRunning,

    /// `stop_connecting` was called while no connect attempt was in flight.
    #[error("we're not trying to connect")]
    NotConnecting,

    /// `start_connecting` was called while a previous attempt is still live.
    #[error("can't connect in this state")]
    NotDisconnected,

    /// Graceful closure, locally initiated or peer EOF.
    #[error("connection closed cleanly")]
    ConnectionDone,

    /// The connection was aborted locally.
    #[error("connection was aborted locally")]
    ConnectionAbort,

    /// The connector was stopped before the connect completed.
    #[error("connection was aborted by the user")]
    UserAbort,

    /// The connect attempt did not complete in time.
    #[error("connection attempt timed out")]
    Timeout,

    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    /// A TLS-layer error.
    #[error("tls error: {0}")]
    Tls(rustls::Error),
}

impl Error {
    /// Check whether this reason denotes a clean closure.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::ConnectionDone)
    }

    /// Check whether this reason denotes a local abort.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::ConnectionAbort)
    }

    /// Check whether this reason denotes a user-stopped connect attempt.
    pub fn is_user_abort(&self) -> bool {
        matches!(self, Self::UserAbort)
    }

    /// Check whether this reason denotes a connect timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// The underlying OS error, if this is a wrapped system error.
    pub fn as_io(&self) -> Option<&io::Error> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err)
    }
}
