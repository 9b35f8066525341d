use std::sync::Arc;
use thiserror::Error;

/// Errors produced by the codec, the connections and the client lifecycle.
///
/// The enum is `Clone` because a single outcome may be observed by several
/// clones of the same [`Ticket`](crate::Ticket); the `std::io::Error` payload
/// is therefore carried behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("incomplete frame")]
    IncompleteFrame,
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server answered a command with an error reply. Carries the
    /// server's message verbatim.
    #[error("server error: {0}")]
    Server(String),
    /// The socket closed while the command was in flight.
    #[error("connection lost")]
    ConnectionLost,
    /// The command was issued after the client gave up reconnecting.
    #[error("connection is in failed state")]
    FailedState,
    /// A connection attempt failed (TCP, auth or select rejected).
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A reply arrived with no command waiting for it. Fatal to the
    /// connection.
    #[error("replies out of sync with requests")]
    OutOfSync,
    #[error("invalid redis uri `{0}`")]
    InvalidUri(String),
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("duplicate state transition {from} -> {to}")]
    DuplicateTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error(transparent)]
    Conversion(#[from] std::num::TryFromIntError),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}
