//! Session error taxonomy.

use tokio::sync::mpsc;

/// Errors that end a session.
///
/// Two classes mirror how the daemon reacts:
/// - `Protocol`: the client sent something unusable (malformed frame,
///   unknown compiler), so the connection is closed deliberately.
/// - `ConnectionClosed` / `Io`: the peer or the writer task went away, or
///   a socket/jail filesystem operation failed; the session winds down.
#[derive(Debug)]
pub(crate) enum SessionError {
    Protocol(String),
    ConnectionClosed,
    Io(std::io::Error),
}

impl SessionError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<mpsc::error::SendError<Vec<u8>>> for SessionError {
    fn from(_: mpsc::error::SendError<Vec<u8>>) -> Self {
        Self::ConnectionClosed
    }
}
