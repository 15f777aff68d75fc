use thiserror::Error;

/// Library errors. These travel as values through reply futures and
/// callbacks; the only panics in this crate live in tests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Transport failure: refused/timed out connect, EOF mid-stream,
    /// socket I/O error. Delivered to every pending request when the
    /// connection goes down.
    #[error("connection error: {0}")]
    Connection(String),

    /// Caller-side misuse of the API (empty pipeline, ordinary call on a
    /// subscribed client, write on a dead connection, ...).
    #[error("client error: {0}")]
    Client(String),

    /// Corrupt RESP framing. Never returned from a call directly: it
    /// forces a disconnect, which then surfaces as `Connection` on every
    /// pending and future request.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub fn connection(msg: impl Into<String>) -> Error {
        Error::Connection(msg.into())
    }

    pub fn client(msg: impl Into<String>) -> Error {
        Error::Client(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Error {
        Error::Protocol(msg.into())
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

pub type Result<A> = std::result::Result<A, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Connection(err.to_string())
    }
}
