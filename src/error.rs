//! The error vocabulary shared by the connection runtime.
//!
//! Handlers express their failures as Gemini status lines; this type only
//! covers the conditions where no status line can (or may) be written.

use crate::prelude::*;

/// Connection-level errors.
///
/// [`Error::Tls`] and [`Error::Io`] carry the causes emitted by
/// [`rustls`] and the socket. The remaining variants describe protocol
/// violations which the manager answers by crashing the connection.
#[derive(Debug)]
pub enum Error {
    /// An I/O error on the underlying socket.
    Io(io::Error),
    /// The TLS engine rejected the peer's records.
    Tls(rustls::Error),
    /// The peer closed the connection before a full request arrived.
    ClosedEarly,
    /// More than 1024 bytes arrived without a line terminator.
    RequestTooLong,
    /// An I/O await outlived its timeout.
    TimedOut,
}

impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}
impl From<rustls::Error> for Error {
    #[inline]
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err)
    }
}
impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::Io(io) => io,
            Error::Tls(tls) => io::Error::new(io::ErrorKind::InvalidData, tls),
            Error::ClosedEarly => {
                io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-request")
            }
            Error::RequestTooLong => {
                io::Error::new(io::ErrorKind::InvalidData, "request exceeds 1024 bytes")
            }
            Error::TimedOut => io::Error::new(io::ErrorKind::TimedOut, "connection timed out"),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Tls(err) => write!(f, "tls error: {err}"),
            Self::ClosedEarly => f.write_str("peer closed mid-request"),
            Self::RequestTooLong => f.write_str("request exceeds 1024 bytes"),
            Self::TimedOut => f.write_str("connection timed out"),
        }
    }
}
impl std::error::Error for Error {}
