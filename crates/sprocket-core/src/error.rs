use std::io;

use thiserror::Error;

/// Errors surfaced by the transport engine.
///
/// This is a closed set: stream-level failures are classified into one of
/// these kinds at the boundary where they occur, so callers never see a raw
/// `io::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The operation's deadline passed.
    #[error("operation timed out")]
    TimedOut,
    /// The operation would block and was submitted non-blocking.
    #[error("resource temporarily unavailable")]
    Again,
    /// The object (pipe, endpoint, stream) was closed.
    #[error("object closed")]
    Closed,
    /// The connection was shut down by the peer during negotiation.
    ///
    /// Distinct from [`Error::Closed`] so endpoint closure is not confused
    /// with a peer hanging up mid-handshake.
    #[error("connection shut down")]
    ConnectionShutdown,
    /// The remote side refused the connection.
    #[error("connection refused")]
    ConnectionRefused,
    /// The connection was reset by the peer.
    #[error("connection reset")]
    ConnectionReset,
    /// The address is already in use.
    #[error("address in use")]
    AddressInUse,
    /// The address or URL is malformed for this transport.
    #[error("address invalid")]
    AddressInvalid,
    /// The peer violated the wire protocol.
    #[error("protocol error")]
    Protocol,
    /// The peer could not be authenticated (TLS verification failed).
    #[error("peer could not be authenticated")]
    PeerAuth,
    /// A cryptographic operation failed.
    #[error("cryptographic error")]
    Crypto,
    /// An inbound message exceeded the receive ceiling.
    #[error("message too large")]
    MessageTooBig,
    /// Memory could not be allocated.
    #[error("out of memory")]
    NoMemory,
    /// A file descriptor could not be allocated.
    #[error("out of files")]
    NoFiles,
    /// The object does not exist (stale or finalized handle).
    #[error("object not found")]
    NotFound,
    /// Another request of the same kind is already in flight.
    #[error("resource busy")]
    Busy,
    /// An option value had the wrong type.
    #[error("incorrect type")]
    BadType,
    /// The operation or option is not supported here.
    #[error("not supported")]
    NotSupported,
    /// An argument or option value was invalid.
    #[error("invalid argument")]
    Invalid,
    /// The object is in the wrong state for the operation.
    #[error("incorrect state")]
    InvalidState,
    /// The operation was canceled by the caller.
    #[error("operation canceled")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify an `io::Error` into the closed kind set.
    pub fn from_io(e: &io::Error) -> Error {
        use io::ErrorKind::*;
        match e.kind() {
            TimedOut => Error::TimedOut,
            WouldBlock => Error::Again,
            ConnectionRefused => Error::ConnectionRefused,
            ConnectionReset | ConnectionAborted | BrokenPipe => Error::ConnectionReset,
            NotConnected | UnexpectedEof => Error::Closed,
            AddrInUse => Error::AddressInUse,
            AddrNotAvailable => Error::AddressInvalid,
            InvalidInput | InvalidData => Error::Invalid,
            NotFound => Error::NotFound,
            PermissionDenied => Error::Invalid,
            OutOfMemory => Error::NoMemory,
            _ => match e.raw_os_error() {
                // EMFILE / ENFILE: descriptor exhaustion is transient and
                // triggers the accept cool-off, so keep it distinct.
                Some(24) | Some(23) => Error::NoFiles,
                Some(12) => Error::NoMemory,
                _ => Error::ConnectionReset,
            },
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::from_io(&e)
    }
}
