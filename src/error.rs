use std::io;

use thiserror::Error;

/// Errors surfaced by the event loop and the socket connection layer.
///
/// Setup and transport failures carry the underlying [`io::Error`]; the
/// remaining variants describe lifecycle violations that are detected before
/// any OS call is made.
#[derive(Debug, Error)]
pub enum NetError {
    /// I/O failure during setup (open/bind/connect) or transport (read/write).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The connection was closed in an orderly fashion; queued writes can no
    /// longer be honored.
    #[error("connection closed")]
    Closed,

    /// The connection was torn down by a transport error; queued writes are
    /// failed with the original cause attached.
    #[error("connection closed: {cause}")]
    ClosedByError { cause: String },

    /// The event loop has been closed; no further registrations or tasks are
    /// accepted.
    #[error("event loop closed")]
    LoopClosed,

    /// `connect` was called a second time on the same socket.
    #[error("connect already called")]
    AlreadyConnected,

    /// `send` was called before `connect`.
    #[error("not connected")]
    NotConnected,

    /// The outstanding-write-byte ceiling was exceeded; only the triggering
    /// send is affected.
    #[error("outstanding write limit exceeded ({limit} bytes)")]
    WriteCeiling { limit: usize },

    /// A datagram send had no destination: no explicit address and no default
    /// peer configured.
    #[error("no destination address for send")]
    NoDestination,

    /// A host name could not be resolved to a socket address.
    #[error("address resolution failed for {0}")]
    Resolve(String),
}

pub type Result<T> = std::result::Result<T, NetError>;
