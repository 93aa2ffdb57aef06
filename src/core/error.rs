//! Error types.

use thiserror::Error;

/// Errors in the wire codec.
///
/// A protocol error means the byte stream is corrupt; the owning
/// connection is torn down rather than resynchronized.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The length prefix decoded to a negative value.
    #[error("negative frame length prefix: {0}")]
    NegativeLength(i32),

    /// The frame payload is not valid UTF-8.
    #[error("frame payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// The envelope grammar could not be parsed.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

/// Transport failures on one connection.
///
/// Never process-fatal: the owning read or write loop converts these into
/// a teardown plus a `Disconnected` callback.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The byte stream is corrupt.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The connection has already finished; sends are refused.
    #[error("connection is closed")]
    Closed,
}

/// Errors surfaced by the client API.
///
/// Server-side failures (bind, accept, registration misses) are logged
/// and retried or reported through ack callbacks instead of being
/// returned, so there is no server-side counterpart.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The configured server address is unusable.
    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    /// The session has been disconnected and accepts no further commands.
    #[error("client is shut down")]
    Shutdown,
}
