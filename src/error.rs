//! Error kinds shared across the mailbox, registry, routing, and wire layers.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors the core distinguishes.
///
/// Long-poll timeouts are not an error: they surface as `Ok(None)` from the
/// polling operations by design.
#[derive(Debug, Error)]
pub enum Error {
    /// Name not declared locally or remotely.
    #[error("no such mailbox available")]
    NoMailbox,

    /// Ack/Nack with an id outside the valid window or unknown to the session.
    #[error("unknown message id")]
    UnknownMessage,

    /// Persisted mailbox metadata failed to decode.
    #[error("corrupt mailbox metadata")]
    CorruptMailbox,

    /// Push to a reserved `:name` the server does not recognize.
    #[error("unknown system mailbox {0}")]
    UnknownSystemMailbox(String),

    /// Wire-format violation: unknown tag, short read, decode failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error string returned by a remote peer.
    #[error("{0}")]
    Remote(String),

    /// The underlying connection is gone; the next call redials.
    #[error("connection closed")]
    Disconnected,

    /// Duration string on the wire failed to parse.
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    /// The routing KV store rejected or failed an operation.
    #[error("discovery: {0}")]
    Discovery(String),

    /// TLS material failed to load or the handshake failed.
    #[error("tls: {0}")]
    Tls(String),

    #[error("storage: {0}")]
    Store(#[from] crate::storage::StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the error indicates the peer connection is unusable and the
    /// session handle should be dropped so the next call reconnects.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::Disconnected | Error::Io(_))
    }
}
