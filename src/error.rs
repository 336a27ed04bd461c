use std::sync::Arc;

use thiserror::Error;

use crate::message::Kind;

/// Errors surfaced by a correlated call.
#[derive(Error, Debug)]
pub enum Error {
    /// A reply of a different type arrived than the accessor required.
    ///
    /// Never fatal to the connection; whether the call itself is torn down
    /// depends on the accessor (see the per-accessor release rules on
    /// [`CallSubject`](crate::CallSubject)).
    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessageType {
        /// Type tag the accessor was waiting for.
        expected: Kind,
        /// Type tag actually received.
        actual: Kind,
    },

    /// The shared connection was lost while the call was outstanding.
    ///
    /// Default cause synthesized by [`CallSubject::disconnect`](crate::CallSubject::disconnect)
    /// when the transport supplies no more specific error.
    #[error("connection closed")]
    ConnectionClosed,

    /// Error carried by an error-tagged reply, surfaced verbatim.
    #[error("remote error: {0}")]
    Remote(Arc<str>),

    /// Body encode or parse failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The reply listener was replaced before this waiter settled.
    ///
    /// Subjects hold a single listener; installing a new one supersedes the
    /// previous waiter, which fails with this instead of pending forever.
    #[error("reply listener superseded before the call settled")]
    Superseded,
}

/// Result type alias for correlated call operations.
pub type Result<T> = std::result::Result<T, Error>;
