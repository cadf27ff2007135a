//! Error types for Conclave

use thiserror::Error;

use crate::request::RequestKind;

/// Result type alias using Conclave's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Conclave operations
#[derive(Error, Debug)]
pub enum Error {
    /// A collective call (broadcast, all-to-all) failed: timeout, peer
    /// unreachable, or a participant went away mid-call. Not retried at
    /// this layer.
    #[error("transport error: {0}")]
    Transport(String),

    /// A mailbox peer hung up.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// A request variant reached a scheduler core that has no handler for
    /// it. This is a build/configuration mismatch between transport and
    /// handler registration, and it terminates the worker.
    #[error("no handler registered for {0} requests")]
    UnhandledRequest(RequestKind),

    #[error("configuration error: {0}")]
    Config(String),

    /// A packed collective payload failed to decode.
    #[error("wire format error: {0}")]
    WireFormat(String),

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// A fixed-capacity dispatch buffer overflowed. The deployment's
    /// expected-token capacity is too small for the observed routing.
    #[error("expert {expert} exceeded its slot capacity of {capacity} tokens")]
    Capacity { expert: usize, capacity: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
