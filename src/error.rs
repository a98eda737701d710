//! The engine's error taxonomy.
//!
//! This engine is a library embedded in a long-running application, not a
//! CLI that prints an error and exits. Callers need to tell "no response
//! yet, try again" apart from "that peer is gone" apart from "the local
//! disk is having a bad day" apart from "the config you handed me is
//! invalid", so each failure mode gets its own variant instead of being
//! flattened into one opaque error type.
//!
//! `#[derive(thiserror::Error)]` generates the `std::error::Error` impl and
//! the `Display` impl from the `#[error("...")]` message on each variant —
//! the same amount of boilerplate `anyhow` saves you from writing by hand,
//! just aimed at a typed enum instead of a single catch-all.

use std::fmt;

use crate::transport::PeerId;

/// Every way an engine operation can fail.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The transport adapter has not completed `open()` yet (or has dropped
    /// back to disconnected after a `disconnected`/`close` lifecycle event).
    /// All sends fail with this until the adapter reconnects.
    #[error("transport not ready")]
    TransportNotReady,

    /// A channel open exceeded the transport's 10s budget.
    #[error("connection to {0} timed out")]
    ConnectionTimeout(PeerId),

    /// A request/response waiter's deadline fired before a matching response
    /// arrived. This is returned as a value, not raised as an exception —
    /// callers are expected to treat it as an ordinary (if disappointing)
    /// outcome, a sentinel rather than an exception.
    #[error("request timed out waiting for a response")]
    RequestTimeout,

    /// The transport reported the target peer as unknown or offline.
    #[error("peer {0} is unavailable")]
    PeerUnavailable(PeerId),

    /// A frame could not be encoded or decoded. The frame is dropped and the
    /// event is logged; this variant exists so callers that want to observe
    /// the failure (tests, metrics) still can.
    #[error("failed to serialize or deserialize a frame: {0}")]
    SerializationError(String),

    /// An injected store (`KvStore`/`BlobStore`) failed. This is logged and
    /// swallowed at internal call sites — the engine never crashes on a
    /// storage failure — but the error is still a real `EngineError` so
    /// storage-facing code and tests can observe it directly.
    #[error("storage operation failed: {0}")]
    StorageError(String),

    /// A caller-supplied `EngineConfig` violates one of its own invariants
    /// (an out-of-range interval, or two fields whose ordering constraint
    /// doesn't hold). Kept distinct from `StorageError` so a caller can
    /// match "my config is wrong" apart from "the store misbehaved" — the
    /// two have nothing to do with each other and call for different fixes.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Not really an error: a peer's public key changed since the last time
    /// it was recorded. Surfaced to the caller so it can be routed to the
    /// user-decision queue (see `key_exchange.rs`).
    #[error("public key for {0} changed and requires user confirmation")]
    KeyChangeDetected(PeerId),

    /// A pending outbound message exhausted its configured `max_retries`
    /// and has been permanently marked `failed`.
    #[error("message {0} exceeded its maximum retry count")]
    MaxRetriesExceeded(String),
}

impl EngineError {
    /// Convenience constructor used at postcard encode/decode boundaries.
    pub fn serialization(err: impl fmt::Display) -> Self {
        EngineError::SerializationError(err.to_string())
    }

    /// Convenience constructor used at `KvStore`/`BlobStore` call sites.
    pub fn storage(err: impl fmt::Display) -> Self {
        EngineError::StorageError(err.to_string())
    }
}
