//! Error kinds surfaced by the layer's synchronous API.
//!
//! I/O failures, timeouts, and other session-local events are not reported
//! here — they are delivered to the owning session's [`crate::service::Service`]
//! callbacks, per the propagation policy in the spec this crate implements.

use thiserror::Error;

/// Errors returned synchronously by [`crate::layer::Layer`] operations.
#[derive(Debug, Error)]
pub enum Error {
    /// `sid` resolved to no live session, either because it was never issued
    /// by this layer, or because the session has since died.
    #[error("session not found")]
    NotFound,

    /// The owning worker's session table is at capacity.
    #[error("worker session table is full")]
    Overflow,

    /// The target worker's task queue has been closed (during teardown) or
    /// otherwise rejected the submission.
    #[error("task queue rejected submission")]
    QueueRejected,

    /// The calling thread violated a single-owner invariant, e.g. calling a
    /// per-session setter from outside a service callback running on that
    /// session's worker.
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),

    /// Construction-time argument was invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Underlying OS error while binding, accepting, or connecting.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias matching the rest of the crate's fallible operations.
pub type Result<T> = std::result::Result<T, Error>;
