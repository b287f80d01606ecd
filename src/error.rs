//! Routing errors
//!
//! One typed enum for everything that can go wrong between "request names a
//! model" and "bytes are flowing". The HTTP mapping lives with the server
//! (`server::error`); the core only distinguishes the kinds.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouteError {
    /// Request named an id/alias no snapshot entry resolves
    #[error("model not found")]
    ModelNotFound(String),

    /// Group admission was abandoned or the instance never settled
    #[error("admission denied for `{0}`")]
    GroupDenied(String),

    /// The subprocess exited before becoming ready
    #[error("`{id}` exited before becoming ready")]
    StartFailure { id: String, log_excerpt: String },

    /// The process ran but never passed its health check
    #[error("`{id}` did not become ready within {timeout_secs}s")]
    HealthTimeout { id: String, timeout_secs: u64 },

    /// The client went away while we were waiting on its behalf
    #[error("request cancelled")]
    Cancelled,

    /// The port allocator probed the whole range without a free port
    #[error("no free port available")]
    PortExhausted,

    /// The instance is at its configured concurrency limit
    #[error("`{0}` is at its concurrency limit")]
    ConcurrencyLimit(String),

    /// Forwarding to the upstream failed at the transport level
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}
