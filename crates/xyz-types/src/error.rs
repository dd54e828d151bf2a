//! Error taxonomy surfaced at the call boundary.

use std::time::Duration;
use thiserror::Error;

/// Every failure a caller of a node can observe.
///
/// Nothing here is fatal to the process: each variant is delivered to the
/// completion of the call (or the `register`/`send` invocation) that caused it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XyzError {
    /// No configured peer answers to this service name.
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// No handler is registered for this action.
    #[error("Action not found: {0}")]
    ActionNotFound(String),

    /// The transport could not reach the peer, or lost the connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// No response arrived within the call deadline.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// The peer's handler reported a failure.
    #[error("Remote error {code}: {message}")]
    Remote {
        /// Error code carried in the response frame.
        code: i32,
        /// Human-readable reason.
        message: String,
    },

    /// A handler tried to answer the same request twice.
    #[error("Duplicate response for request {0}")]
    DuplicateResponse(String),

    /// Action names must be non-empty.
    #[error("Invalid action name: {0:?}")]
    InvalidActionName(String),

    /// A payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The node configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl XyzError {
    /// Whether this is one of the not-found kinds (unknown service or action).
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ServiceNotFound(_) | Self::ActionNotFound(_) => true,
            Self::Remote { code, .. } => *code == 404,
            _ => false,
        }
    }
}

/// Alias for results carrying an [`XyzError`].
pub type XyzResult<T> = Result<T, XyzError>;
