//! StockWatch error types.

use std::fmt;

/// Result alias used across all StockWatch crates.
pub type Result<T> = std::result::Result<T, StockWatchError>;

/// Classification of a mail transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// Credentials rejected by the relay. Retrying cannot help.
    Authentication,
    /// Could not reach or talk to the relay (DNS, TCP, TLS, dropped connection).
    Connectivity,
    /// Relay asked us to slow down or try later (4xx replies).
    Throttling,
    /// Relay permanently refused the message (bad recipient, policy).
    Rejected,
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFailure::Authentication => write!(f, "authentication"),
            TransportFailure::Connectivity => write!(f, "connectivity"),
            TransportFailure::Throttling => write!(f, "throttling"),
            TransportFailure::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StockWatchError {
    /// Bad schedule, recipients or items. The task is excluded, not retried.
    #[error("Config validation error: {0}")]
    ConfigValidation(String),

    #[error("Transient dependency error: {0}")]
    TransientDependency(String),

    #[error("Terminal dependency error: {0}")]
    TerminalDependency(String),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: Box<StockWatchError>,
    },

    /// A concurrent write changed the record between our read and our write.
    #[error("Store conflict on task {0}")]
    StoreConflict(String),

    #[error("Mail transport error ({kind}): {message}")]
    Transport {
        kind: TransportFailure,
        message: String,
    },

    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Cancelled by shutdown")]
    Cancelled,

    /// A cycle panicked; caught at the executor boundary.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StockWatchError {
    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StockWatchError::TransientDependency(_) | StockWatchError::Timeout(_) => true,
            StockWatchError::Transport { kind, .. } => matches!(
                kind,
                TransportFailure::Connectivity | TransportFailure::Throttling
            ),
            _ => false,
        }
    }

    /// True for errors produced by giving up after the retry ceiling.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, StockWatchError::RetriesExhausted { .. })
    }

    pub fn transport(kind: TransportFailure, message: impl Into<String>) -> Self {
        StockWatchError::Transport {
            kind,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for StockWatchError {
    fn from(e: serde_json::Error) -> Self {
        StockWatchError::Serialization(e.to_string())
    }
}
