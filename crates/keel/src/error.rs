//! Error types for the reactor.
//!
//! Handler-level failures ([`HandlerError`]) never escape a processing cycle:
//! they are classified and turned into handler state transitions. Only
//! [`StoreError`] and [`SinkError`] surface to the caller, wrapped in
//! [`ProcessingError`].

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a handler.
///
/// Handlers return `Result<Option<Value>, HandlerError>`. The engine
/// pattern-matches on the variant to decide what happens next.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Retryable failure. `delay: None` means "use the handler's backoff".
    #[error("temporary failure: {message}")]
    Temporary {
        message: String,
        delay: Option<Duration>,
    },

    /// Non-retryable failure; terminal for this handler and cause.
    #[error("permanent failure: {message}")]
    Permanent { message: String },

    /// Anything the handler did not classify. Retried with backoff.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl HandlerError {
    /// Temporary failure retried after an explicit delay.
    pub fn temporary(message: impl Into<String>, delay: Duration) -> Self {
        Self::Temporary {
            message: message.into(),
            delay: Some(delay),
        }
    }

    /// Temporary failure retried according to the handler's backoff.
    pub fn retry(message: impl Into<String>) -> Self {
        Self::Temporary {
            message: message.into(),
            delay: None,
        }
    }

    /// Permanent failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }
}

/// Timestamp encoding/decoding errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unparseable timestamp {value:?}")]
    Unparseable { value: String },

    #[error("timestamp {value:?} does not match the awareness of the base time")]
    Mismatch { value: String },

    #[error("offset {offset} is out of the representable range")]
    OutOfRange { offset: f64 },
}

/// Progress store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("corrupted progress record for {entity}: {reason}")]
    Corrupted { entity: String, reason: String },

    #[error("progress serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timestamp codec failed: {0}")]
    Codec(#[from] CodecError),

    #[error("progress store backend failed: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Outbound patch/event sink failures.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("entity {entity} not found")]
    NotFound { entity: String },

    #[error("patch rejected for {entity}: {reason}")]
    Rejected { entity: String, reason: String },

    #[error("sink backend failed: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Handler registration failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler id {0:?} is registered twice")]
    DuplicateHandler(String),

    #[error("handler {0:?} subscribes to no reason")]
    NoReasons(String),
}

/// Cycle-level errors surfaced by [`crate::process_resource_event`].
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("progress store error: {0}")]
    Store(#[from] StoreError),

    #[error("patch sink error: {0}")]
    Sink(#[from] SinkError),
}

/// Result alias for processing cycles.
pub type Result<T> = std::result::Result<T, ProcessingError>;
