//! Error types for the connection lifecycle.
//!
//! - [`TransportError`]: failures reported by a frame source or envelope sink
//! - [`LifecycleError`]: failures that end a connection's message loop
//! - [`TaskError`]: how a supervised background task ended, if not cleanly
//! - [`PipelineError`]: middleware configuration problems found at startup

use thiserror::Error;

use crate::supervisor::CancelReason;

/// Boxed error used for application-supplied failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Failure reported by the underlying transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the connection cleanly.
    #[error("connection closed")]
    ClosedOk,
    /// The connection went away without a clean close handshake.
    #[error("connection closed abnormally (code {code:?})")]
    ClosedAbnormal {
        /// Close code, if the transport saw one.
        code: Option<u16>,
    },
    /// Any other transport failure.
    #[error("transport failure: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether this error means the connection is already gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ClosedOk | Self::ClosedAbnormal { .. })
    }
}

/// Failure that terminates a connection's message loop.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The transport delivered a frame type the loop does not understand.
    #[error("unknown websocket event type: {kind}")]
    Protocol {
        /// The frame's own `type` field.
        kind: String,
    },
    /// An inbound payload was not valid JSON.
    #[error("failed to decode message payload: {0}")]
    Decode(#[source] serde_json::Error),
    /// An outbound value could not be encoded as JSON.
    #[error("failed to encode outbound message: {0}")]
    Encode(#[source] serde_json::Error),
    /// The transport failed for a reason other than closure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// An application hook failed.
    #[error("handler failed: {0}")]
    Handler(#[source] BoxError),
    /// A middleware refused to run the connection.
    #[error("connection rejected: {0}")]
    Rejected(String),
    /// The session already ran to completion and cannot run again.
    #[error("session already finished")]
    Finished,
}

impl LifecycleError {
    /// Wrap an application error.
    pub fn handler(error: impl Into<BoxError>) -> Self {
        Self::Handler(error.into())
    }

    /// Build a rejection with a reason.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Protocol { .. } => "protocol",
            Self::Decode(_) => "decode",
            Self::Encode(_) => "encode",
            Self::Transport(_) => "transport",
            Self::Handler(_) => "handler",
            Self::Rejected(_) => "rejected",
            Self::Finished => "finished",
        }
    }
}

/// Why a supervised task did not complete successfully.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The activity returned an error.
    #[error("task failed: {0}")]
    Failed(#[source] BoxError),
    /// The activity panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The task was cancelled before it finished.
    #[error("task cancelled ({0})")]
    Cancelled(CancelReason),
}

impl TaskError {
    /// Whether the task ended through cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Middleware configuration error.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No middleware is registered under the configured identifier.
    #[error("unknown middleware: {0}")]
    UnknownMiddleware(String),
}
