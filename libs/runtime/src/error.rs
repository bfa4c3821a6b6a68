//! Runtime error taxonomy.
//!
//! Cancellation is its own kind everywhere: callers are expected to check
//! for it and usually suppress logging, while application failures carry
//! the original error text to the failure continuation.

/// Failure delivered to an RPC or pipe continuation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    /// The ambient token was cancelled before the call resolved.
    #[error("operation cancelled")]
    Cancelled,

    /// The output port has no linked endpoint able to serve the request.
    #[error("no endpoint for '{message}' on {actor}")]
    NoEndpoint { message: String, actor: String },

    /// The responding side failed while handling the request.
    #[error("{0}")]
    Failed(String),
}

impl ChannelError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChannelError::Cancelled)
    }

    pub(crate) fn failed(detail: impl Into<String>) -> Self {
        ChannelError::Failed(detail.into())
    }
}

/// Outcome of a background job.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("operation cancelled")]
    Cancelled,

    /// Retryable: the pool re-queues the job until its retry budget is
    /// exhausted.
    #[error("insufficient resources")]
    ResourceExhausted,

    #[error("{0}")]
    Failed(String),
}

impl JobError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}

/// Failure of a main-thread dispatch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("operation cancelled")]
    Cancelled,
}

/// Failure assembling or running the actor system itself.
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("no factory registered for actor kind '{kind}'")]
    MissingFactory { kind: String },

    #[error("actor kind '{kind}' is already registered")]
    DuplicateFactory { kind: String },

    #[error("building an actor system requires an ambient tokio runtime")]
    NoRuntime,
}
