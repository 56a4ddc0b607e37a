use thiserror::Error;

/// Convenience alias for Results carrying [`FleetError`].
pub type Result<T> = std::result::Result<T, FleetError>;

/// Error taxonomy for the orchestration core.
///
/// Variants map onto the recovery policy documented for each component:
/// store errors are retried with backoff by callers, invariant violations
/// are fatal to the operation that raised them but not to the process,
/// and agent/VCS errors degrade to escalation rather than panics.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("store error: {0}")]
    StoreMessage(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("queue is full")]
    QueueFull,

    #[error("event buffer is full")]
    BufferFull,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("agent unresponsive: {0}")]
    AgentUnresponsive(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("quality gate blocked: {0}")]
    GateBlocked(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("vcs error: {0}")]
    Vcs(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<tokio::sync::mpsc::error::TrySendError<crate::models::StreamEvent>> for FleetError {
    fn from(_: tokio::sync::mpsc::error::TrySendError<crate::models::StreamEvent>) -> Self {
        FleetError::BufferFull
    }
}
