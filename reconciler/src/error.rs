use thiserror::Error;

// ─── Remote portal errors ────────────────────────────────────────────────────

/// Failure reported by an Access Port binding.
///
/// Bindings never retry. Callers decide with [`PortError::is_retryable`]
/// whether another attempt is worth making.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PortError {
    /// The remote system answered with a non-success response, could not be
    /// reached, or the institution could not be resolved to a remote context.
    #[error("remote access failed: {0}")]
    Access(String),

    /// An expected record or element is absent. Business-level, not retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// Timing or visibility failure from the UI binding.
    #[error("transient ui failure: {0}")]
    TransientUi(String),

    /// The externally supplied session is no longer accepted.
    #[error("session expired: {0}")]
    SessionExpired(String),
}

impl PortError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Access(_) | Self::TransientUi(_))
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired(_))
    }
}

// ─── Work queue errors ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum QueueError {
    /// Payloads and references do not line up, or a payload is not JSON.
    #[error("malformed queue payload: {0}")]
    Malformed(String),

    #[error("reference '{0}' already exists in queue")]
    DuplicateReference(String),

    #[error("unknown queue item {0}")]
    UnknownItem(u64),

    #[error("queue item {id} is {status} and cannot change status")]
    TerminalState { id: u64, status: String },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

// ─── Configuration errors ────────────────────────────────────────────────────

/// Fatal to the whole run: bad or missing input file, malformed directive.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("configuration error: {0}")]
pub struct ConfigurationError(pub String);

impl ConfigurationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
