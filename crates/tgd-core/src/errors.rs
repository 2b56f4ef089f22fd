use std::time::Duration;

/// Core error type for the dispatch engine.
///
/// Adapter crates map their transport errors into this type (or into
/// [`FetchError`] for the acquisition path) so the engine can decide whether a
/// failure is retried or surfaced.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("fatal fetch error: {0}")]
    FatalFetch(String),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single `fetch` against the remote update endpoint.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Network errors, 5xx, 429 and unparsable bodies. Retried with backoff.
    #[error("transient fetch error: {reason}")]
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },

    /// Revoked/invalid credentials or other misconfiguration. Stops the loop.
    #[error("fatal fetch error: {reason}")]
    Fatal { reason: String },
}

impl FetchError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,

    #[error("update {0} is already pending")]
    Duplicate(i64),

    #[error("queue is closed")]
    Closed,
}
