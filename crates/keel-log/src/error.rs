use thiserror::Error;

pub type LogResult<T> = Result<T, LogError>;

#[derive(Debug, Error)]
pub enum LogError {
    /// A quorum did not respond in time. The operation may be retried.
    #[error("request timed out while attempting consensus")]
    RetryableTimeout,
    /// Another coordinator won a higher promise. The current writer is
    /// permanently invalid and a new one must be elected.
    #[error("coordinator was demoted while attempting consensus")]
    Demoted,
    /// A read into a position below the beginning of the log.
    #[error("attempted to read truncated position")]
    TruncatedRange,
    /// A read range overlapping unlearned positions or holes.
    #[error("bad read range ({0})")]
    BadRange(&'static str),
    /// The underlying storage failed irrecoverably.
    #[error("persistence error: {0}")]
    Persistence(String),
    /// An outstanding operation was discarded, e.g. because the peer
    /// stopped before responding.
    #[error("operation was cancelled")]
    Cancelled,
}

impl From<std::io::Error> for LogError {
    fn from(e: std::io::Error) -> Self {
        LogError::Persistence(e.to_string())
    }
}

impl From<prost::DecodeError> for LogError {
    fn from(e: prost::DecodeError) -> Self {
        LogError::Persistence(e.to_string())
    }
}
