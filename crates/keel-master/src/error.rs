use keel_log::LogError;
use thiserror::Error;

pub type MasterResult<T> = Result<T, MasterError>;

#[derive(Debug, Error)]
pub enum MasterError {
    /// A message was semantically invalid (unknown framework, offer or
    /// task). The sender is informed; the master carries on.
    #[error("rejected: {0}")]
    Rejected(String),
    /// A retransmission of an already processed event.
    #[error("duplicate: {0}")]
    Duplicate(String),
    /// Back-pressure: the allocator is withholding offers.
    #[error("overloaded: {0}")]
    Overloaded(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    Log(#[from] LogError),
}
