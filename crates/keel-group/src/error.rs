use thiserror::Error;

pub type GroupResult<T> = Result<T, GroupError>;

#[derive(Debug, Error)]
pub enum GroupError {
    /// The session with the coordination service expired; in-flight
    /// memberships are invalid and callers must re-join.
    #[error("coordination service session expired")]
    SessionExpired,
    /// The membership is not live.
    #[error("unknown membership {0}")]
    UnknownMembership(u64),
    /// The group actor went away before responding.
    #[error("operation was cancelled")]
    Cancelled,
    #[error("coordination service error: {0}")]
    Service(String),
}
