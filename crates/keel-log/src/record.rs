//! Durable record types and the replica protocol.
//!
//! Each replica owns a single append-only file of length-prefixed records.
//! A record is either a promise (the replica's pledge to ignore lower
//! proposal rounds) or an action (the state of one log position). Records
//! are encoded with prost and framed with a 4-byte big-endian length.

use prost::Message;

use crate::error::LogResult;

/// A durable record in a replica's log file.
#[derive(Clone, PartialEq, Message)]
pub struct Record {
    #[prost(oneof = "Kind", tags = "1, 2")]
    pub kind: Option<Kind>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Kind {
    #[prost(message, tag = "1")]
    Promise(Promise),
    #[prost(message, tag = "2")]
    Action(Action),
}

/// A promise to ignore proposals below the given round id.
#[derive(Clone, Copy, PartialEq, Message)]
pub struct Promise {
    #[prost(uint64, tag = "1")]
    pub id: u64,
}

/// The state of a single log position.
///
/// An action without a payload is a placeholder written when a replica
/// promises an explicit position it has no value for. An action becomes
/// immutable once `learned` is set.
#[derive(Clone, PartialEq, Message)]
pub struct Action {
    #[prost(uint64, tag = "1")]
    pub position: u64,
    /// The highest round id promised for this position.
    #[prost(uint64, tag = "2")]
    pub promised: u64,
    /// The round id that performed the current payload, if any.
    #[prost(uint64, optional, tag = "3")]
    pub performed: Option<u64>,
    /// Whether consensus has been reached on the payload.
    #[prost(bool, optional, tag = "4")]
    pub learned: Option<bool>,
    #[prost(oneof = "Payload", tags = "5, 6, 7")]
    pub payload: Option<Payload>,
}

impl Action {
    pub fn is_learned(&self) -> bool {
        self.learned.unwrap_or(false)
    }
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Payload {
    /// A no-op used to fill positions whose outcome was never decided.
    #[prost(message, tag = "5")]
    Nop(Nop),
    /// Client bytes appended to the log.
    #[prost(bytes = "vec", tag = "6")]
    Append(Vec<u8>),
    /// Truncation of all positions below `to`.
    #[prost(uint64, tag = "7")]
    Truncate(u64),
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct Nop {}

impl Record {
    pub fn promise(promise: Promise) -> Self {
        Record {
            kind: Some(Kind::Promise(promise)),
        }
    }

    pub fn action(action: Action) -> Self {
        Record {
            kind: Some(Kind::Action(action)),
        }
    }

    /// Encode the record with its 4-byte big-endian length prefix.
    pub fn frame(&self) -> LogResult<Vec<u8>> {
        let mut buffer = Vec::with_capacity(4 + self.encoded_len());
        buffer.extend_from_slice(&(self.encoded_len() as u32).to_be_bytes());
        self.encode(&mut buffer)
            .map_err(|e| crate::error::LogError::Persistence(e.to_string()))?;
        Ok(buffer)
    }
}

// The replica protocol. These messages cross the replica's mailbox; the
// transport that would carry them between nodes is outside the log core.

#[derive(Debug, Clone)]
pub struct PromiseRequest {
    pub id: u64,
    /// An explicit position to promise, or `None` for an implicit promise
    /// covering the whole log.
    pub position: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PromiseResponse {
    pub okay: bool,
    pub id: u64,
    /// For an implicit promise, the replica's ending position.
    pub position: Option<u64>,
    /// For an explicit promise, the action previously known at the
    /// position, if any.
    pub action: Option<Action>,
}

#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub id: u64,
    pub position: u64,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub struct WriteResponse {
    pub okay: bool,
    pub id: u64,
    pub position: u64,
}

#[derive(Debug, Clone)]
pub struct LearnResponse {
    pub okay: bool,
    pub action: Option<Action>,
}
