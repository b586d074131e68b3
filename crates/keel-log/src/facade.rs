//! The reader/writer facade over the replicated log.

use std::path::PathBuf;
use std::time::Duration;

use keel_common::config::AppConfig;
use tokio::sync::oneshot;

use crate::coordinator::{Coordinator, CoordinatorOptions};
use crate::error::{LogError, LogResult};
use crate::network::ReplicaNetwork;
use crate::record::Payload;
use crate::replica::{spawn_replica, ReplicaEvent, ReplicaHandle, ReplicaOptions};

/// An opaque identity of a log position, with a stable byte encoding for
/// persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(u64);

impl Position {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn encode(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = bytes.try_into().ok()?;
        Some(Self(u64::from_be_bytes(bytes)))
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub position: Position,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub path: PathBuf,
    pub quorum: usize,
    pub cache_capacity: usize,
    pub phase_timeout: Duration,
    pub election_retry_count: usize,
}

impl From<&AppConfig> for LogOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            path: PathBuf::from(&config.log.path),
            quorum: config.log.quorum,
            cache_capacity: config.log.cache_capacity,
            phase_timeout: Duration::from_secs(config.log.phase_timeout_secs),
            election_retry_count: config.log.election_retry_count,
        }
    }
}

/// A replicated log backed by a local replica and a set of peers.
pub struct Log {
    options: LogOptions,
    replica: ReplicaHandle,
    network: ReplicaNetwork,
}

impl Log {
    /// Open the local replica and assemble the replica set from the peers.
    pub async fn open(options: LogOptions, peers: Vec<ReplicaHandle>) -> LogResult<Self> {
        let replica = spawn_replica(ReplicaOptions {
            path: options.path.clone(),
            cache_capacity: options.cache_capacity,
        })
        .await?;
        let mut replicas = peers;
        replicas.push(replica.clone());
        Ok(Self {
            options,
            replica,
            network: ReplicaNetwork::new(replicas),
        })
    }

    /// The local replica, for peering with other logs.
    pub fn replica(&self) -> &ReplicaHandle {
        &self.replica
    }

    pub fn reader(&self) -> Reader {
        Reader::new(self.replica.clone())
    }

    /// Elect a new writer. Only one writer is valid at a time; electing a
    /// new one demotes any previous writer at the next operation it
    /// attempts.
    pub async fn writer(&self, instance: u64) -> LogResult<Writer> {
        let mut coordinator = Coordinator::new(
            self.options.quorum,
            instance,
            self.replica.clone(),
            self.network.clone(),
            CoordinatorOptions {
                phase_timeout: self.options.phase_timeout,
            },
        );
        let mut retries = self.options.election_retry_count;
        loop {
            match coordinator.elect().await {
                Ok(_) => return Ok(Writer { coordinator, poisoned: false }),
                Err(LogError::RetryableTimeout) if retries > 0 => {
                    retries -= 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Reads from the local replica. The view may be out of date if the log
/// has been appended to or truncated while this replica was partitioned.
pub struct Reader {
    replica: ReplicaHandle,
}

impl Reader {
    pub fn new(replica: ReplicaHandle) -> Self {
        Self { replica }
    }

    /// Returns all entries between the given positions, with no-ops and
    /// truncations filtered out.
    pub async fn read(&self, from: Position, to: Position) -> LogResult<Vec<Entry>> {
        if from.0 == 0 || to < from {
            return Err(LogError::BadRange("position out of bounds"));
        }
        let (tx, rx) = oneshot::channel();
        self.replica
            .send(ReplicaEvent::Read {
                from: from.0,
                to: to.0,
                reply: tx,
            })
            .await
            .map_err(|_| LogError::Cancelled)?;
        let actions = rx.await.map_err(|_| LogError::Cancelled)??;

        let mut entries = vec![];
        let mut expected = from.0;
        for action in actions {
            if !action.is_learned() || action.performed.is_none() {
                return Err(LogError::BadRange("includes pending positions"));
            }
            if action.position != expected {
                return Err(LogError::BadRange("includes missing positions"));
            }
            expected += 1;
            if let Some(Payload::Append(data)) = action.payload {
                entries.push(Entry {
                    position: Position(action.position),
                    data,
                });
            }
        }
        if expected != to.0 + 1 {
            return Err(LogError::BadRange("includes missing positions"));
        }
        Ok(entries)
    }

    pub async fn beginning(&self) -> LogResult<Position> {
        let (tx, rx) = oneshot::channel();
        self.replica
            .send(ReplicaEvent::Beginning { reply: tx })
            .await
            .map_err(|_| LogError::Cancelled)?;
        Ok(Position(rx.await.map_err(|_| LogError::Cancelled)?))
    }

    pub async fn ending(&self) -> LogResult<Position> {
        let (tx, rx) = oneshot::channel();
        self.replica
            .send(ReplicaEvent::Ending { reply: tx })
            .await
            .map_err(|_| LogError::Cancelled)?;
        Ok(Position(rx.await.map_err(|_| LogError::Cancelled)?))
    }
}

/// The single writer over the log. A writer becomes permanently invalid
/// once demoted; callers must elect a new one.
pub struct Writer {
    coordinator: Coordinator,
    poisoned: bool,
}

impl Writer {
    pub async fn append(&mut self, data: &[u8]) -> LogResult<Position> {
        if self.poisoned {
            return Err(LogError::Demoted);
        }
        match self.coordinator.append(data).await {
            Ok(position) => Ok(Position(position)),
            Err(e) => {
                if matches!(e, LogError::Demoted) {
                    self.poisoned = true;
                }
                Err(e)
            }
        }
    }

    /// Truncate the log up to but not including the given position.
    pub async fn truncate(&mut self, to: Position) -> LogResult<Position> {
        if self.poisoned {
            return Err(LogError::Demoted);
        }
        match self.coordinator.truncate(to.0).await {
            Ok(position) => Ok(Position(position)),
            Err(e) => {
                if matches!(e, LogError::Demoted) {
                    self.poisoned = true;
                }
                Err(e)
            }
        }
    }

    /// The last position this writer has written or agreed on.
    pub fn ending(&self) -> Position {
        Position(self.coordinator.index())
    }
}
