use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use keel_common::config::AppConfig;
use log::{info, warn};
use lru::LruCache;

use crate::error::{LogError, LogResult};
use crate::record::{
    Action, Kind, LearnResponse, Payload, Promise, PromiseRequest, PromiseResponse, Record,
    WriteRequest, WriteResponse,
};
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct ReplicaOptions {
    pub path: PathBuf,
    pub cache_capacity: usize,
}

impl From<&AppConfig> for ReplicaOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            path: PathBuf::from(&config.log.path),
            cache_capacity: config.log.cache_capacity,
        }
    }
}

/// The durable state of one log replica.
///
/// The replica tracks the highest promised round, the begin/end positions
/// of its log, the set of positions written past the end without the
/// intermediate ones (`holes`), and the set of written but not yet learned
/// positions. Every known action is also kept in a bounded cache; a cache
/// miss streams the record file from the start.
pub struct Replica {
    storage: Storage,
    promised: u64,
    begin: u64,
    end: u64,
    holes: BTreeSet<u64>,
    unlearned: BTreeSet<u64>,
    cache: LruCache<u64, Action>,
}

impl Replica {
    pub async fn open(options: ReplicaOptions) -> LogResult<Self> {
        let (storage, records) = Storage::open(&options.path).await?;
        let capacity =
            NonZeroUsize::new(options.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let mut replica = Self {
            storage,
            promised: 0,
            begin: 0,
            end: 0,
            holes: BTreeSet::new(),
            unlearned: BTreeSet::new(),
            cache: LruCache::new(capacity),
        };
        replica.recover(records);
        info!(
            "replica recovered with log positions {} -> {}, {} hole(s) and {} unlearned",
            replica.begin,
            replica.end,
            replica.holes.len(),
            replica.unlearned.len()
        );
        Ok(replica)
    }

    fn recover(&mut self, records: Vec<Record>) {
        let mut learned = BTreeSet::new();
        for record in records {
            match record.kind {
                Some(Kind::Promise(promise)) => {
                    self.promised = promise.id;
                }
                Some(Kind::Action(action)) => {
                    let position = action.position;
                    if action.is_learned() {
                        learned.insert(position);
                        self.unlearned.remove(&position);
                        if let Some(Payload::Truncate(to)) = action.payload {
                            self.begin = self.begin.max(to);
                        }
                    } else {
                        learned.remove(&position);
                        self.unlearned.insert(position);
                    }
                    self.end = self.end.max(position);
                    self.cache.put(position, action);
                }
                None => {}
            }
        }
        for position in self.begin..self.end {
            if position > 0
                && !learned.contains(&position)
                && !self.unlearned.contains(&position)
            {
                self.holes.insert(position);
            }
        }
    }

    pub async fn promise(&mut self, request: PromiseRequest) -> LogResult<PromiseResponse> {
        match request.position {
            Some(position) => self.promise_position(request.id, position).await,
            None => self.promise_log(request.id).await,
        }
    }

    /// An implicit promise covering the whole log.
    async fn promise_log(&mut self, id: u64) -> LogResult<PromiseResponse> {
        if id < self.promised {
            return Ok(PromiseResponse {
                okay: false,
                id,
                position: None,
                action: None,
            });
        }
        self.storage.persist(&Record::promise(Promise { id })).await?;
        self.promised = id;
        // Return the last position written so the coordinator can derive
        // the next position from a quorum of responses.
        Ok(PromiseResponse {
            okay: true,
            id,
            position: Some(self.end),
            action: None,
        })
    }

    /// An explicit promise for a single position, used to fill it.
    async fn promise_position(&mut self, id: u64, position: u64) -> LogResult<PromiseResponse> {
        match self.read(position).await? {
            None => {
                let action = Action {
                    position,
                    promised: id,
                    performed: None,
                    learned: None,
                    payload: None,
                };
                self.persist_action(action).await?;
                Ok(PromiseResponse {
                    okay: true,
                    id,
                    position: Some(position),
                    action: None,
                })
            }
            Some(action) => {
                if id < action.promised {
                    return Ok(PromiseResponse {
                        okay: false,
                        id,
                        position: Some(position),
                        action: None,
                    });
                }
                let original = action.clone();
                self.persist_action(Action {
                    promised: id,
                    ..action
                })
                .await?;
                Ok(PromiseResponse {
                    okay: true,
                    id,
                    position: None,
                    action: Some(original),
                })
            }
        }
    }

    pub async fn write(&mut self, request: WriteRequest) -> LogResult<WriteResponse> {
        self.perform(request, false).await
    }

    pub async fn commit(&mut self, request: WriteRequest) -> LogResult<WriteResponse> {
        self.perform(request, true).await
    }

    async fn perform(&mut self, request: WriteRequest, learned: bool) -> LogResult<WriteResponse> {
        let WriteRequest { id, position, payload } = request;
        let nack = WriteResponse {
            okay: false,
            id,
            position,
        };
        let ack = WriteResponse {
            okay: true,
            id,
            position,
        };
        match self.read(position).await? {
            None => {
                if id < self.promised {
                    return Ok(nack);
                }
                let action = Action {
                    position,
                    promised: self.promised,
                    performed: Some(id),
                    learned: learned.then_some(true),
                    payload: Some(payload),
                };
                self.persist_action(action).await?;
                Ok(ack)
            }
            Some(action) => {
                if id < action.promised {
                    return Ok(nack);
                }
                if action.is_learned() {
                    // A learned action is immutable. Re-writing it is only
                    // acknowledged when the payload is byte-identical.
                    return if action.payload.as_ref() == Some(&payload) {
                        Ok(ack)
                    } else {
                        warn!(
                            "rejecting write of a different payload to learned position {position}"
                        );
                        Ok(nack)
                    };
                }
                let action = Action {
                    position,
                    promised: action.promised,
                    performed: Some(id),
                    learned: learned.then_some(true),
                    payload: Some(payload),
                };
                self.persist_action(action).await?;
                Ok(ack)
            }
        }
    }

    /// Persist an action learned elsewhere.
    pub async fn learned(&mut self, action: Action) -> LogResult<()> {
        if !action.is_learned() {
            warn!(
                "ignoring unlearned action at position {} from a peer",
                action.position
            );
            return Ok(());
        }
        self.persist_action(action).await
    }

    pub async fn learn(&mut self, position: u64) -> LogResult<LearnResponse> {
        match self.read(position).await {
            Ok(Some(action)) if action.is_learned() => Ok(LearnResponse {
                okay: true,
                action: Some(action),
            }),
            Ok(_) | Err(LogError::TruncatedRange) => Ok(LearnResponse {
                okay: false,
                action: None,
            }),
            Err(e) => Err(e),
        }
    }

    /// Read the action known at a position. Position zero is reserved and
    /// always reads as absent; positions below the beginning of the log
    /// read as truncated; positions beyond the end or inside holes read as
    /// absent.
    pub async fn read(&mut self, position: u64) -> LogResult<Option<Action>> {
        if position == 0 {
            return Ok(None);
        }
        if position < self.begin {
            return Err(LogError::TruncatedRange);
        }
        if position > self.end || self.holes.contains(&position) {
            return Ok(None);
        }
        if let Some(action) = self.cache.get(&position) {
            return Ok(Some(action.clone()));
        }
        // Cache miss: stream the whole file, caching the latest record for
        // the requested position.
        let records = self.storage.records().await?;
        for record in records {
            if let Some(Kind::Action(action)) = record.kind {
                if action.position == position {
                    self.cache.put(position, action);
                }
            }
        }
        match self.cache.get(&position) {
            Some(action) => Ok(Some(action.clone())),
            // The hole bookkeeping guarantees the action is on disk.
            None => Err(LogError::Persistence(format!(
                "position {position} is missing from the record file"
            ))),
        }
    }

    pub async fn read_range(&mut self, from: u64, to: u64) -> LogResult<Vec<Action>> {
        let mut actions = vec![];
        for position in from..=to {
            if let Some(action) = self.read(position).await? {
                actions.push(action);
            }
        }
        Ok(actions)
    }

    /// The positions up to `up_to` this replica has not learned:
    /// written-but-unlearned positions, holes, and everything past the end.
    pub fn missing(&self, up_to: u64) -> BTreeSet<u64> {
        let mut positions = self.unlearned.clone();
        positions.extend(self.holes.iter().copied());
        for position in (self.end + 1)..=up_to {
            positions.insert(position);
        }
        positions
    }

    pub fn beginning(&self) -> u64 {
        self.begin
    }

    pub fn ending(&self) -> u64 {
        self.end
    }

    pub fn promised(&self) -> u64 {
        self.promised
    }

    async fn persist_action(&mut self, action: Action) -> LogResult<()> {
        self.storage.persist(&Record::action(action.clone())).await?;
        let position = action.position;
        self.holes.remove(&position);
        if action.is_learned() {
            self.unlearned.remove(&position);
            if let Some(Payload::Truncate(to)) = action.payload {
                self.begin = self.begin.max(to);
            }
        } else {
            self.unlearned.insert(position);
        }
        for hole in (self.end + 1)..position {
            self.holes.insert(hole);
        }
        self.end = self.end.max(position);
        self.cache.put(position, action);
        Ok(())
    }
}
