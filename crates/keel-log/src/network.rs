//! Broadcasting to the replica set and quorum collection.
//!
//! A response that never arrives (a stopped replica, a dropped reply) is
//! indistinguishable from a slow one; it simply does not count toward the
//! quorum before the deadline.

use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{LogError, LogResult};
use crate::record::{Action, PromiseRequest, PromiseResponse, WriteRequest, WriteResponse};
use crate::replica::{ReplicaEvent, ReplicaHandle};

/// The set of replicas a coordinator drives, including its local one.
#[derive(Clone)]
pub struct ReplicaNetwork {
    replicas: Vec<ReplicaHandle>,
}

impl ReplicaNetwork {
    pub fn new(replicas: Vec<ReplicaHandle>) -> Self {
        Self { replicas }
    }

    pub async fn broadcast_promise(
        &self,
        request: PromiseRequest,
    ) -> FuturesUnordered<oneshot::Receiver<PromiseResponse>> {
        let responses = FuturesUnordered::new();
        for replica in &self.replicas {
            let (tx, rx) = oneshot::channel();
            let _ = replica
                .send(ReplicaEvent::Promise {
                    request: request.clone(),
                    reply: tx,
                })
                .await;
            responses.push(rx);
        }
        responses
    }

    pub async fn broadcast_write(
        &self,
        request: WriteRequest,
        learned: bool,
    ) -> FuturesUnordered<oneshot::Receiver<WriteResponse>> {
        let responses = FuturesUnordered::new();
        for replica in &self.replicas {
            let (tx, rx) = oneshot::channel();
            let event = if learned {
                ReplicaEvent::Commit {
                    request: request.clone(),
                    reply: tx,
                }
            } else {
                ReplicaEvent::Write {
                    request: request.clone(),
                    reply: tx,
                }
            };
            let _ = replica.send(event).await;
            responses.push(rx);
        }
        responses
    }

    /// Fire-and-forget notification that an action has been learned.
    pub async fn broadcast_learned(&self, action: Action) {
        for replica in &self.replicas {
            let _ = replica
                .send(ReplicaEvent::Learned {
                    action: action.clone(),
                })
                .await;
        }
    }
}

/// Collect responses until a quorum of acknowledgements is reached.
///
/// Any negative response means some replica saw a higher round, which
/// demotes the coordinator. Running out of responses or time without a
/// quorum is retryable.
pub async fn collect_quorum<R>(
    mut responses: FuturesUnordered<oneshot::Receiver<R>>,
    quorum: usize,
    timeout: Duration,
    okay: impl Fn(&R) -> bool,
) -> LogResult<Vec<R>> {
    let deadline = Instant::now() + timeout;
    let mut acks = vec![];
    loop {
        match tokio::time::timeout_at(deadline, responses.next()).await {
            Ok(Some(Ok(response))) => {
                if !okay(&response) {
                    return Err(LogError::Demoted);
                }
                acks.push(response);
                if acks.len() >= quorum {
                    return Ok(acks);
                }
            }
            // A dropped reply: the replica went away without responding.
            Ok(Some(Err(_))) => {}
            Ok(None) => return Err(LogError::RetryableTimeout),
            Err(_) => return Err(LogError::RetryableTimeout),
        }
    }
}
