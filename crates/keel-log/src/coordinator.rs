//! The Multi-Paxos coordinator driving writes across a quorum of replicas.
//!
//! One coordinator instance is elected as the sole writer via the group
//! membership of the surrounding system. Once demoted by a higher round it
//! never recovers; a new instance must run another election.

use std::collections::BTreeSet;
use std::time::Duration;

use keel_common::config::AppConfig;
use log::{debug, info};
use tokio::sync::oneshot;

use crate::error::{LogError, LogResult};
use crate::network::{collect_quorum, ReplicaNetwork};
use crate::record::{Action, Nop, Payload, PromiseRequest, WriteRequest};
use crate::replica::{ReplicaEvent, ReplicaHandle};

/// Spacing between the round ids of distinct coordinator instances, so
/// concurrent instances always propose distinct ids.
const COORDINATOR_ID_STRIDE: u64 = 1 << 16;

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub phase_timeout: Duration,
}

impl From<&AppConfig> for CoordinatorOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            phase_timeout: Duration::from_secs(config.log.phase_timeout_secs),
        }
    }
}

pub struct Coordinator {
    quorum: usize,
    /// Distinguishes this instance from other coordinators; must be less
    /// than [COORDINATOR_ID_STRIDE].
    instance: u64,
    /// The local replica, used for catch-up queries and reads.
    replica: ReplicaHandle,
    /// The replica set to broadcast to, including the local replica.
    network: ReplicaNetwork,
    options: CoordinatorOptions,
    round: u64,
    id: u64,
    /// Last position written in the log.
    index: u64,
    elected: bool,
}

impl Coordinator {
    pub fn new(
        quorum: usize,
        instance: u64,
        replica: ReplicaHandle,
        network: ReplicaNetwork,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            quorum,
            instance: instance % COORDINATOR_ID_STRIDE,
            replica,
            network,
            options,
            round: 0,
            id: 0,
            index: 0,
            elected: false,
        }
    }

    /// Run an election round. On success the coordinator becomes the writer
    /// and the current end position of the log is returned.
    pub async fn elect(&mut self) -> LogResult<u64> {
        self.elected = false;
        self.round += 1;
        self.id = self.round * COORDINATOR_ID_STRIDE + self.instance;
        debug!("electing coordinator with round id {}", self.id);

        let responses = self
            .network
            .broadcast_promise(PromiseRequest {
                id: self.id,
                position: None,
            })
            .await;
        let acks = collect_quorum(responses, self.quorum, self.options.phase_timeout, |r| r.okay)
            .await?;

        let end = acks
            .iter()
            .filter_map(|ack| ack.position)
            .max()
            .unwrap_or(0)
            .max(self.ending().await?);

        // Fill every position this instance has not learned, so the log has
        // an agreed gap-free prefix before new writes are accepted.
        let missing = self.missing(end).await?;
        for position in missing {
            self.fill(position).await?;
        }

        self.index = end;
        self.elected = true;
        info!("coordinator elected with round id {} at position {end}", self.id);
        Ok(end)
    }

    pub async fn append(&mut self, bytes: &[u8]) -> LogResult<u64> {
        self.perform(Payload::Append(bytes.to_vec())).await
    }

    /// Truncate the log up to but not including the given position.
    pub async fn truncate(&mut self, to: u64) -> LogResult<u64> {
        self.perform(Payload::Truncate(to)).await
    }

    async fn perform(&mut self, payload: Payload) -> LogResult<u64> {
        if !self.elected {
            return Err(LogError::Demoted);
        }
        let position = self.index + 1;
        match self.write(position, payload).await {
            Ok(position) => {
                self.index = position;
                Ok(position)
            }
            Err(e) => {
                if matches!(e, LogError::Demoted) {
                    self.elected = false;
                }
                Err(e)
            }
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Run a full consensus round for a position whose outcome this
    /// instance does not know: learn what was decided, else propose a
    /// no-op.
    async fn fill(&mut self, position: u64) -> LogResult<u64> {
        debug!("filling log position {position}");
        let responses = self
            .network
            .broadcast_promise(PromiseRequest {
                id: self.id,
                position: Some(position),
            })
            .await;
        let acks = collect_quorum(responses, self.quorum, self.options.phase_timeout, |r| r.okay)
            .await?;

        let payload = acks
            .into_iter()
            .filter_map(|ack| ack.action)
            .filter(|action| action.performed.is_some())
            .max_by_key(|action| action.performed)
            .and_then(|action| action.payload)
            .unwrap_or(Payload::Nop(Nop {}));
        self.write(position, payload).await
    }

    /// Achieve consensus on an action: write to a quorum, then commit to a
    /// quorum. The action is not acknowledged to the caller until a quorum
    /// has committed, which preserves linearizability across failover.
    async fn write(&mut self, position: u64, payload: Payload) -> LogResult<u64> {
        let request = WriteRequest {
            id: self.id,
            position,
            payload: payload.clone(),
        };

        let responses = self.network.broadcast_write(request.clone(), false).await;
        collect_quorum(responses, self.quorum, self.options.phase_timeout, |r| r.okay).await?;

        let responses = self.network.broadcast_write(request, true).await;
        collect_quorum(responses, self.quorum, self.options.phase_timeout, |r| r.okay).await?;

        // Spread the outcome to replicas that missed the commit quorum.
        self.network
            .broadcast_learned(Action {
                position,
                promised: self.id,
                performed: Some(self.id),
                learned: Some(true),
                payload: Some(payload),
            })
            .await;
        Ok(position)
    }

    async fn ending(&self) -> LogResult<u64> {
        let (tx, rx) = oneshot::channel();
        self.replica
            .send(ReplicaEvent::Ending { reply: tx })
            .await
            .map_err(|_| LogError::Cancelled)?;
        rx.await.map_err(|_| LogError::Cancelled)
    }

    async fn missing(&self, up_to: u64) -> LogResult<BTreeSet<u64>> {
        let (tx, rx) = oneshot::channel();
        self.replica
            .send(ReplicaEvent::Missing {
                up_to,
                reply: tx,
            })
            .await
            .map_err(|_| LogError::Cancelled)?;
        rx.await.map_err(|_| LogError::Cancelled)
    }

}
