use async_trait::async_trait;
use keel_server::actor::{Actor, ActorAction, ActorContext};
use log::error;

use crate::error::LogError;
use crate::replica::{Replica, ReplicaEvent};

/// The actor that owns one replica's log file. No other actor opens it.
pub struct ReplicaActor {
    replica: Replica,
}

#[async_trait]
impl Actor for ReplicaActor {
    type Message = ReplicaEvent;
    type Options = Replica;

    fn name() -> &'static str {
        "ReplicaActor"
    }

    fn new(replica: Replica) -> Self {
        Self { replica }
    }

    async fn start(&mut self, _ctx: &mut ActorContext<Self>) {}

    async fn receive(&mut self, _ctx: &mut ActorContext<Self>, message: ReplicaEvent) -> ActorAction {
        match message {
            ReplicaEvent::Promise { request, reply } => {
                match self.replica.promise(request).await {
                    Ok(response) => {
                        let _ = reply.send(response);
                        ActorAction::Continue
                    }
                    // Remaining silent is equivalent to pretending the
                    // request never made it here; the coordinator treats it
                    // as a timeout rather than a demotion.
                    Err(e) => self.storage_failure(e),
                }
            }
            ReplicaEvent::Write { request, reply } => match self.replica.write(request).await {
                Ok(response) => {
                    let _ = reply.send(response);
                    ActorAction::Continue
                }
                Err(e) => self.storage_failure(e),
            },
            ReplicaEvent::Commit { request, reply } => match self.replica.commit(request).await {
                Ok(response) => {
                    let _ = reply.send(response);
                    ActorAction::Continue
                }
                Err(e) => self.storage_failure(e),
            },
            ReplicaEvent::Learned { action } => match self.replica.learned(action).await {
                Ok(()) => ActorAction::Continue,
                Err(e) => self.storage_failure(e),
            },
            ReplicaEvent::Learn { position, reply } => {
                match self.replica.learn(position).await {
                    Ok(response) => {
                        let _ = reply.send(response);
                        ActorAction::Continue
                    }
                    Err(e) => self.storage_failure(e),
                }
            }
            ReplicaEvent::Read { from, to, reply } => {
                let _ = reply.send(self.replica.read_range(from, to).await);
                ActorAction::Continue
            }
            ReplicaEvent::Missing { up_to, reply } => {
                let _ = reply.send(self.replica.missing(up_to));
                ActorAction::Continue
            }
            ReplicaEvent::Beginning { reply } => {
                let _ = reply.send(self.replica.beginning());
                ActorAction::Continue
            }
            ReplicaEvent::Ending { reply } => {
                let _ = reply.send(self.replica.ending());
                ActorAction::Continue
            }
            ReplicaEvent::Promised { reply } => {
                let _ = reply.send(self.replica.promised());
                ActorAction::Continue
            }
            ReplicaEvent::Shutdown => ActorAction::Stop,
        }
    }

    async fn stop(self, _ctx: &mut ActorContext<Self>) {}
}

impl ReplicaActor {
    /// Storage failure is fatal to this replica but not to the cluster;
    /// the quorum survives without it.
    fn storage_failure(&self, e: LogError) -> ActorAction {
        error!("replica failed: {e}");
        match e {
            LogError::Persistence(_) => ActorAction::Stop,
            _ => ActorAction::Continue,
        }
    }
}
