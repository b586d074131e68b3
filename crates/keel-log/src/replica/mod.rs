mod core;
mod event;
mod state;

pub use self::core::ReplicaActor;
pub use event::ReplicaEvent;
pub use state::{Replica, ReplicaOptions};

use keel_server::actor::ActorHandle;

use crate::error::LogResult;

pub type ReplicaHandle = ActorHandle<ReplicaActor>;

/// Open the replica's record file and spawn the replica actor.
pub async fn spawn_replica(options: ReplicaOptions) -> LogResult<ReplicaHandle> {
    let replica = Replica::open(options).await?;
    Ok(ActorHandle::new(replica))
}
