use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_common::config::AppConfig;
use keel_server::actor::{Actor, ActorAction, ActorContext, ActorHandle};
use log::{debug, warn};
use tokio::sync::oneshot;

use crate::error::{GroupError, GroupResult};
use crate::service::{CoordinationService, ServiceError, ServiceEvent, SessionId};

/// An ephemeral, sequence-ordered membership in the group. The smallest
/// live sequence is conventionally the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Membership {
    sequence: u64,
}

impl Membership {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl std::fmt::Display for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sequence)
    }
}

#[derive(Debug, Clone)]
pub struct GroupOptions {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl From<&AppConfig> for GroupOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            backoff_initial: Duration::from_secs(config.group.backoff_initial_secs),
            backoff_max: Duration::from_secs(config.group.backoff_max_secs),
        }
    }
}

pub enum GroupEvent {
    Join {
        data: Vec<u8>,
        reply: oneshot::Sender<GroupResult<Membership>>,
    },
    Cancel {
        membership: Membership,
        reply: oneshot::Sender<GroupResult<bool>>,
    },
    Info {
        membership: Membership,
        reply: oneshot::Sender<GroupResult<Vec<u8>>>,
    },
    Watch {
        expected: BTreeSet<Membership>,
        reply: oneshot::Sender<GroupResult<BTreeSet<Membership>>>,
    },
    Session {
        reply: oneshot::Sender<GroupResult<Option<SessionId>>>,
    },
    Service(ServiceEvent),
    RetryPending,
}

enum PendingOp {
    Join {
        data: Vec<u8>,
        reply: oneshot::Sender<GroupResult<Membership>>,
    },
    Cancel {
        membership: Membership,
        reply: oneshot::Sender<GroupResult<bool>>,
    },
    Info {
        membership: Membership,
        reply: oneshot::Sender<GroupResult<Vec<u8>>>,
    },
}

/// The actor funnelling all coordination service calls. While the service
/// is unreachable, operations queue and are re-driven with bounded backoff
/// on reconnect.
pub struct GroupActor {
    service: Arc<dyn CoordinationService>,
    options: GroupOptions,
    pending: VecDeque<PendingOp>,
    watchers: Vec<(
        BTreeSet<Membership>,
        oneshot::Sender<GroupResult<BTreeSet<Membership>>>,
    )>,
    backoff: Duration,
    retry_scheduled: bool,
}

#[async_trait]
impl Actor for GroupActor {
    type Message = GroupEvent;
    type Options = (Arc<dyn CoordinationService>, GroupOptions);

    fn name() -> &'static str {
        "GroupActor"
    }

    fn new((service, options): Self::Options) -> Self {
        let backoff = options.backoff_initial;
        Self {
            service,
            options,
            pending: VecDeque::new(),
            watchers: vec![],
            backoff,
            retry_scheduled: false,
        }
    }

    async fn start(&mut self, ctx: &mut ActorContext<Self>) {
        // Pump service connectivity and change events into the mailbox.
        let mut events = self.service.subscribe();
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if handle.send(GroupEvent::Service(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("dropped {n} coordination service event(s)");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn receive(&mut self, ctx: &mut ActorContext<Self>, message: GroupEvent) -> ActorAction {
        match message {
            GroupEvent::Join { data, reply } => {
                self.drive(ctx, PendingOp::Join { data, reply }).await;
            }
            GroupEvent::Cancel { membership, reply } => {
                self.drive(ctx, PendingOp::Cancel { membership, reply }).await;
            }
            GroupEvent::Info { membership, reply } => {
                self.drive(ctx, PendingOp::Info { membership, reply }).await;
            }
            GroupEvent::Watch { expected, reply } => {
                match self.service.list().await {
                    Ok(live) => {
                        let live = to_memberships(live);
                        if live != expected {
                            let _ = reply.send(Ok(live));
                        } else {
                            self.watchers.push((expected, reply));
                        }
                    }
                    // Leave the watcher parked until connectivity returns.
                    Err(_) => self.watchers.push((expected, reply)),
                }
            }
            GroupEvent::Session { reply } => {
                let _ = reply.send(Ok(self.service.session()));
            }
            GroupEvent::Service(event) => {
                debug!("coordination service event: {event:?}");
                match event {
                    ServiceEvent::Connected => {
                        self.backoff = self.options.backoff_initial;
                        self.drain(ctx).await;
                        self.refresh_watchers().await;
                    }
                    ServiceEvent::Reconnecting => {}
                    ServiceEvent::Expired => {
                        // In-flight memberships died with the session;
                        // callers must re-join.
                        for op in self.pending.drain(..) {
                            fail(op, GroupError::SessionExpired);
                        }
                        self.refresh_watchers().await;
                    }
                    ServiceEvent::Changed => {
                        self.refresh_watchers().await;
                    }
                }
            }
            GroupEvent::RetryPending => {
                self.retry_scheduled = false;
                self.drain(ctx).await;
            }
        }
        ActorAction::Continue
    }

    async fn stop(mut self, _ctx: &mut ActorContext<Self>) {
        for op in self.pending.drain(..) {
            fail(op, GroupError::Cancelled);
        }
    }
}

impl GroupActor {
    async fn drive(&mut self, ctx: &mut ActorContext<Self>, op: PendingOp) {
        if let Some(op) = self.attempt(op).await {
            self.pending.push_back(op);
            self.schedule_retry(ctx);
        }
    }

    /// Attempt an operation against the service, returning it back if it
    /// must be re-driven later.
    async fn attempt(&mut self, op: PendingOp) -> Option<PendingOp> {
        match op {
            PendingOp::Join { data, reply } => {
                match self.service.create_ephemeral(data.clone()).await {
                    Ok(sequence) => {
                        let _ = reply.send(Ok(Membership { sequence }));
                        None
                    }
                    Err(ServiceError::Disconnected) => Some(PendingOp::Join { data, reply }),
                    Err(ServiceError::Other(e)) => {
                        let _ = reply.send(Err(GroupError::Service(e)));
                        None
                    }
                }
            }
            PendingOp::Cancel { membership, reply } => {
                match self.service.delete(membership.sequence).await {
                    Ok(removed) => {
                        let _ = reply.send(Ok(removed));
                        None
                    }
                    Err(ServiceError::Disconnected) => {
                        Some(PendingOp::Cancel { membership, reply })
                    }
                    Err(ServiceError::Other(e)) => {
                        let _ = reply.send(Err(GroupError::Service(e)));
                        None
                    }
                }
            }
            PendingOp::Info { membership, reply } => {
                match self.service.data(membership.sequence).await {
                    Ok(Some(data)) => {
                        let _ = reply.send(Ok(data));
                        None
                    }
                    Ok(None) => {
                        let _ = reply
                            .send(Err(GroupError::UnknownMembership(membership.sequence)));
                        None
                    }
                    Err(ServiceError::Disconnected) => Some(PendingOp::Info { membership, reply }),
                    Err(ServiceError::Other(e)) => {
                        let _ = reply.send(Err(GroupError::Service(e)));
                        None
                    }
                }
            }
        }
    }

    async fn drain(&mut self, ctx: &mut ActorContext<Self>) {
        let mut deferred = VecDeque::new();
        while let Some(op) = self.pending.pop_front() {
            if let Some(op) = self.attempt(op).await {
                deferred.push_back(op);
            }
        }
        self.pending = deferred;
        if !self.pending.is_empty() {
            self.schedule_retry(ctx);
        }
    }

    fn schedule_retry(&mut self, ctx: &mut ActorContext<Self>) {
        if self.retry_scheduled {
            return;
        }
        self.retry_scheduled = true;
        debug!("re-driving pending group operations in {:?}", self.backoff);
        ctx.send_with_delay(GroupEvent::RetryPending, self.backoff);
        self.backoff = std::cmp::min(self.backoff * 2, self.options.backoff_max);
    }

    async fn refresh_watchers(&mut self) {
        let Ok(live) = self.service.list().await else {
            return;
        };
        let live = to_memberships(live);
        let mut parked = vec![];
        for (expected, reply) in self.watchers.drain(..) {
            if live != expected {
                let _ = reply.send(Ok(live.clone()));
            } else {
                parked.push((expected, reply));
            }
        }
        self.watchers = parked;
    }
}

fn to_memberships(sequences: Vec<u64>) -> BTreeSet<Membership> {
    sequences
        .into_iter()
        .map(|sequence| Membership { sequence })
        .collect()
}

fn fail(op: PendingOp, error: GroupError) {
    match op {
        PendingOp::Join { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        PendingOp::Cancel { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        PendingOp::Info { reply, .. } => {
            let _ = reply.send(Err(error));
        }
    }
}

/// The client-facing view of the group.
#[derive(Clone)]
pub struct Group {
    handle: ActorHandle<GroupActor>,
}

impl Group {
    pub fn new(service: Arc<dyn CoordinationService>, options: GroupOptions) -> Self {
        Self {
            handle: ActorHandle::new((service, options)),
        }
    }

    pub async fn join(&self, data: Vec<u8>) -> GroupResult<Membership> {
        let (tx, rx) = oneshot::channel();
        self.handle
            .send(GroupEvent::Join { data, reply: tx })
            .await
            .map_err(|_| GroupError::Cancelled)?;
        rx.await.map_err(|_| GroupError::Cancelled)?
    }

    pub async fn cancel(&self, membership: Membership) -> GroupResult<bool> {
        let (tx, rx) = oneshot::channel();
        self.handle
            .send(GroupEvent::Cancel {
                membership,
                reply: tx,
            })
            .await
            .map_err(|_| GroupError::Cancelled)?;
        rx.await.map_err(|_| GroupError::Cancelled)?
    }

    pub async fn info(&self, membership: Membership) -> GroupResult<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.handle
            .send(GroupEvent::Info {
                membership,
                reply: tx,
            })
            .await
            .map_err(|_| GroupError::Cancelled)?;
        rx.await.map_err(|_| GroupError::Cancelled)?
    }

    /// Wait until the live membership set differs from `expected`, and
    /// return the new set.
    pub async fn watch(&self, expected: BTreeSet<Membership>) -> GroupResult<BTreeSet<Membership>> {
        let (tx, rx) = oneshot::channel();
        self.handle
            .send(GroupEvent::Watch {
                expected,
                reply: tx,
            })
            .await
            .map_err(|_| GroupError::Cancelled)?;
        rx.await.map_err(|_| GroupError::Cancelled)?
    }

    pub async fn session(&self) -> GroupResult<Option<SessionId>> {
        let (tx, rx) = oneshot::channel();
        self.handle
            .send(GroupEvent::Session { reply: tx })
            .await
            .map_err(|_| GroupError::Cancelled)?;
        rx.await.map_err(|_| GroupError::Cancelled)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::LocalCoordinationService;

    fn group(service: &Arc<LocalCoordinationService>) -> Group {
        Group::new(
            Arc::clone(service) as Arc<dyn CoordinationService>,
            GroupOptions {
                backoff_initial: Duration::from_secs(2),
                backoff_max: Duration::from_secs(60),
            },
        )
    }

    #[tokio::test]
    async fn test_join_watch_cancel() {
        let service = Arc::new(LocalCoordinationService::new());
        let group = group(&service);

        let membership = group.join(b"master@host:5050".to_vec()).await.unwrap();
        assert_eq!(group.info(membership).await.unwrap(), b"master@host:5050");

        let live = group.watch(BTreeSet::new()).await.unwrap();
        assert_eq!(live, BTreeSet::from([membership]));

        // The second joiner sorts after the first; the smallest sequence
        // stays the leader.
        let other = group.join(b"standby@host:5051".to_vec()).await.unwrap();
        assert!(membership < other);
        assert_eq!(live.iter().next(), Some(&membership));

        assert!(group.cancel(membership).await.unwrap());
        assert!(!group.cancel(membership).await.unwrap());

        let live = group
            .watch(BTreeSet::from([membership, other]))
            .await
            .unwrap();
        assert_eq!(live, BTreeSet::from([other]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_queues_operations() {
        let service = Arc::new(LocalCoordinationService::new());
        let group = group(&service);

        service.disconnect();
        assert_eq!(group.session().await.unwrap(), None);

        let pending = {
            let group = group.clone();
            tokio::spawn(async move { group.join(b"master".to_vec()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pending.is_finished());

        service.reconnect();
        let membership = pending.await.unwrap().unwrap();
        assert_eq!(group.info(membership).await.unwrap(), b"master");
        assert!(group.session().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_session_expiry_invalidates_memberships() {
        let service = Arc::new(LocalCoordinationService::new());
        let group = group(&service);

        let membership = group.join(b"master".to_vec()).await.unwrap();
        let session = group.session().await.unwrap().unwrap();

        service.expire_session();

        // The old membership is gone and the session is new; the caller
        // must re-join.
        let result = group.info(membership).await;
        assert!(matches!(result, Err(GroupError::UnknownMembership(_))));
        assert_ne!(group.session().await.unwrap(), Some(session));

        let rejoined = group.join(b"master".to_vec()).await.unwrap();
        assert!(rejoined > membership);
    }
}
