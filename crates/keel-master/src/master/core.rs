use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use keel_server::actor::{Actor, ActorAction, ActorContext};
use log::info;
use tokio::time::Instant;
use uuid::Uuid;

use crate::allocator::Allocator;
use crate::id::{FrameworkId, IdGenerator, OfferId, WorkerId};
use crate::journal::{Journal, RegistryEvent};
use crate::master::{MasterEvent, MasterOptions};
use crate::messages::{Connection, StatusUpdate};
use crate::registry::{Framework, Registry, Worker};

/// A status update forwarded to a framework and not yet acknowledged.
pub(super) struct Retransmit {
    pub update: StatusUpdate,
    /// The worker to acknowledge once the framework acknowledges.
    pub worker_id: Option<WorkerId>,
    pub delays: Box<dyn Iterator<Item = Duration> + Send>,
}

pub struct MasterActor {
    pub(super) options: MasterOptions,
    pub(super) registry: Registry,
    pub(super) allocator: Allocator,
    pub(super) journal: Option<Journal>,
    pub(super) framework_ids: IdGenerator<FrameworkId>,
    pub(super) offer_ids: IdGenerator<OfferId>,
    pub(super) worker_ids: IdGenerator<WorkerId>,
    pub(super) retransmits: HashMap<Uuid, Retransmit>,
}

#[async_trait]
impl Actor for MasterActor {
    type Message = MasterEvent;
    type Options = MasterOptions;

    fn name() -> &'static str {
        "MasterActor"
    }

    fn new(mut options: MasterOptions) -> Self {
        let journal = options.journal.take();
        let recovered = std::mem::take(&mut options.recovered);
        let mut registry = Registry::new(
            options.completed_task_capacity,
            options.completed_framework_capacity,
        );
        fold_recovered(&mut registry, recovered);
        let allocator = Allocator::new(options.allocator.clone());
        let framework_ids = IdGenerator::new(options.epoch.clone());
        let offer_ids = IdGenerator::new(options.epoch.clone());
        let worker_ids = IdGenerator::new(options.epoch.clone());
        Self {
            options,
            registry,
            allocator,
            journal,
            framework_ids,
            offer_ids,
            worker_ids,
            retransmits: HashMap::new(),
        }
    }

    async fn start(&mut self, ctx: &mut ActorContext<Self>) {
        info!("master started with epoch {}", self.options.epoch);
        // Recovered frameworks must re-register before their failover
        // timeout elapses, exactly as if they had just disconnected.
        let probes = self
            .registry
            .frameworks()
            .filter(|framework| !framework.active)
            .map(|framework| {
                (
                    framework.id.clone(),
                    framework.reregistered_at,
                    framework.info.failover_timeout,
                )
            })
            .collect::<Vec<_>>();
        for (framework_id, instant, timeout) in probes {
            let event = MasterEvent::ProbeFrameworkFailover {
                framework_id,
                instant,
            };
            if timeout.is_zero() {
                ctx.send(event);
            } else {
                ctx.send_with_delay(event, timeout);
            }
        }
        ctx.send_with_delay(MasterEvent::Tick, self.options.tick_interval);
    }

    async fn receive(&mut self, ctx: &mut ActorContext<Self>, message: MasterEvent) -> ActorAction {
        match message {
            MasterEvent::RegisterFramework { info, connection } => {
                self.handle_register_framework(ctx, info, connection).await
            }
            MasterEvent::ReregisterFramework {
                framework_id,
                info,
                failover,
                connection,
            } => {
                self.handle_reregister_framework(ctx, framework_id, info, failover, connection)
                    .await
            }
            MasterEvent::UnregisterFramework { framework_id } => {
                self.handle_unregister_framework(ctx, framework_id).await
            }
            MasterEvent::DeactivateFramework { framework_id } => {
                self.handle_deactivate_framework(ctx, framework_id)
            }
            MasterEvent::FrameworkExited { framework_id } => {
                self.handle_framework_exited(ctx, framework_id).await
            }
            MasterEvent::ResourceRequest {
                framework_id,
                requests,
            } => self.handle_resource_request(ctx, framework_id, requests),
            MasterEvent::LaunchTasks {
                framework_id,
                offer_id,
                tasks,
                filters,
            } => self.handle_launch_tasks(ctx, framework_id, offer_id, tasks, filters),
            MasterEvent::ReviveOffers { framework_id } => {
                self.handle_revive_offers(ctx, framework_id)
            }
            MasterEvent::KillTask {
                framework_id,
                task_id,
            } => self.handle_kill_task(ctx, framework_id, task_id),
            MasterEvent::FrameworkToExecutor {
                framework_id,
                worker_id,
                executor_id,
                data,
            } => self.handle_framework_to_executor(ctx, framework_id, worker_id, executor_id, data),
            MasterEvent::StatusUpdateAck {
                framework_id,
                task_id,
                uuid,
            } => self.handle_status_update_ack(ctx, framework_id, task_id, uuid),
            MasterEvent::RegisterWorker { info, connection } => {
                self.handle_register_worker(ctx, info, connection).await
            }
            MasterEvent::ReregisterWorker {
                worker_id,
                info,
                executors,
                tasks,
                connection,
            } => {
                self.handle_reregister_worker(ctx, worker_id, info, executors, tasks, connection)
                    .await
            }
            MasterEvent::UnregisterWorker { worker_id } => {
                self.handle_unregister_worker(ctx, worker_id).await
            }
            MasterEvent::WorkerHeartbeat { worker_id } => {
                self.handle_worker_heartbeat(ctx, worker_id)
            }
            MasterEvent::StatusUpdate { update, worker_id } => {
                self.handle_status_update(ctx, update, worker_id)
            }
            MasterEvent::ExecutorToFramework {
                worker_id,
                framework_id,
                executor_id,
                data,
            } => self.handle_executor_to_framework(ctx, worker_id, framework_id, executor_id, data),
            MasterEvent::ExecutorExited {
                worker_id,
                framework_id,
                executor_id,
                status,
            } => self.handle_executor_exited(ctx, worker_id, framework_id, executor_id, status),
            MasterEvent::DeactivatedWorkerHostPort { hostname, port } => {
                self.handle_deactivated_worker_host_port(ctx, hostname, port)
                    .await
            }
            MasterEvent::GetState { reply } => {
                let _ = reply.send(self.registry.snapshot());
                ActorAction::Continue
            }
            MasterEvent::Tick => self.handle_tick(ctx).await,
            MasterEvent::ProbeFrameworkFailover {
                framework_id,
                instant,
            } => {
                self.handle_probe_framework_failover(ctx, framework_id, instant)
                    .await
            }
            MasterEvent::RetransmitStatusUpdate { uuid } => {
                self.handle_retransmit_status_update(ctx, uuid)
            }
            MasterEvent::Shutdown => ActorAction::Stop,
        }
    }

    async fn stop(self, _ctx: &mut ActorContext<Self>) {
        info!("master with epoch {} stopped", self.options.epoch);
    }
}

fn fold_recovered(registry: &mut Registry, recovered: Vec<RegistryEvent>) {
    for event in recovered {
        match event {
            RegistryEvent::FrameworkAdded { id, info } => {
                let mut framework = Framework::new(id, info, Connection::closed());
                framework.active = false;
                let _ = registry.add_framework(framework);
            }
            RegistryEvent::FrameworkRemoved { id } => {
                registry.remove_framework(&id);
            }
            RegistryEvent::WorkerAdded { id, info } => {
                let mut worker = Worker::new(id, info, Connection::closed());
                worker.active = false;
                worker.deactivated_at = Some(Instant::now());
                let _ = registry.add_worker(worker);
            }
            RegistryEvent::WorkerRemoved { id } => {
                registry.remove_worker(&id);
            }
        }
    }
}
