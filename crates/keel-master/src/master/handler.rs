use std::collections::HashSet;

use keel_server::actor::{ActorAction, ActorContext};
use log::{debug, error, info, warn};
use tokio::time::Instant;
use uuid::Uuid;

use crate::allocator::{Allocation, OfferReturnReason};
use crate::error::MasterError;
use crate::id::{ExecutorId, FrameworkId, OfferId, TaskId, TaskKey, WorkerId};
use crate::journal::RegistryEvent;
use crate::master::core::Retransmit;
use crate::master::{MasterActor, MasterEvent};
use crate::messages::{
    Connection, Filters, FrameworkInfo, FrameworkMessage, OfferDescription, ReportedExecutor,
    ReportedTask, ResourceRequest, StatusUpdate, TaskDescription, TaskState, WorkerInfo,
    WorkerMessage,
};
use crate::registry::{Executor, Framework, Offer, Task, Worker};
use crate::resources::Resources;
use crate::MasterResult;

impl MasterActor {
    pub(super) async fn handle_register_framework(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        mut info: FrameworkInfo,
        connection: Connection<FrameworkMessage>,
    ) -> ActorAction {
        let Ok(framework_id) = self.framework_ids.next() else {
            error!("failed to generate framework IDs");
            return ActorAction::Stop;
        };
        info.failover_timeout =
            info.failover_timeout.min(self.options.framework_failover_timeout_max);
        if !self
            .journal(RegistryEvent::FrameworkAdded {
                id: framework_id.clone(),
                info: info.clone(),
            })
            .await
        {
            return ActorAction::Stop;
        }
        info!("registering framework {framework_id} ({}) for user {}", info.name, info.user);
        let framework = Framework::new(framework_id.clone(), info, connection);
        framework.connection.send(FrameworkMessage::Registered {
            framework_id: framework_id.clone(),
        });
        if let Err(e) = self.registry.add_framework(framework) {
            warn!("failed to add framework {framework_id}: {e}");
            return ActorAction::Continue;
        }
        let result = self.allocator.framework_added(&self.registry, Instant::now());
        self.dispatch_offers(result);
        ActorAction::Continue
    }

    pub(super) async fn handle_reregister_framework(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        mut info: FrameworkInfo,
        failover: bool,
        connection: Connection<FrameworkMessage>,
    ) -> ActorAction {
        enum Outcome {
            AcceptedAsNew,
            Reattached,
            FailedOver,
            Rejected,
        }
        let outcome = match self.registry.framework_mut(&framework_id) {
            None => Outcome::AcceptedAsNew,
            Some(framework) if !framework.active => {
                info!("re-registering disconnected framework {framework_id}");
                framework.connection = connection.clone();
                framework.active = true;
                framework.reregistered_at = Instant::now();
                framework.connection.send(FrameworkMessage::Reregistered {
                    framework_id: framework_id.clone(),
                });
                Outcome::Reattached
            }
            Some(framework) => {
                if failover {
                    info!("framework {framework_id} failed over to a new scheduler");
                    let previous = std::mem::replace(&mut framework.connection, connection.clone());
                    previous.send(FrameworkMessage::Error {
                        code: 1,
                        message: "Framework failed over".to_string(),
                    });
                    framework.reregistered_at = Instant::now();
                    framework.connection.send(FrameworkMessage::Reregistered {
                        framework_id: framework_id.clone(),
                    });
                    Outcome::FailedOver
                } else {
                    warn!("framework {framework_id} attempted to re-register while connected");
                    connection.send(FrameworkMessage::Error {
                        code: 1,
                        message: "Framework with this id is already connected".to_string(),
                    });
                    Outcome::Rejected
                }
            }
        };
        match outcome {
            Outcome::AcceptedAsNew => {
                // The id was minted by a previous master epoch; accept the
                // framework back under the id it presents.
                info!("re-registering unknown framework {framework_id}; accepting as new");
                info.failover_timeout =
                    info.failover_timeout.min(self.options.framework_failover_timeout_max);
                if !self
                    .journal(RegistryEvent::FrameworkAdded {
                        id: framework_id.clone(),
                        info: info.clone(),
                    })
                    .await
                {
                    return ActorAction::Stop;
                }
                let framework = Framework::new(framework_id.clone(), info, connection);
                framework.connection.send(FrameworkMessage::Reregistered {
                    framework_id: framework_id.clone(),
                });
                if let Err(e) = self.registry.add_framework(framework) {
                    warn!("failed to re-add framework {framework_id}: {e}");
                    return ActorAction::Continue;
                }
                let result = self.allocator.framework_added(&self.registry, Instant::now());
                self.dispatch_offers(result);
            }
            Outcome::Reattached => {
                let result = self.allocator.framework_added(&self.registry, Instant::now());
                self.dispatch_offers(result);
            }
            Outcome::FailedOver | Outcome::Rejected => {}
        }
        ActorAction::Continue
    }

    pub(super) async fn handle_unregister_framework(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
    ) -> ActorAction {
        if self.registry.framework(&framework_id).is_none() {
            warn!("cannot unregister unknown framework {framework_id}");
            return ActorAction::Continue;
        }
        info!("unregistering framework {framework_id}");
        if self.remove_framework(ctx, &framework_id).await {
            ActorAction::Continue
        } else {
            ActorAction::Stop
        }
    }

    pub(super) fn handle_deactivate_framework(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
    ) -> ActorAction {
        let Some(framework) = self.registry.framework_mut(&framework_id) else {
            warn!("cannot deactivate unknown framework {framework_id}");
            return ActorAction::Continue;
        };
        info!("deactivating framework {framework_id}");
        framework.active = false;
        let returned = self.rescind_framework_offers(&framework_id);
        let result = self.allocator.offer_returned(
            &self.registry,
            OfferReturnReason::OfferRescinded,
            &framework_id,
            returned,
            &Filters::default(),
            Instant::now(),
        );
        self.dispatch_offers(result);
        ActorAction::Continue
    }

    pub(super) async fn handle_framework_exited(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
    ) -> ActorAction {
        let Some(framework) = self.registry.framework_mut(&framework_id) else {
            return ActorAction::Continue;
        };
        if !framework.active {
            return ActorAction::Continue;
        }
        framework.active = false;
        let failover_timeout = framework.info.failover_timeout;
        let instant = framework.reregistered_at;
        let returned = self.rescind_framework_offers(&framework_id);
        let result = self.allocator.offer_returned(
            &self.registry,
            OfferReturnReason::OfferRescinded,
            &framework_id,
            returned,
            &Filters::default(),
            Instant::now(),
        );
        self.dispatch_offers(result);
        if failover_timeout.is_zero() {
            info!("framework {framework_id} disconnected without a failover timeout; removing it");
            if !self.remove_framework(ctx, &framework_id).await {
                return ActorAction::Stop;
            }
        } else {
            info!(
                "framework {framework_id} disconnected; allowing {failover_timeout:?} for it to failover"
            );
            ctx.send_with_delay(
                MasterEvent::ProbeFrameworkFailover {
                    framework_id,
                    instant,
                },
                failover_timeout,
            );
        }
        ActorAction::Continue
    }

    pub(super) async fn handle_probe_framework_failover(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        instant: Instant,
    ) -> ActorAction {
        let Some(framework) = self.registry.framework(&framework_id) else {
            return ActorAction::Continue;
        };
        if framework.active || framework.reregistered_at > instant {
            // The framework came back before the timeout elapsed.
            return ActorAction::Continue;
        }
        warn!("framework {framework_id} failover timeout elapsed; removing it");
        if self.remove_framework(ctx, &framework_id).await {
            ActorAction::Continue
        } else {
            ActorAction::Stop
        }
    }

    pub(super) fn handle_resource_request(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        requests: Vec<ResourceRequest>,
    ) -> ActorAction {
        let Some(framework) = self.registry.framework_mut(&framework_id) else {
            warn!("dropping resource request from unknown framework {framework_id}");
            return ActorAction::Continue;
        };
        debug!(
            "recording {} resource request(s) from framework {framework_id}",
            requests.len()
        );
        framework.resource_requests = requests;
        ActorAction::Continue
    }

    pub(super) fn handle_launch_tasks(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        offer_id: OfferId,
        tasks: Vec<TaskDescription>,
        filters: Filters,
    ) -> ActorAction {
        let offer_valid = self
            .registry
            .offer(&offer_id)
            .is_some_and(|offer| offer.framework_id == framework_id);
        if !offer_valid {
            warn!("framework {framework_id} replied to unknown or foreign offer {offer_id}");
            for task in tasks {
                let update =
                    StatusUpdate::new(framework_id.clone(), task.task_id, TaskState::Lost)
                        .with_message("task launched with an invalid offer");
                self.forward_status_update(ctx, update, None);
            }
            return ActorAction::Continue;
        }
        let Some(offer) = self.registry.remove_offer(&offer_id) else {
            return ActorAction::Continue;
        };
        let worker_id = offer.worker_id.clone();
        let mut remaining = offer.resources.clone();
        let framework_info = self
            .registry
            .framework(&framework_id)
            .map(|framework| framework.info.clone());

        for task in tasks {
            let key = TaskKey::new(framework_id.clone(), task.task_id.clone());
            if let Err(reason) = self.try_launch_task(&key, &task, &worker_id, &mut remaining) {
                warn!("declining {key}: {reason}");
                let update = StatusUpdate::new(
                    framework_id.clone(),
                    task.task_id.clone(),
                    TaskState::Lost,
                )
                .with_message(reason.to_string());
                self.forward_status_update(ctx, update, None);
                continue;
            }
            info!("launching {key} on worker {worker_id}");
            if let (Some(worker), Some(info)) =
                (self.registry.worker(&worker_id), framework_info.as_ref())
            {
                worker.connection.send(WorkerMessage::LaunchTask {
                    framework_id: framework_id.clone(),
                    framework_info: info.clone(),
                    task,
                });
            }
        }

        let result = self.allocator.offer_returned(
            &self.registry,
            OfferReturnReason::FrameworkReplied,
            &framework_id,
            vec![(worker_id, remaining)],
            &filters,
            Instant::now(),
        );
        self.dispatch_offers(result);
        ActorAction::Continue
    }

    /// Validate one task against the remaining offered resources and
    /// record it if it fits.
    fn try_launch_task(
        &mut self,
        key: &TaskKey,
        task: &TaskDescription,
        worker_id: &WorkerId,
        remaining: &mut Resources,
    ) -> MasterResult<()> {
        if !self.registry.worker(worker_id).is_some_and(|w| w.active) {
            return Err(MasterError::Rejected(format!(
                "worker {worker_id} is no longer available"
            )));
        }
        if self.registry.task(key).is_some() {
            return Err(MasterError::Duplicate(format!(
                "task id {} is already in use",
                task.task_id
            )));
        }
        if task.resources.is_empty() {
            return Err(MasterError::Rejected("task uses no resources".to_string()));
        }
        let mut needed = task.resources.clone();
        let mut new_executor = None;
        if let Some(executor) = &task.executor {
            let running = self
                .registry
                .worker(worker_id)
                .is_some_and(|w| w.has_executor(&key.framework_id, &executor.executor_id));
            if !running {
                needed += &executor.resources;
                new_executor = Some(executor.clone());
            }
        }
        if !remaining.contains(&needed) {
            return Err(MasterError::Rejected(format!(
                "insufficient resources: task needs {needed} but only {remaining} remain"
            )));
        }
        *remaining -= &needed;
        if let Some(executor) = new_executor {
            self.registry.add_executor(Executor {
                framework_id: key.framework_id.clone(),
                worker_id: worker_id.clone(),
                info: executor,
            })?;
        }
        self.registry.add_task(Task {
            framework_id: key.framework_id.clone(),
            task_id: task.task_id.clone(),
            worker_id: worker_id.clone(),
            executor_id: task.executor.as_ref().map(|e| e.executor_id.clone()),
            name: task.name.clone(),
            resources: task.resources.clone(),
            state: TaskState::Staging,
            statuses: vec![],
        })?;
        Ok(())
    }

    pub(super) fn handle_revive_offers(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
    ) -> ActorAction {
        if self.registry.framework(&framework_id).is_none() {
            warn!("cannot revive offers for unknown framework {framework_id}");
            return ActorAction::Continue;
        }
        debug!("reviving offers for framework {framework_id}");
        let result = self
            .allocator
            .offers_revived(&self.registry, &framework_id, Instant::now());
        self.dispatch_offers(result);
        ActorAction::Continue
    }

    pub(super) fn handle_kill_task(
        &mut self,
        ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        task_id: TaskId,
    ) -> ActorAction {
        let key = TaskKey::new(framework_id.clone(), task_id.clone());
        match self.registry.task(&key) {
            Some(task) => {
                if let Some(worker) = self.registry.worker(&task.worker_id) {
                    worker.connection.send(WorkerMessage::KillTask {
                        framework_id,
                        task_id,
                    });
                }
            }
            None => {
                warn!("cannot kill unknown {key}");
                let update = StatusUpdate::new(framework_id, task_id, TaskState::Lost)
                    .with_message("attempted to kill an unknown task");
                self.forward_status_update(ctx, update, None);
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_framework_to_executor(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        worker_id: WorkerId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    ) -> ActorAction {
        if self.registry.framework(&framework_id).is_none()
            || self.registry.executor(&framework_id, &executor_id).is_none()
        {
            warn!(
                "dropping framework message for unknown executor {executor_id} of framework {framework_id}"
            );
            return ActorAction::Continue;
        }
        if let Some(worker) = self.registry.worker(&worker_id) {
            worker.connection.send(WorkerMessage::FrameworkToExecutor {
                framework_id,
                executor_id,
                data,
            });
        }
        ActorAction::Continue
    }

    pub(super) fn handle_status_update_ack(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: Uuid,
    ) -> ActorAction {
        let Some(retransmit) = self.retransmits.remove(&uuid) else {
            debug!("absorbing duplicate acknowledgement {uuid}");
            return ActorAction::Continue;
        };
        if let Some(worker_id) = retransmit.worker_id {
            if let Some(worker) = self.registry.worker(&worker_id) {
                worker.connection.send(WorkerMessage::StatusUpdateAck {
                    framework_id,
                    task_id,
                    uuid,
                });
            }
        }
        ActorAction::Continue
    }

    pub(super) async fn handle_register_worker(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        info: WorkerInfo,
        connection: Connection<WorkerMessage>,
    ) -> ActorAction {
        if self.registry.has_worker_host_port(&info.hostname, info.port) {
            warn!(
                "worker at {}:{} attempted to register a second time",
                info.hostname, info.port
            );
            connection.send(WorkerMessage::Shutdown {
                message: "worker endpoint is already registered".to_string(),
            });
            return ActorAction::Continue;
        }
        let Ok(worker_id) = self.worker_ids.next() else {
            error!("failed to generate worker IDs");
            return ActorAction::Stop;
        };
        if !self
            .journal(RegistryEvent::WorkerAdded {
                id: worker_id.clone(),
                info: info.clone(),
            })
            .await
        {
            return ActorAction::Stop;
        }
        info!(
            "registering worker {worker_id} at {}:{} with {}",
            info.hostname, info.port, info.resources
        );
        let worker = Worker::new(worker_id.clone(), info, connection);
        worker.connection.send(WorkerMessage::Registered {
            worker_id: worker_id.clone(),
        });
        if let Err(e) = self.registry.add_worker(worker) {
            warn!("failed to add worker {worker_id}: {e}");
            return ActorAction::Continue;
        }
        let result = self
            .allocator
            .worker_added(&self.registry, &worker_id, Instant::now());
        self.dispatch_offers(result);
        ActorAction::Continue
    }

    pub(super) async fn handle_reregister_worker(
        &mut self,
        ctx: &mut ActorContext<Self>,
        worker_id: WorkerId,
        info: WorkerInfo,
        executors: Vec<ReportedExecutor>,
        tasks: Vec<ReportedTask>,
        connection: Connection<WorkerMessage>,
    ) -> ActorAction {
        match self.registry.worker_mut(&worker_id) {
            None => {
                // A worker from a previous master epoch: fold it and its
                // reported state back in.
                info!("re-registering unknown worker {worker_id}; re-adding it");
                if !self
                    .journal(RegistryEvent::WorkerAdded {
                        id: worker_id.clone(),
                        info: info.clone(),
                    })
                    .await
                {
                    return ActorAction::Stop;
                }
                let worker = Worker::new(worker_id.clone(), info, connection);
                worker.connection.send(WorkerMessage::Reregistered {
                    worker_id: worker_id.clone(),
                });
                if let Err(e) = self.registry.add_worker(worker) {
                    warn!("failed to re-add worker {worker_id}: {e}");
                    return ActorAction::Continue;
                }
                self.fold_in_reported(ctx, &worker_id, executors, tasks, true);
                let result = self
                    .allocator
                    .worker_added(&self.registry, &worker_id, Instant::now());
                self.dispatch_offers(result);
            }
            Some(worker) => {
                info!("re-registering worker {worker_id}");
                let was_active = worker.active;
                worker.connection = connection;
                worker.active = true;
                worker.deactivated_at = None;
                worker.last_heartbeat = Instant::now();
                worker.connection.send(WorkerMessage::Reregistered {
                    worker_id: worker_id.clone(),
                });
                self.fold_in_reported(ctx, &worker_id, executors, tasks, false);
                let result = if was_active {
                    self.allocator
                        .task_ended(&self.registry, &worker_id, Instant::now())
                } else {
                    self.allocator
                        .worker_added(&self.registry, &worker_id, Instant::now())
                };
                self.dispatch_offers(result);
            }
        }
        ActorAction::Continue
    }

    /// Reconcile the state a re-registering worker reports with the
    /// registry. With `readd` set (the worker is new to this master), the
    /// reported tasks of known frameworks are folded in as live state;
    /// otherwise tasks the master does not know are killed.
    fn fold_in_reported(
        &mut self,
        ctx: &mut ActorContext<Self>,
        worker_id: &WorkerId,
        executors: Vec<ReportedExecutor>,
        tasks: Vec<ReportedTask>,
        readd: bool,
    ) {
        for reported in executors {
            if self
                .registry
                .executor(&reported.framework_id, &reported.executor.executor_id)
                .is_some()
            {
                continue;
            }
            if let Err(e) = self.registry.add_executor(Executor {
                framework_id: reported.framework_id.clone(),
                worker_id: worker_id.clone(),
                info: reported.executor,
            }) {
                warn!("dropping reported executor of framework {}: {e}", reported.framework_id);
            }
        }

        let reported_keys = tasks
            .iter()
            .map(|task| TaskKey::new(task.framework_id.clone(), task.task_id.clone()))
            .collect::<HashSet<_>>();

        for reported in tasks {
            let key = TaskKey::new(reported.framework_id.clone(), reported.task_id.clone());
            let known = self
                .registry
                .task(&key)
                .map(|task| (task.worker_id.clone(), task.state));
            match known {
                None if readd && self.registry.framework(&reported.framework_id).is_some() => {
                    if let Err(e) = self.registry.add_task(Task {
                        framework_id: reported.framework_id,
                        task_id: reported.task_id,
                        worker_id: worker_id.clone(),
                        executor_id: reported.executor_id,
                        name: reported.name,
                        resources: reported.resources,
                        state: reported.state,
                        statuses: vec![],
                    }) {
                        warn!("dropping reported task: {e}");
                    }
                }
                None => {
                    // The master does not know the task: tell the worker
                    // to kill it.
                    info!("killing unknown {key} reported by worker {worker_id}");
                    if let Some(worker) = self.registry.worker(worker_id) {
                        worker.connection.send(WorkerMessage::KillTask {
                            framework_id: key.framework_id.clone(),
                            task_id: key.task_id.clone(),
                        });
                    }
                }
                Some((task_worker, _)) if task_worker != *worker_id => {
                    warn!("{key} is registered on worker {task_worker}; killing the copy on {worker_id}");
                    if let Some(worker) = self.registry.worker(worker_id) {
                        worker.connection.send(WorkerMessage::KillTask {
                            framework_id: key.framework_id.clone(),
                            task_id: key.task_id.clone(),
                        });
                    }
                }
                Some((_, state)) => {
                    if state != reported.state && state.can_transition(reported.state) {
                        let update = StatusUpdate::new(
                            key.framework_id.clone(),
                            key.task_id.clone(),
                            reported.state,
                        )
                        .with_message("reconciled after worker re-registration");
                        self.apply_status_update(ctx, update, None);
                    }
                }
            }
        }

        // Tasks the master placed on this worker that the worker did not
        // report are gone.
        for key in self.registry.tasks_on_worker(worker_id) {
            if !reported_keys.contains(&key) {
                let update =
                    StatusUpdate::new(key.framework_id.clone(), key.task_id.clone(), TaskState::Lost)
                        .with_message("task was not reported by the re-registered worker");
                self.apply_status_update(ctx, update, None);
            }
        }
    }

    pub(super) async fn handle_unregister_worker(
        &mut self,
        ctx: &mut ActorContext<Self>,
        worker_id: WorkerId,
    ) -> ActorAction {
        if self.registry.worker(&worker_id).is_none() {
            warn!("cannot unregister unknown worker {worker_id}");
            return ActorAction::Continue;
        }
        info!("unregistering worker {worker_id}");
        if self.remove_worker(ctx, &worker_id).await {
            ActorAction::Continue
        } else {
            ActorAction::Stop
        }
    }

    pub(super) fn handle_worker_heartbeat(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        worker_id: WorkerId,
    ) -> ActorAction {
        let Some(worker) = self.registry.worker_mut(&worker_id) else {
            warn!("dropping heartbeat from unknown worker {worker_id}");
            return ActorAction::Continue;
        };
        worker.last_heartbeat = Instant::now();
        ActorAction::Continue
    }

    pub(super) fn handle_status_update(
        &mut self,
        ctx: &mut ActorContext<Self>,
        update: StatusUpdate,
        worker_id: Option<WorkerId>,
    ) -> ActorAction {
        self.apply_status_update(ctx, update, worker_id);
        ActorAction::Continue
    }

    /// The status update pipeline: validate, record history, transition,
    /// release terminal tasks, and forward to the framework with
    /// retransmission until acknowledged.
    fn apply_status_update(
        &mut self,
        ctx: &mut ActorContext<Self>,
        update: StatusUpdate,
        worker_id: Option<WorkerId>,
    ) {
        let key = TaskKey::new(update.framework_id.clone(), update.task_id.clone());
        if self.registry.framework(&update.framework_id).is_none() {
            warn!("dropping status update for unknown framework {}", update.framework_id);
            self.acknowledge_worker(&worker_id, &update);
            return;
        }
        let Some(task) = self.registry.task_mut(&key) else {
            warn!("dropping status update for unknown {key}");
            self.acknowledge_worker(&worker_id, &update);
            return;
        };
        if task.statuses.iter().any(|status| status.uuid == update.uuid) {
            // A retransmission of an already processed update; the
            // original forwarding cycle is still in flight or done.
            debug!("absorbing duplicate status update {} for {key}", update.uuid);
            self.acknowledge_worker(&worker_id, &update);
            return;
        }
        if !task.state.can_transition(update.state) {
            debug!(
                "discarding stale status update {} -> {} for {key}",
                task.state, update.state
            );
            self.acknowledge_worker(&worker_id, &update);
            return;
        }
        info!("status update: {key} is now {}", update.state);
        task.statuses.push(update.clone());
        task.state = update.state;
        if update.state.is_terminal() {
            let task_worker = task.worker_id.clone();
            self.registry.remove_task(&key);
            let result = self
                .allocator
                .task_ended(&self.registry, &task_worker, Instant::now());
            self.dispatch_offers(result);
        }
        self.forward_status_update(ctx, update, worker_id);
    }

    /// Forward a status update to its framework, retransmitting with
    /// backoff until the framework acknowledges it. The reporting worker
    /// is acknowledged when that happens.
    fn forward_status_update(
        &mut self,
        ctx: &mut ActorContext<Self>,
        update: StatusUpdate,
        worker_id: Option<WorkerId>,
    ) {
        let Some(framework) = self.registry.framework(&update.framework_id) else {
            self.acknowledge_worker(&worker_id, &update);
            return;
        };
        framework.connection.send(FrameworkMessage::StatusUpdate {
            update: update.clone(),
        });
        let mut delays = self.options.status_update_retry_strategy.iter();
        let first = delays.next();
        let uuid = update.uuid;
        self.retransmits.insert(
            uuid,
            Retransmit {
                update,
                worker_id,
                delays,
            },
        );
        if let Some(delay) = first {
            ctx.send_with_delay(MasterEvent::RetransmitStatusUpdate { uuid }, delay);
        }
    }

    pub(super) fn handle_retransmit_status_update(
        &mut self,
        ctx: &mut ActorContext<Self>,
        uuid: Uuid,
    ) -> ActorAction {
        let Some(retransmit) = self.retransmits.get_mut(&uuid) else {
            // Already acknowledged.
            return ActorAction::Continue;
        };
        let Some(framework) = self.registry.framework(&retransmit.update.framework_id) else {
            self.retransmits.remove(&uuid);
            return ActorAction::Continue;
        };
        debug!(
            "retransmitting status update {uuid} to framework {}",
            retransmit.update.framework_id
        );
        framework.connection.send(FrameworkMessage::StatusUpdate {
            update: retransmit.update.clone(),
        });
        match retransmit.delays.next() {
            Some(delay) => {
                ctx.send_with_delay(MasterEvent::RetransmitStatusUpdate { uuid }, delay);
            }
            None => {
                warn!("giving up on status update {uuid}");
                self.retransmits.remove(&uuid);
            }
        }
        ActorAction::Continue
    }

    fn acknowledge_worker(&self, worker_id: &Option<WorkerId>, update: &StatusUpdate) {
        let Some(worker_id) = worker_id else {
            return;
        };
        if let Some(worker) = self.registry.worker(worker_id) {
            worker.connection.send(WorkerMessage::StatusUpdateAck {
                framework_id: update.framework_id.clone(),
                task_id: update.task_id.clone(),
                uuid: update.uuid,
            });
        }
    }

    pub(super) fn handle_executor_to_framework(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        worker_id: WorkerId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    ) -> ActorAction {
        let Some(framework) = self.registry.framework(&framework_id) else {
            warn!("dropping executor message for unknown framework {framework_id}");
            return ActorAction::Continue;
        };
        framework.connection.send(FrameworkMessage::ExecutorToFramework {
            worker_id,
            executor_id,
            data,
        });
        ActorAction::Continue
    }

    pub(super) fn handle_executor_exited(
        &mut self,
        ctx: &mut ActorContext<Self>,
        worker_id: WorkerId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        status: i32,
    ) -> ActorAction {
        if self
            .registry
            .remove_executor(&framework_id, &executor_id)
            .is_none()
        {
            warn!("unknown executor {executor_id} of framework {framework_id} exited");
            return ActorAction::Continue;
        }
        info!(
            "executor {executor_id} of framework {framework_id} on worker {worker_id} exited with status {status}"
        );
        // Tasks hosted by the executor are gone with it.
        for key in self.registry.tasks_on_worker(&worker_id) {
            let hosted = self.registry.task(&key).is_some_and(|task| {
                task.framework_id == framework_id && task.executor_id.as_ref() == Some(&executor_id)
            });
            if hosted {
                let update =
                    StatusUpdate::new(key.framework_id.clone(), key.task_id.clone(), TaskState::Lost)
                        .with_message("the executor hosting the task exited");
                self.apply_status_update(ctx, update, None);
            }
        }
        let result = self
            .allocator
            .task_ended(&self.registry, &worker_id, Instant::now());
        self.dispatch_offers(result);
        ActorAction::Continue
    }

    pub(super) async fn handle_deactivated_worker_host_port(
        &mut self,
        ctx: &mut ActorContext<Self>,
        hostname: String,
        port: u16,
    ) -> ActorAction {
        let worker_id = self
            .registry
            .workers()
            .find(|worker| worker.info.hostname == hostname && worker.info.port == port)
            .map(|worker| worker.id.clone());
        let Some(worker_id) = worker_id else {
            return ActorAction::Continue;
        };
        warn!("worker {worker_id} at {hostname}:{port} failed its health check; removing it");
        if self.remove_worker(ctx, &worker_id).await {
            ActorAction::Continue
        } else {
            ActorAction::Stop
        }
    }

    pub(super) async fn handle_tick(&mut self, ctx: &mut ActorContext<Self>) -> ActorAction {
        let now = Instant::now();

        // Ping workers that are due one.
        let due = self
            .registry
            .active_workers()
            .filter(|worker| {
                now.duration_since(worker.last_ping) >= self.options.worker_ping_interval
            })
            .map(|worker| worker.id.clone())
            .collect::<Vec<_>>();
        for worker_id in due {
            if let Some(worker) = self.registry.worker_mut(&worker_id) {
                worker.last_ping = now;
                worker.connection.send(WorkerMessage::Ping);
            }
        }

        // Workers that missed too many heartbeats become unreachable.
        let timeout = self.options.worker_heartbeat_timeout();
        let stale = self
            .registry
            .active_workers()
            .filter(|worker| now.duration_since(worker.last_heartbeat) > timeout)
            .map(|worker| worker.id.clone())
            .collect::<Vec<_>>();
        for worker_id in stale {
            self.mark_worker_unreachable(ctx, &worker_id);
        }

        // Unreachable workers that never came back are removed outright.
        let gone = self
            .registry
            .workers()
            .filter(|worker| {
                !worker.active
                    && worker.deactivated_at.is_some_and(|deactivated_at| {
                        now.duration_since(deactivated_at) > self.options.worker_removal_timeout
                    })
            })
            .map(|worker| worker.id.clone())
            .collect::<Vec<_>>();
        for worker_id in gone {
            if !self.remove_worker(ctx, &worker_id).await {
                return ActorAction::Stop;
            }
        }

        let result = self.allocator.tick(&self.registry, now);
        self.dispatch_offers(result);
        ctx.send_with_delay(MasterEvent::Tick, self.options.tick_interval);
        ActorAction::Continue
    }

    /// Mark a worker unreachable: its tasks become `TASK_UNREACHABLE`,
    /// its offers are rescinded, and its capacity leaves the pool. The
    /// worker itself is retained so a re-registration can fold its tasks
    /// back in.
    fn mark_worker_unreachable(&mut self, ctx: &mut ActorContext<Self>, worker_id: &WorkerId) {
        let Some(worker) = self.registry.worker_mut(worker_id) else {
            return;
        };
        warn!("worker {worker_id} missed too many heartbeats; marking it unreachable");
        worker.active = false;
        worker.deactivated_at = Some(Instant::now());
        let capacity = worker.info.resources.clone();

        for key in self.registry.tasks_on_worker(worker_id) {
            let update = StatusUpdate::new(
                key.framework_id.clone(),
                key.task_id.clone(),
                TaskState::Unreachable,
            )
            .with_message("the worker hosting the task is unreachable");
            self.apply_status_update(ctx, update, None);
        }

        self.rescind_worker_offers(worker_id);
        self.allocator.worker_removed(worker_id, &capacity);
    }

    /// Remove a worker outright: its tasks are lost, its offers are
    /// rescinded, and frameworks that had anything on it are told.
    async fn remove_worker(&mut self, ctx: &mut ActorContext<Self>, worker_id: &WorkerId) -> bool {
        let Some(worker) = self.registry.worker(worker_id) else {
            return true;
        };
        let was_active = worker.active;
        let capacity = worker.info.resources.clone();
        let mut affected = HashSet::new();

        for key in self.registry.tasks_on_worker(worker_id) {
            affected.insert(key.framework_id.clone());
            let update =
                StatusUpdate::new(key.framework_id.clone(), key.task_id.clone(), TaskState::Lost)
                    .with_message("the worker hosting the task was removed");
            self.apply_status_update(ctx, update, None);
        }
        for (framework_id, executor_id) in self.registry.executors_on_worker(worker_id) {
            affected.insert(framework_id.clone());
            self.registry.remove_executor(&framework_id, &executor_id);
        }
        for framework_id in self.rescind_worker_offers(worker_id) {
            affected.insert(framework_id);
        }
        for framework_id in affected {
            if let Some(framework) = self.registry.framework(&framework_id) {
                framework.connection.send(FrameworkMessage::LostWorker {
                    worker_id: worker_id.clone(),
                });
            }
        }

        if was_active {
            self.allocator.worker_removed(worker_id, &capacity);
        }
        if !self
            .journal(RegistryEvent::WorkerRemoved {
                id: worker_id.clone(),
            })
            .await
        {
            return false;
        }
        self.registry.remove_worker(worker_id);
        info!("removed worker {worker_id}");
        true
    }

    /// Rescind every outstanding offer on a worker; returns the affected
    /// frameworks.
    fn rescind_worker_offers(&mut self, worker_id: &WorkerId) -> Vec<FrameworkId> {
        let offer_ids = match self.registry.worker(worker_id) {
            Some(worker) => worker.offer_ids.iter().cloned().collect::<Vec<_>>(),
            None => vec![],
        };
        let mut frameworks = vec![];
        for offer_id in offer_ids {
            if let Some(offer) = self.registry.remove_offer(&offer_id) {
                if let Some(framework) = self.registry.framework(&offer.framework_id) {
                    framework
                        .connection
                        .send(FrameworkMessage::RescindOffer { offer_id });
                }
                frameworks.push(offer.framework_id);
            }
        }
        frameworks
    }

    /// Rescind every outstanding offer of a framework; returns the
    /// resources handed back per worker.
    fn rescind_framework_offers(
        &mut self,
        framework_id: &FrameworkId,
    ) -> Vec<(WorkerId, Resources)> {
        let offer_ids = match self.registry.framework(framework_id) {
            Some(framework) => framework.offer_ids.iter().cloned().collect::<Vec<_>>(),
            None => vec![],
        };
        let mut returned = vec![];
        for offer_id in offer_ids {
            if let Some(offer) = self.registry.remove_offer(&offer_id) {
                if let Some(framework) = self.registry.framework(framework_id) {
                    framework
                        .connection
                        .send(FrameworkMessage::RescindOffer { offer_id });
                }
                returned.push((offer.worker_id, offer.resources));
            }
        }
        returned
    }

    /// Remove a framework outright: its tasks are killed on their
    /// workers, its offers are rescinded, and its resources return to the
    /// pool. Returns false if the master lost its journal leadership.
    async fn remove_framework(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        framework_id: &FrameworkId,
    ) -> bool {
        let task_keys = match self.registry.framework(framework_id) {
            Some(framework) => framework
                .task_ids
                .iter()
                .map(|task_id| TaskKey::new(framework_id.clone(), task_id.clone()))
                .collect::<Vec<_>>(),
            None => return true,
        };
        for key in task_keys {
            if let Some(task) = self.registry.task(&key) {
                if let Some(worker) = self.registry.worker(&task.worker_id) {
                    worker.connection.send(WorkerMessage::KillTask {
                        framework_id: key.framework_id.clone(),
                        task_id: key.task_id.clone(),
                    });
                }
            }
            self.registry.remove_task(&key);
        }

        let executor_ids = match self.registry.framework(framework_id) {
            Some(framework) => framework
                .executors
                .values()
                .flat_map(|executors| executors.iter().cloned())
                .collect::<Vec<_>>(),
            None => vec![],
        };
        for executor_id in executor_ids {
            self.registry.remove_executor(framework_id, &executor_id);
        }

        self.rescind_framework_offers(framework_id);
        self.retransmits
            .retain(|_, retransmit| retransmit.update.framework_id != *framework_id);

        if !self
            .journal(RegistryEvent::FrameworkRemoved {
                id: framework_id.clone(),
            })
            .await
        {
            return false;
        }
        self.registry.remove_framework(framework_id);
        info!("removed framework {framework_id}");
        let result = self
            .allocator
            .framework_removed(framework_id, &self.registry, Instant::now());
        self.dispatch_offers(result);
        true
    }

    /// Turn allocator decisions into offer entities and deliver them.
    fn dispatch_offers(&mut self, result: MasterResult<Vec<Allocation>>) {
        let allocations = match result {
            Ok(allocations) => allocations,
            Err(MasterError::Overloaded(e)) => {
                debug!("withholding offers: {e}");
                return;
            }
            Err(e) => {
                warn!("failed to allocate offers: {e}");
                return;
            }
        };
        for allocation in allocations {
            let mut descriptions = vec![];
            for (worker_id, resources) in allocation.offers {
                let Ok(offer_id) = self.offer_ids.next() else {
                    error!("failed to generate offer IDs");
                    return;
                };
                let Some(hostname) = self
                    .registry
                    .worker(&worker_id)
                    .map(|worker| worker.info.hostname.clone())
                else {
                    continue;
                };
                let offer = Offer {
                    id: offer_id.clone(),
                    framework_id: allocation.framework_id.clone(),
                    worker_id: worker_id.clone(),
                    resources: resources.clone(),
                    created_at: Instant::now(),
                };
                if let Err(e) = self.registry.add_offer(offer) {
                    warn!("failed to record offer {offer_id}: {e}");
                    continue;
                }
                descriptions.push(OfferDescription {
                    offer_id,
                    worker_id,
                    hostname,
                    resources,
                });
            }
            if descriptions.is_empty() {
                continue;
            }
            if let Some(framework) = self.registry.framework(&allocation.framework_id) {
                debug!(
                    "offering {} chunk(s) to framework {}",
                    descriptions.len(),
                    allocation.framework_id
                );
                framework.connection.send(FrameworkMessage::ResourceOffers {
                    offers: descriptions,
                });
            }
        }
    }

    /// Journal a registry transition; returns false when this master has
    /// been demoted and must stop.
    async fn journal(&mut self, event: RegistryEvent) -> bool {
        let Some(journal) = &mut self.journal else {
            return true;
        };
        match journal.record(&event).await {
            Ok(_) => true,
            Err(MasterError::Log(keel_log::LogError::Demoted)) => {
                error!("master lost the journal writership; stepping down");
                false
            }
            Err(e) => {
                warn!("failed to journal a registry transition: {e}");
                true
            }
        }
    }
}
