use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use keel_master::allocator::AllocatorOptions;
use keel_master::id::{ExecutorId, FrameworkId, TaskId, WorkerId};
use keel_master::master::{MasterEvent, MasterHandle, MasterOptions};
use keel_master::messages::{
    Connection, ExecutorInfo, Filters, FrameworkInfo, FrameworkMessage, OfferDescription,
    ReportedTask, StatusUpdate, TaskDescription, TaskState, WorkerInfo, WorkerMessage,
};
use keel_master::registry::RegistrySnapshot;
use keel_master::resources::Resources;
use keel_server::actor::ActorHandle;
use keel_server::retry::RetryStrategy;

fn master_options(epoch: &str) -> MasterOptions {
    MasterOptions {
        epoch: epoch.to_string(),
        tick_interval: Duration::from_secs(1),
        worker_ping_interval: Duration::from_secs(15),
        worker_ping_timeout_count: 5,
        worker_removal_timeout: Duration::from_secs(600),
        framework_failover_timeout_max: Duration::from_secs(7 * 24 * 3600),
        completed_task_capacity: 100,
        completed_framework_capacity: 50,
        allocator: AllocatorOptions::default(),
        // Tests acknowledge updates promptly, so retransmission is off by
        // default; the retransmission test configures its own strategy.
        status_update_retry_strategy: RetryStrategy::Fixed {
            max_count: 0,
            delay: Duration::from_secs(1),
        },
        journal: None,
        recovered: vec![],
    }
}

fn framework_info(name: &str, user: &str, failover_timeout: Duration) -> FrameworkInfo {
    FrameworkInfo {
        name: name.to_string(),
        user: user.to_string(),
        failover_timeout,
    }
}

fn worker_info(hostname: &str, cpus: f64, mem: f64) -> WorkerInfo {
    WorkerInfo {
        hostname: hostname.to_string(),
        port: 5051,
        resources: Resources::cpus_mem(cpus, mem),
    }
}

fn task_description(task_id: &str, cpus: f64, mem: f64) -> TaskDescription {
    TaskDescription {
        task_id: TaskId::from(task_id),
        name: task_id.to_string(),
        resources: Resources::cpus_mem(cpus, mem),
        executor: None,
        data: vec![],
    }
}

async fn register_framework(
    master: &MasterHandle,
    info: FrameworkInfo,
) -> (FrameworkId, mpsc::UnboundedReceiver<FrameworkMessage>) {
    let (connection, mut rx) = Connection::new();
    master
        .send(MasterEvent::RegisterFramework { info, connection })
        .await
        .unwrap();
    match expect_framework_message(&mut rx).await {
        FrameworkMessage::Registered { framework_id } => (framework_id, rx),
        other => panic!("expected a registration reply, got {other:?}"),
    }
}

async fn register_worker(
    master: &MasterHandle,
    info: WorkerInfo,
) -> (WorkerId, mpsc::UnboundedReceiver<WorkerMessage>) {
    let (connection, mut rx) = Connection::new();
    master
        .send(MasterEvent::RegisterWorker { info, connection })
        .await
        .unwrap();
    match expect_worker_message(&mut rx).await {
        WorkerMessage::Registered { worker_id } => (worker_id, rx),
        other => panic!("expected a registration reply, got {other:?}"),
    }
}

async fn expect_framework_message(
    rx: &mut mpsc::UnboundedReceiver<FrameworkMessage>,
) -> FrameworkMessage {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for a framework message")
        .expect("the framework connection closed")
}

async fn expect_worker_message(rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> WorkerMessage {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for a worker message")
        .expect("the worker connection closed")
}

/// The next resource offers, skipping unrelated messages.
async fn next_offers(rx: &mut mpsc::UnboundedReceiver<FrameworkMessage>) -> Vec<OfferDescription> {
    loop {
        if let FrameworkMessage::ResourceOffers { offers } = expect_framework_message(rx).await {
            return offers;
        }
    }
}

/// The next status update, skipping unrelated messages.
async fn next_status_update(rx: &mut mpsc::UnboundedReceiver<FrameworkMessage>) -> StatusUpdate {
    loop {
        if let FrameworkMessage::StatusUpdate { update } = expect_framework_message(rx).await {
            return update;
        }
    }
}

/// The next task launch, skipping pings and other messages.
async fn next_launch(rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> TaskDescription {
    loop {
        if let WorkerMessage::LaunchTask { task, .. } = expect_worker_message(rx).await {
            return task;
        }
    }
}

/// The next kill command, skipping pings and other messages.
async fn next_kill(rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> (FrameworkId, TaskId) {
    loop {
        if let WorkerMessage::KillTask {
            framework_id,
            task_id,
        } = expect_worker_message(rx).await
        {
            return (framework_id, task_id);
        }
    }
}

/// The next status update acknowledgement, skipping other messages.
async fn next_worker_ack(rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> Uuid {
    loop {
        if let WorkerMessage::StatusUpdateAck { uuid, .. } = expect_worker_message(rx).await {
            return uuid;
        }
    }
}

/// Round-trips a request through the master, so every previously sent
/// event is guaranteed to have been processed.
async fn snapshot(master: &MasterHandle) -> RegistrySnapshot {
    let (tx, rx) = oneshot::channel();
    master
        .send(MasterEvent::GetState { reply: tx })
        .await
        .unwrap();
    rx.await.unwrap()
}

#[tokio::test]
async fn test_register_and_offer_flow() {
    let master: MasterHandle = ActorHandle::new(master_options("epoch1"));
    let (worker_id, _worker_rx) = register_worker(&master, worker_info("host1", 4.0, 4096.0)).await;
    let (framework_id, mut framework_rx) =
        register_framework(&master, framework_info("analytics", "alice", Duration::ZERO)).await;
    assert!(framework_id.as_str().starts_with("epoch1-"));

    let offers = next_offers(&mut framework_rx).await;
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].worker_id, worker_id);
    assert_eq!(offers[0].hostname, "host1");
    assert_eq!(offers[0].resources, Resources::cpus_mem(4.0, 4096.0));

    let state = snapshot(&master).await;
    assert_eq!(state.offer_count, 1);
    assert_eq!(state.workers.len(), 1);
    assert_eq!(state.frameworks.len(), 1);
}

#[tokio::test]
async fn test_launch_validation() {
    let master: MasterHandle = ActorHandle::new(master_options("epoch1"));
    let (_worker_id, mut worker_rx) =
        register_worker(&master, worker_info("host1", 4.0, 4096.0)).await;
    let (framework_id, mut framework_rx) =
        register_framework(&master, framework_info("analytics", "alice", Duration::ZERO)).await;
    let offers = next_offers(&mut framework_rx).await;

    // One task fits; the second does not and is declined with TASK_LOST.
    master
        .send(MasterEvent::LaunchTasks {
            framework_id: framework_id.clone(),
            offer_id: offers[0].offer_id.clone(),
            tasks: vec![
                task_description("t1", 2.0, 1024.0),
                task_description("t2", 8.0, 8192.0),
            ],
            filters: Filters::default(),
        })
        .await
        .unwrap();

    let launched = next_launch(&mut worker_rx).await;
    assert_eq!(launched.task_id, TaskId::from("t1"));

    let update = next_status_update(&mut framework_rx).await;
    assert_eq!(update.task_id, TaskId::from("t2"));
    assert_eq!(update.state, TaskState::Lost);

    // Replying to the consumed offer declines everything in it.
    master
        .send(MasterEvent::LaunchTasks {
            framework_id: framework_id.clone(),
            offer_id: offers[0].offer_id.clone(),
            tasks: vec![task_description("t3", 1.0, 128.0)],
            filters: Filters::default(),
        })
        .await
        .unwrap();
    let update = next_status_update(&mut framework_rx).await;
    assert_eq!(update.task_id, TaskId::from("t3"));
    assert_eq!(update.state, TaskState::Lost);

    let state = snapshot(&master).await;
    assert_eq!(state.task_count, 1);
}

#[tokio::test]
async fn test_duplicate_task_id_is_declined() {
    let master: MasterHandle = ActorHandle::new(master_options("epoch1"));
    let (_worker_id, mut worker_rx) =
        register_worker(&master, worker_info("host1", 8.0, 8192.0)).await;
    let (framework_id, mut framework_rx) =
        register_framework(&master, framework_info("analytics", "alice", Duration::ZERO)).await;

    let offers = next_offers(&mut framework_rx).await;
    master
        .send(MasterEvent::LaunchTasks {
            framework_id: framework_id.clone(),
            offer_id: offers[0].offer_id.clone(),
            tasks: vec![task_description("t1", 1.0, 512.0)],
            filters: Filters::default(),
        })
        .await
        .unwrap();
    assert_eq!(next_launch(&mut worker_rx).await.task_id, TaskId::from("t1"));

    // The remaining resources come back as a fresh offer; reusing the
    // task id must fail even though resources would fit.
    let offers = next_offers(&mut framework_rx).await;
    master
        .send(MasterEvent::LaunchTasks {
            framework_id: framework_id.clone(),
            offer_id: offers[0].offer_id.clone(),
            tasks: vec![task_description("t1", 1.0, 512.0)],
            filters: Filters::default(),
        })
        .await
        .unwrap();
    let update = next_status_update(&mut framework_rx).await;
    assert_eq!(update.task_id, TaskId::from("t1"));
    assert_eq!(update.state, TaskState::Lost);
}

#[tokio::test]
async fn test_executor_resources_are_charged_once() {
    let master: MasterHandle = ActorHandle::new(master_options("epoch1"));
    let (_worker_id, mut worker_rx) =
        register_worker(&master, worker_info("host1", 4.0, 4096.0)).await;
    let (framework_id, mut framework_rx) =
        register_framework(&master, framework_info("analytics", "alice", Duration::ZERO)).await;

    let offers = next_offers(&mut framework_rx).await;
    let executor = ExecutorInfo {
        executor_id: ExecutorId::from("exec"),
        resources: Resources::cpus_mem(1.0, 1024.0),
        data: vec![],
    };
    let mut first = task_description("t1", 1.0, 1024.0);
    first.executor = Some(executor.clone());
    let mut second = task_description("t2", 1.0, 1024.0);
    second.executor = Some(executor.clone());
    // Executor (1 cpu) + two tasks (1 cpu each) fit in 4 cpus only if the
    // executor is charged once.
    master
        .send(MasterEvent::LaunchTasks {
            framework_id: framework_id.clone(),
            offer_id: offers[0].offer_id.clone(),
            tasks: vec![first, second],
            filters: Filters::default(),
        })
        .await
        .unwrap();
    assert_eq!(next_launch(&mut worker_rx).await.task_id, TaskId::from("t1"));
    assert_eq!(next_launch(&mut worker_rx).await.task_id, TaskId::from("t2"));

    let state = snapshot(&master).await;
    assert_eq!(state.task_count, 2);
    let worker = &state.workers[0];
    // 2 tasks + 1 executor.
    assert_eq!(worker.used.cpus(), 3.0);
}

#[tokio::test]
async fn test_status_update_pipeline_and_idempotence() {
    let master: MasterHandle = ActorHandle::new(master_options("epoch1"));
    let (worker_id, mut worker_rx) =
        register_worker(&master, worker_info("host1", 4.0, 4096.0)).await;
    let (framework_id, mut framework_rx) =
        register_framework(&master, framework_info("analytics", "alice", Duration::ZERO)).await;

    let offers = next_offers(&mut framework_rx).await;
    master
        .send(MasterEvent::LaunchTasks {
            framework_id: framework_id.clone(),
            offer_id: offers[0].offer_id.clone(),
            tasks: vec![task_description("t1", 2.0, 1024.0)],
            filters: Filters::default(),
        })
        .await
        .unwrap();
    next_launch(&mut worker_rx).await;

    let running = StatusUpdate::new(framework_id.clone(), TaskId::from("t1"), TaskState::Running);
    master
        .send(MasterEvent::StatusUpdate {
            update: running.clone(),
            worker_id: Some(worker_id.clone()),
        })
        .await
        .unwrap();

    let update = next_status_update(&mut framework_rx).await;
    assert_eq!(update.state, TaskState::Running);
    assert_eq!(update.uuid, running.uuid);

    // The worker is acknowledged once the framework acknowledges.
    master
        .send(MasterEvent::StatusUpdateAck {
            framework_id: framework_id.clone(),
            task_id: TaskId::from("t1"),
            uuid: running.uuid,
        })
        .await
        .unwrap();
    assert_eq!(next_worker_ack(&mut worker_rx).await, running.uuid);

    // Re-delivering the same uuid yields the same state, re-acknowledges
    // the worker, and the framework receives no second copy.
    master
        .send(MasterEvent::StatusUpdate {
            update: running.clone(),
            worker_id: Some(worker_id.clone()),
        })
        .await
        .unwrap();
    assert_eq!(next_worker_ack(&mut worker_rx).await, running.uuid);
    let state = snapshot(&master).await;
    assert_eq!(state.task_count, 1);
    while let Ok(message) = framework_rx.try_recv() {
        assert!(
            !matches!(message, FrameworkMessage::StatusUpdate { .. }),
            "the framework received a duplicate status update"
        );
    }

    // A terminal update releases the task's resources.
    let finished =
        StatusUpdate::new(framework_id.clone(), TaskId::from("t1"), TaskState::Finished);
    master
        .send(MasterEvent::StatusUpdate {
            update: finished.clone(),
            worker_id: Some(worker_id.clone()),
        })
        .await
        .unwrap();
    let update = next_status_update(&mut framework_rx).await;
    assert_eq!(update.state, TaskState::Finished);

    let state = snapshot(&master).await;
    assert_eq!(state.task_count, 0);
    let framework = &state.frameworks[0];
    assert_eq!(framework.completed_task_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_status_update_retransmission() {
    let mut options = master_options("epoch1");
    options.status_update_retry_strategy = RetryStrategy::ExponentialBackoff {
        max_count: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(4),
        factor: 2,
    };
    let master: MasterHandle = ActorHandle::new(options);
    let (worker_id, mut worker_rx) =
        register_worker(&master, worker_info("host1", 4.0, 4096.0)).await;
    let (framework_id, mut framework_rx) =
        register_framework(&master, framework_info("analytics", "alice", Duration::ZERO)).await;

    let offers = next_offers(&mut framework_rx).await;
    master
        .send(MasterEvent::LaunchTasks {
            framework_id: framework_id.clone(),
            offer_id: offers[0].offer_id.clone(),
            tasks: vec![task_description("t1", 4.0, 4096.0)],
            filters: Filters::default(),
        })
        .await
        .unwrap();
    next_launch(&mut worker_rx).await;

    let running = StatusUpdate::new(framework_id.clone(), TaskId::from("t1"), TaskState::Running);
    master
        .send(MasterEvent::StatusUpdate {
            update: running.clone(),
            worker_id: Some(worker_id.clone()),
        })
        .await
        .unwrap();

    // The framework never acknowledges: the original delivery plus three
    // retransmissions arrive, then the master gives up.
    for _ in 0..4 {
        let update = next_status_update(&mut framework_rx).await;
        assert_eq!(update.uuid, running.uuid);
    }
    tokio::time::sleep(Duration::from_secs(10)).await;
    snapshot(&master).await;
    while let Ok(message) = framework_rx.try_recv() {
        assert!(
            !matches!(message, FrameworkMessage::StatusUpdate { .. }),
            "the master kept retransmitting after giving up"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_framework_failover_timeout() {
    let master: MasterHandle = ActorHandle::new(master_options("epoch1"));
    let (worker_id, mut worker_rx) =
        register_worker(&master, worker_info("host1", 10.0, 10240.0)).await;
    let (framework_id, mut framework_rx) = register_framework(
        &master,
        framework_info("analytics", "alice", Duration::from_secs(60)),
    )
    .await;

    let offers = next_offers(&mut framework_rx).await;
    master
        .send(MasterEvent::LaunchTasks {
            framework_id: framework_id.clone(),
            offer_id: offers[0].offer_id.clone(),
            tasks: vec![task_description("t1", 4.0, 2048.0)],
            filters: Filters::default(),
        })
        .await
        .unwrap();
    next_launch(&mut worker_rx).await;

    // A second framework competes for the resources. The first framework
    // holds the remainder of its offer, so nothing is free yet.
    let (_other_id, mut other_rx) =
        register_framework(&master, framework_info("batch", "bob", Duration::ZERO)).await;

    master
        .send(MasterEvent::FrameworkExited {
            framework_id: framework_id.clone(),
        })
        .await
        .unwrap();

    // The disconnect rescinds the outstanding offer, freeing everything
    // except what the running task holds.
    let offers = next_offers(&mut other_rx).await;
    assert_eq!(offers[0].resources, Resources::cpus_mem(6.0, 8192.0));

    // Half way into the failover timeout the task is still running and
    // its resources have not been re-offered.
    tokio::time::sleep(Duration::from_secs(30)).await;
    let state = snapshot(&master).await;
    assert_eq!(state.task_count, 1);
    let framework = state
        .frameworks
        .iter()
        .find(|f| f.id == framework_id)
        .unwrap();
    assert!(!framework.active);

    // Once the timeout elapses the framework is removed, its task is
    // killed, and its resources go to the other framework.
    tokio::time::sleep(Duration::from_secs(35)).await;
    let state = snapshot(&master).await;
    assert_eq!(state.task_count, 0);
    assert!(!state.frameworks.iter().any(|f| f.id == framework_id));

    let (killed_framework, killed_task) = next_kill(&mut worker_rx).await;
    assert_eq!(killed_framework, framework_id);
    assert_eq!(killed_task, TaskId::from("t1"));

    let offers = next_offers(&mut other_rx).await;
    assert_eq!(offers[0].worker_id, worker_id);
    assert_eq!(offers[0].resources, Resources::cpus_mem(4.0, 2048.0));
}

#[tokio::test(start_paused = true)]
async fn test_worker_reregistration_reconciles_tasks() {
    let master: MasterHandle = ActorHandle::new(master_options("epoch1"));
    let (worker_id, mut worker_rx) =
        register_worker(&master, worker_info("host1", 10.0, 10240.0)).await;
    let (framework_id, mut framework_rx) = register_framework(
        &master,
        framework_info("analytics", "alice", Duration::from_secs(3600)),
    )
    .await;

    let offers = next_offers(&mut framework_rx).await;
    master
        .send(MasterEvent::LaunchTasks {
            framework_id: framework_id.clone(),
            offer_id: offers[0].offer_id.clone(),
            tasks: vec![
                task_description("t1", 1.0, 512.0),
                task_description("t2", 1.0, 512.0),
            ],
            filters: Filters::default(),
        })
        .await
        .unwrap();
    next_launch(&mut worker_rx).await;
    next_launch(&mut worker_rx).await;
    for task_id in ["t1", "t2"] {
        let update =
            StatusUpdate::new(framework_id.clone(), TaskId::from(task_id), TaskState::Running);
        master
            .send(MasterEvent::StatusUpdate {
                update,
                worker_id: Some(worker_id.clone()),
            })
            .await
            .unwrap();
    }

    // The worker goes silent past the heartbeat threshold: its tasks
    // become unreachable.
    tokio::time::sleep(Duration::from_secs(80)).await;
    let state = snapshot(&master).await;
    let worker = &state.workers[0];
    assert!(!worker.active);
    let mut unreachable = vec![];
    while let Ok(message) = framework_rx.try_recv() {
        if let FrameworkMessage::StatusUpdate { update } = message {
            if update.state == TaskState::Unreachable {
                unreachable.push(update.task_id.as_str().to_string());
            }
        }
    }
    unreachable.sort();
    assert_eq!(unreachable, vec!["t1", "t2"]);

    // The worker comes back reporting t1 running, a task the master never
    // heard of, and nothing about t2.
    let (connection, mut new_worker_rx) = Connection::new();
    master
        .send(MasterEvent::ReregisterWorker {
            worker_id: worker_id.clone(),
            info: worker_info("host1", 10.0, 10240.0),
            executors: vec![],
            tasks: vec![
                ReportedTask {
                    framework_id: framework_id.clone(),
                    task_id: TaskId::from("t1"),
                    name: "t1".to_string(),
                    executor_id: None,
                    resources: Resources::cpus_mem(1.0, 512.0),
                    state: TaskState::Running,
                },
                ReportedTask {
                    framework_id: framework_id.clone(),
                    task_id: TaskId::from("t3"),
                    name: "t3".to_string(),
                    executor_id: None,
                    resources: Resources::cpus_mem(1.0, 512.0),
                    state: TaskState::Running,
                },
            ],
            connection,
        })
        .await
        .unwrap();

    match expect_worker_message(&mut new_worker_rx).await {
        WorkerMessage::Reregistered { worker_id: id } => assert_eq!(id, worker_id),
        other => panic!("expected a re-registration reply, got {other:?}"),
    }

    // The unknown task is killed during reconciliation.
    let (_, killed_task) = next_kill(&mut new_worker_rx).await;
    assert_eq!(killed_task, TaskId::from("t3"));

    // t1 returns to RUNNING; t2 is declared lost.
    let mut reconciled = std::collections::HashMap::new();
    while reconciled.len() < 2 {
        let update = next_status_update(&mut framework_rx).await;
        reconciled.insert(update.task_id.as_str().to_string(), update.state);
    }
    assert_eq!(reconciled.get("t1"), Some(&TaskState::Running));
    assert_eq!(reconciled.get("t2"), Some(&TaskState::Lost));

    let state = snapshot(&master).await;
    assert_eq!(state.task_count, 1);
    assert!(state.workers[0].active);
}

#[tokio::test(start_paused = true)]
async fn test_refused_resources_are_reoffered() {
    let master: MasterHandle = ActorHandle::new(master_options("epoch1"));
    let (_worker_id, _worker_rx) =
        register_worker(&master, worker_info("host1", 4.0, 4096.0)).await;
    let (framework_id, mut framework_rx) =
        register_framework(&master, framework_info("analytics", "alice", Duration::ZERO)).await;

    // Decline the whole offer by launching nothing.
    let offers = next_offers(&mut framework_rx).await;
    master
        .send(MasterEvent::LaunchTasks {
            framework_id: framework_id.clone(),
            offer_id: offers[0].offer_id.clone(),
            tasks: vec![],
            filters: Filters::default(),
        })
        .await
        .unwrap();

    // With every known framework refusing the worker, the refuser set
    // clears and the resources are offered again on a later tick.
    let offers = next_offers(&mut framework_rx).await;
    assert_eq!(offers[0].resources, Resources::cpus_mem(4.0, 4096.0));
}
