use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use keel_log::{Log, LogOptions};
use keel_master::allocator::AllocatorOptions;
use keel_master::journal::{Journal, RegistryEvent};
use keel_master::master::{MasterEvent, MasterHandle, MasterOptions};
use keel_master::messages::{
    Connection, FrameworkInfo, FrameworkMessage, WorkerInfo, WorkerMessage,
};
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
        status_update_retry_strategy: RetryStrategy::Fixed {
            max_count: 0,
            delay: Duration::from_secs(1),
        },
        journal: None,
        recovered: vec![],
    }
}

fn log_options(dir: &tempfile::TempDir) -> LogOptions {
    LogOptions {
        path: dir.path().join("journal"),
        quorum: 1,
        cache_capacity: 1000,
        phase_timeout: Duration::from_millis(200),
        election_retry_count: 0,
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

#[tokio::test]
async fn test_master_state_survives_failover() {
    let dir = tempfile::tempdir().unwrap();
    let log = Log::open(log_options(&dir), vec![]).await.unwrap();

    // The first master journals its registrations.
    let mut options = master_options("epoch1");
    options.journal = Some(Journal::new(log.writer(1).await.unwrap()));
    let master: MasterHandle = ActorHandle::new(options);

    let (framework_connection, mut framework_rx) = Connection::new();
    master
        .send(MasterEvent::RegisterFramework {
            info: FrameworkInfo {
                name: "analytics".to_string(),
                user: "alice".to_string(),
                failover_timeout: Duration::from_secs(3600),
            },
            connection: framework_connection,
        })
        .await
        .unwrap();
    let framework_id = match expect_framework_message(&mut framework_rx).await {
        FrameworkMessage::Registered { framework_id } => framework_id,
        other => panic!("expected a registration reply, got {other:?}"),
    };

    let (worker_connection, mut worker_rx) = Connection::new();
    master
        .send(MasterEvent::RegisterWorker {
            info: WorkerInfo {
                hostname: "host1".to_string(),
                port: 5051,
                resources: Resources::cpus_mem(4.0, 4096.0),
            },
            connection: worker_connection,
        })
        .await
        .unwrap();
    let worker_id = loop {
        match tokio::time::timeout(Duration::from_secs(30), worker_rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            WorkerMessage::Registered { worker_id } => break worker_id,
            _ => continue,
        }
    };

    master.send(MasterEvent::Shutdown).await.unwrap();
    master.wait_for_stop().await;

    // The new master recovers the framework and worker from the journal
    // and waits for them to re-register.
    let recovered = Journal::recover(&log.reader()).await.unwrap();
    assert_eq!(recovered.len(), 2);
    assert!(matches!(&recovered[0], RegistryEvent::FrameworkAdded { id, .. } if *id == framework_id));
    assert!(matches!(&recovered[1], RegistryEvent::WorkerAdded { id, .. } if *id == worker_id));

    let mut options = master_options("epoch2");
    options.journal = Some(Journal::new(log.writer(2).await.unwrap()));
    options.recovered = recovered;
    let master: MasterHandle = ActorHandle::new(options);

    let (tx, rx) = oneshot::channel();
    master.send(MasterEvent::GetState { reply: tx }).await.unwrap();
    let state = rx.await.unwrap();
    assert_eq!(state.frameworks.len(), 1);
    assert_eq!(state.workers.len(), 1);
    assert!(!state.frameworks[0].active);
    assert!(!state.workers[0].active);

    // Both come back; the framework is re-offered the worker's capacity.
    let (worker_connection, mut worker_rx) = Connection::new();
    master
        .send(MasterEvent::ReregisterWorker {
            worker_id: worker_id.clone(),
            info: WorkerInfo {
                hostname: "host1".to_string(),
                port: 5051,
                resources: Resources::cpus_mem(4.0, 4096.0),
            },
            executors: vec![],
            tasks: vec![],
            connection: worker_connection,
        })
        .await
        .unwrap();
    match tokio::time::timeout(Duration::from_secs(30), worker_rx.recv())
        .await
        .unwrap()
        .unwrap()
    {
        WorkerMessage::Reregistered { worker_id: id } => assert_eq!(id, worker_id),
        other => panic!("expected a re-registration reply, got {other:?}"),
    }

    let (framework_connection, mut framework_rx) = Connection::new();
    master
        .send(MasterEvent::ReregisterFramework {
            framework_id: framework_id.clone(),
            info: FrameworkInfo {
                name: "analytics".to_string(),
                user: "alice".to_string(),
                failover_timeout: Duration::from_secs(3600),
            },
            failover: true,
            connection: framework_connection,
        })
        .await
        .unwrap();
    match expect_framework_message(&mut framework_rx).await {
        FrameworkMessage::Reregistered { framework_id: id } => assert_eq!(id, framework_id),
        other => panic!("expected a re-registration reply, got {other:?}"),
    }
    loop {
        if let FrameworkMessage::ResourceOffers { offers } =
            expect_framework_message(&mut framework_rx).await
        {
            assert_eq!(offers.len(), 1);
            assert_eq!(offers[0].resources, Resources::cpus_mem(4.0, 4096.0));
            break;
        }
    }
}
