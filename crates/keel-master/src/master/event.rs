use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::id::{ExecutorId, FrameworkId, OfferId, TaskId, WorkerId};
use crate::messages::{
    Connection, Filters, FrameworkInfo, FrameworkMessage, ReportedExecutor, ReportedTask,
    ResourceRequest, StatusUpdate, TaskDescription, WorkerInfo, WorkerMessage,
};
use crate::registry::RegistrySnapshot;

pub enum MasterEvent {
    // Framework-facing messages.
    RegisterFramework {
        info: FrameworkInfo,
        connection: Connection<FrameworkMessage>,
    },
    ReregisterFramework {
        framework_id: FrameworkId,
        info: FrameworkInfo,
        failover: bool,
        connection: Connection<FrameworkMessage>,
    },
    UnregisterFramework {
        framework_id: FrameworkId,
    },
    DeactivateFramework {
        framework_id: FrameworkId,
    },
    /// The transport lost the connection to the framework.
    FrameworkExited {
        framework_id: FrameworkId,
    },
    ResourceRequest {
        framework_id: FrameworkId,
        requests: Vec<ResourceRequest>,
    },
    LaunchTasks {
        framework_id: FrameworkId,
        offer_id: OfferId,
        tasks: Vec<TaskDescription>,
        filters: Filters,
    },
    ReviveOffers {
        framework_id: FrameworkId,
    },
    KillTask {
        framework_id: FrameworkId,
        task_id: TaskId,
    },
    FrameworkToExecutor {
        framework_id: FrameworkId,
        worker_id: WorkerId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },
    StatusUpdateAck {
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: Uuid,
    },

    // Worker-facing messages.
    RegisterWorker {
        info: WorkerInfo,
        connection: Connection<WorkerMessage>,
    },
    ReregisterWorker {
        worker_id: WorkerId,
        info: WorkerInfo,
        executors: Vec<ReportedExecutor>,
        tasks: Vec<ReportedTask>,
        connection: Connection<WorkerMessage>,
    },
    UnregisterWorker {
        worker_id: WorkerId,
    },
    WorkerHeartbeat {
        worker_id: WorkerId,
    },
    StatusUpdate {
        update: StatusUpdate,
        /// The reporting worker, if the update came from one; it is
        /// acknowledged once the framework acknowledges.
        worker_id: Option<WorkerId>,
    },
    ExecutorToFramework {
        worker_id: WorkerId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },
    ExecutorExited {
        worker_id: WorkerId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        status: i32,
    },
    /// A worker endpoint failed its health check.
    DeactivatedWorkerHostPort {
        hostname: String,
        port: u16,
    },

    // Internal events.
    GetState {
        reply: oneshot::Sender<RegistrySnapshot>,
    },
    Tick,
    ProbeFrameworkFailover {
        framework_id: FrameworkId,
        instant: Instant,
    },
    RetransmitStatusUpdate {
        uuid: Uuid,
    },
    Shutdown,
}
