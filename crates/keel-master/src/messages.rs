//! The typed messages exchanged with frameworks and workers.
//!
//! The master consumes and produces these types; the transport carrying
//! them between nodes is outside the core. A [Connection] is the sending
//! half of such a transport.

use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::id::{ExecutorId, FrameworkId, OfferId, TaskId, WorkerId};
use crate::resources::Resources;

/// The sending half of a typed message stream to a framework or worker.
pub struct Connection<M> {
    sender: Option<mpsc::UnboundedSender<M>>,
}

impl<M> Clone for Connection<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<M> Connection<M> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<M>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sender: Some(tx) }, rx)
    }

    /// A connection with no remote end, e.g. for an entity recovered from
    /// the journal that has not re-registered yet.
    pub fn closed() -> Self {
        Self { sender: None }
    }

    /// Send a message; returns whether the remote end is still there.
    pub fn send(&self, message: M) -> bool {
        match &self.sender {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.sender {
            Some(sender) => sender.is_closed(),
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameworkInfo {
    pub name: String,
    /// The owner of the framework; used as the grouping level for fair
    /// sharing.
    pub user: String,
    /// How long the framework's tasks survive after it disconnects.
    pub failover_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub hostname: String,
    pub port: u16,
    /// The advertised capacity of the worker.
    pub resources: Resources,
}

#[derive(Debug, Clone)]
pub struct ExecutorInfo {
    pub executor_id: ExecutorId,
    pub resources: Resources,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TaskDescription {
    pub task_id: TaskId,
    pub name: String,
    pub resources: Resources,
    /// The executor to run the task under. If it is not yet running on
    /// the worker, its resources are charged as part of the launch.
    pub executor: Option<ExecutorInfo>,
    pub data: Vec<u8>,
}

/// Resource hints a framework sends outside the offer cycle.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub worker_id: Option<WorkerId>,
    pub resources: Resources,
}

/// Filters attached to a launch or decline reply.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    /// How long the allocator should skip offering the declined resources
    /// on the same worker. `None` applies no filter; a zero duration
    /// filters until the framework revives offers.
    pub refuse: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
    Unreachable,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Killed | TaskState::Lost
        )
    }

    fn rank(self) -> u8 {
        match self {
            TaskState::Staging => 0,
            TaskState::Starting => 1,
            TaskState::Running | TaskState::Unreachable => 2,
            TaskState::Finished | TaskState::Failed | TaskState::Killed | TaskState::Lost => 3,
        }
    }

    /// Whether a transition to `to` is allowed. Terminal states admit no
    /// further transitions; an unreachable task may come back once its
    /// worker re-registers.
    pub fn can_transition(self, to: TaskState) -> bool {
        if self == to {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if self == TaskState::Unreachable {
            return matches!(
                to,
                TaskState::Running
                    | TaskState::Finished
                    | TaskState::Failed
                    | TaskState::Killed
                    | TaskState::Lost
            );
        }
        to.rank() >= self.rank()
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Staging => "TASK_STAGING",
            TaskState::Starting => "TASK_STARTING",
            TaskState::Running => "TASK_RUNNING",
            TaskState::Finished => "TASK_FINISHED",
            TaskState::Failed => "TASK_FAILED",
            TaskState::Killed => "TASK_KILLED",
            TaskState::Lost => "TASK_LOST",
            TaskState::Unreachable => "TASK_UNREACHABLE",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub framework_id: FrameworkId,
    pub task_id: TaskId,
    pub state: TaskState,
    pub message: Option<String>,
    pub data: Option<Vec<u8>>,
    /// Identifies this update across retransmissions.
    pub uuid: Uuid,
}

impl StatusUpdate {
    pub fn new(framework_id: FrameworkId, task_id: TaskId, state: TaskState) -> Self {
        Self {
            framework_id,
            task_id,
            state,
            message: None,
            data: None,
            uuid: Uuid::new_v4(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// What a framework is offered: a resource chunk on a specific worker.
#[derive(Debug, Clone)]
pub struct OfferDescription {
    pub offer_id: OfferId,
    pub worker_id: WorkerId,
    pub hostname: String,
    pub resources: Resources,
}

/// A task a re-registering worker reports it is running.
#[derive(Debug, Clone)]
pub struct ReportedTask {
    pub framework_id: FrameworkId,
    pub task_id: TaskId,
    pub name: String,
    pub executor_id: Option<ExecutorId>,
    pub resources: Resources,
    pub state: TaskState,
}

/// An executor a re-registering worker reports it is hosting.
#[derive(Debug, Clone)]
pub struct ReportedExecutor {
    pub framework_id: FrameworkId,
    pub executor: ExecutorInfo,
}

/// Messages from the master to a framework.
#[derive(Debug, Clone)]
pub enum FrameworkMessage {
    Registered {
        framework_id: FrameworkId,
    },
    Reregistered {
        framework_id: FrameworkId,
    },
    ResourceOffers {
        offers: Vec<OfferDescription>,
    },
    RescindOffer {
        offer_id: OfferId,
    },
    StatusUpdate {
        update: StatusUpdate,
    },
    ExecutorToFramework {
        worker_id: WorkerId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },
    Error {
        code: i32,
        message: String,
    },
    LostWorker {
        worker_id: WorkerId,
    },
}

/// Messages from the master to a worker.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Registered {
        worker_id: WorkerId,
    },
    Reregistered {
        worker_id: WorkerId,
    },
    LaunchTask {
        framework_id: FrameworkId,
        framework_info: FrameworkInfo,
        task: TaskDescription,
    },
    KillTask {
        framework_id: FrameworkId,
        task_id: TaskId,
    },
    FrameworkToExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },
    StatusUpdateAck {
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: Uuid,
    },
    Ping,
    Shutdown {
        message: String,
    },
}
