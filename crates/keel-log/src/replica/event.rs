use std::collections::BTreeSet;

use tokio::sync::oneshot;

use crate::error::LogResult;
use crate::record::{
    Action, LearnResponse, PromiseRequest, PromiseResponse, WriteRequest, WriteResponse,
};

pub enum ReplicaEvent {
    Promise {
        request: PromiseRequest,
        reply: oneshot::Sender<PromiseResponse>,
    },
    Write {
        request: WriteRequest,
        reply: oneshot::Sender<WriteResponse>,
    },
    Commit {
        request: WriteRequest,
        reply: oneshot::Sender<WriteResponse>,
    },
    /// A fire-and-forget notification that an action has been learned
    /// elsewhere.
    Learned {
        action: Action,
    },
    Learn {
        position: u64,
        reply: oneshot::Sender<LearnResponse>,
    },
    Read {
        from: u64,
        to: u64,
        reply: oneshot::Sender<LogResult<Vec<Action>>>,
    },
    Missing {
        up_to: u64,
        reply: oneshot::Sender<BTreeSet<u64>>,
    },
    Beginning {
        reply: oneshot::Sender<u64>,
    },
    Ending {
        reply: oneshot::Sender<u64>,
    },
    Promised {
        reply: oneshot::Sender<u64>,
    },
    Shutdown,
}
