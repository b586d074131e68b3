use std::time::Duration;

use keel_common::config::AppConfig;
use keel_server::retry::RetryStrategy;

use crate::allocator::AllocatorOptions;
use crate::journal::{Journal, RegistryEvent};

pub struct MasterOptions {
    /// The epoch assigned to this master by its election; it prefixes
    /// every identifier the master mints.
    pub epoch: String,
    pub tick_interval: Duration,
    pub worker_ping_interval: Duration,
    pub worker_ping_timeout_count: u32,
    /// How long an unreachable worker is retained for re-registration
    /// before it is removed outright.
    pub worker_removal_timeout: Duration,
    /// Upper bound on the failover timeout a framework may request.
    pub framework_failover_timeout_max: Duration,
    pub completed_task_capacity: usize,
    pub completed_framework_capacity: usize,
    pub allocator: AllocatorOptions,
    pub status_update_retry_strategy: RetryStrategy,
    /// Where registry transitions are journaled, if this master is backed
    /// by a replicated log.
    pub journal: Option<Journal>,
    /// Transitions recovered from the journal of a previous epoch.
    pub recovered: Vec<RegistryEvent>,
}

impl MasterOptions {
    pub fn from_config(config: &AppConfig, epoch: impl Into<String>) -> Self {
        Self {
            epoch: epoch.into(),
            tick_interval: Duration::from_secs(config.master.tick_interval_secs),
            worker_ping_interval: Duration::from_secs(config.master.worker_ping_interval_secs),
            worker_ping_timeout_count: config.master.worker_ping_timeout_count,
            worker_removal_timeout: Duration::from_secs(config.master.worker_removal_timeout_secs),
            framework_failover_timeout_max: Duration::from_secs(
                config.master.framework_failover_timeout_max_secs,
            ),
            completed_task_capacity: config.master.completed_task_capacity,
            completed_framework_capacity: config.master.completed_framework_capacity,
            allocator: AllocatorOptions::from(config),
            status_update_retry_strategy: RetryStrategy::from(
                &config.master.status_update_retry_strategy,
            ),
            journal: None,
            recovered: vec![],
        }
    }

    /// How long a worker may go without a heartbeat before it is
    /// considered unreachable.
    pub fn worker_heartbeat_timeout(&self) -> Duration {
        self.worker_ping_interval * self.worker_ping_timeout_count
    }
}
