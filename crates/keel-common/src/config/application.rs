use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub log: LogConfig,
    pub group: GroupConfig,
    pub master: MasterConfig,
}

impl AppConfig {
    /// Load the configuration from the embedded defaults, overridden by
    /// `KEEL_` environment variables (`KEEL_MASTER__QUORUM=3` maps to
    /// `master.quorum`).
    pub fn load() -> CommonResult<Self> {
        Figment::from(Toml::string(DEFAULT_CONFIG))
            .merge(Env::prefixed("KEEL_").map(|p| p.as_str().replace("__", ".").into()))
            .extract()
            .map_err(|e| CommonError::InvalidArgument(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Path of the local replica's record file.
    pub path: String,
    /// Strict majority size of the replica set.
    pub quorum: usize,
    /// Capacity of the replica's position cache.
    pub cache_capacity: usize,
    /// Deadline for each consensus phase (promise, write, commit).
    pub phase_timeout_secs: u64,
    /// How many times a writer retries election before giving up.
    pub election_retry_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Interval of the master's periodic timer.
    pub tick_interval_secs: u64,
    /// Interval between pings to each registered worker.
    pub worker_ping_interval_secs: u64,
    /// Consecutive missed pings before a worker is considered unreachable.
    pub worker_ping_timeout_count: u32,
    /// How long an unreachable worker is retained for re-registration
    /// before it is removed outright.
    pub worker_removal_timeout_secs: u64,
    /// Upper bound on the failover timeout a framework may request.
    pub framework_failover_timeout_max_secs: u64,
    /// Completed tasks retained per framework.
    pub completed_task_capacity: usize,
    /// Completed frameworks retained by the master.
    pub completed_framework_capacity: usize,
    /// Minimum free CPUs for a worker to be offered.
    pub min_offer_cpus: f64,
    /// Minimum free memory (MiB) for a worker to be offered.
    pub min_offer_mem_mib: f64,
    /// Offers batched per framework in one dispatch.
    pub offer_batch_size: usize,
    /// Outstanding offers above which the allocator withholds new offers.
    pub offer_backlog_limit: usize,
    pub status_update_retry_strategy: RetryStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed {
        max_count: usize,
        delay_secs: u64,
    },
    ExponentialBackoff {
        max_count: usize,
        initial_delay_secs: u64,
        max_delay_secs: u64,
        factor: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::load().unwrap();
        assert_eq!(config.log.quorum, 1);
        assert_eq!(config.master.offer_batch_size, 100);
        assert!(matches!(
            config.master.status_update_retry_strategy,
            RetryStrategy::ExponentialBackoff { .. }
        ));
    }
}
