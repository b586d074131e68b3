//! The authoritative in-memory maps of cluster entities.
//!
//! Entities are stored in per-kind maps keyed by id and refer to each
//! other by id only. The forward maps and the back-maps on frameworks and
//! workers are maintained together by the add/remove helpers here, which
//! own the accounting invariant: for every worker,
//! `offered + used <= capacity`.

use std::collections::{HashMap, HashSet, VecDeque};

use log::warn;
use tokio::time::Instant;

use crate::error::{MasterError, MasterResult};
use crate::id::{ExecutorId, FrameworkId, OfferId, TaskId, TaskKey, WorkerId};
use crate::messages::{
    Connection, ExecutorInfo, FrameworkInfo, FrameworkMessage, ResourceRequest, StatusUpdate,
    TaskState, WorkerInfo, WorkerMessage,
};
use crate::resources::Resources;

pub struct Framework {
    pub id: FrameworkId,
    pub info: FrameworkInfo,
    pub connection: Connection<FrameworkMessage>,
    /// Turns false when the framework disconnects or is being removed.
    pub active: bool,
    pub registered_at: Instant,
    pub reregistered_at: Instant,
    /// Total resources: running tasks, outstanding offers and executors.
    pub resources: Resources,
    pub task_ids: HashSet<TaskId>,
    pub offer_ids: HashSet<OfferId>,
    /// Executors per worker.
    pub executors: HashMap<WorkerId, HashSet<ExecutorId>>,
    pub completed_tasks: VecDeque<Task>,
    /// The latest resource hints the framework sent outside the offer
    /// cycle.
    pub resource_requests: Vec<ResourceRequest>,
}

impl Framework {
    pub fn new(
        id: FrameworkId,
        info: FrameworkInfo,
        connection: Connection<FrameworkMessage>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            info,
            connection,
            active: true,
            registered_at: now,
            reregistered_at: now,
            resources: Resources::new(),
            task_ids: HashSet::new(),
            offer_ids: HashSet::new(),
            executors: HashMap::new(),
            completed_tasks: VecDeque::new(),
            resource_requests: vec![],
        }
    }

    pub fn has_executor(&self, worker_id: &WorkerId, executor_id: &ExecutorId) -> bool {
        self.executors
            .get(worker_id)
            .is_some_and(|executors| executors.contains(executor_id))
    }
}

pub struct Worker {
    pub id: WorkerId,
    pub info: WorkerInfo,
    pub connection: Connection<WorkerMessage>,
    /// Turns false when the worker is unreachable or being removed.
    pub active: bool,
    pub registered_at: Instant,
    pub last_heartbeat: Instant,
    pub last_ping: Instant,
    /// When the worker became unreachable, if it is.
    pub deactivated_at: Option<Instant>,
    /// Resources currently promised in offers.
    pub offered: Resources,
    /// Resources currently held by tasks and executors.
    pub used: Resources,
    pub offer_ids: HashSet<OfferId>,
    pub task_keys: HashSet<TaskKey>,
    pub executor_keys: HashSet<(FrameworkId, ExecutorId)>,
}

impl Worker {
    pub fn new(id: WorkerId, info: WorkerInfo, connection: Connection<WorkerMessage>) -> Self {
        let now = Instant::now();
        Self {
            id,
            info,
            connection,
            active: true,
            registered_at: now,
            last_heartbeat: now,
            last_ping: now,
            deactivated_at: None,
            offered: Resources::new(),
            used: Resources::new(),
            offer_ids: HashSet::new(),
            task_keys: HashSet::new(),
            executor_keys: HashSet::new(),
        }
    }

    pub fn free(&self) -> Resources {
        self.info.resources.clone() - (self.offered.clone() + self.used.clone())
    }

    pub fn has_executor(&self, framework_id: &FrameworkId, executor_id: &ExecutorId) -> bool {
        self.executor_keys
            .contains(&(framework_id.clone(), executor_id.clone()))
    }
}

pub struct Offer {
    pub id: OfferId,
    pub framework_id: FrameworkId,
    pub worker_id: WorkerId,
    pub resources: Resources,
    pub created_at: Instant,
}

#[derive(Clone)]
pub struct Task {
    pub framework_id: FrameworkId,
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub executor_id: Option<ExecutorId>,
    pub name: String,
    pub resources: Resources,
    pub state: TaskState,
    pub statuses: Vec<StatusUpdate>,
}

impl Task {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.framework_id.clone(), self.task_id.clone())
    }
}

pub struct Executor {
    pub framework_id: FrameworkId,
    pub worker_id: WorkerId,
    pub info: ExecutorInfo,
}

pub struct Registry {
    frameworks: HashMap<FrameworkId, Framework>,
    workers: HashMap<WorkerId, Worker>,
    offers: HashMap<OfferId, Offer>,
    tasks: HashMap<TaskKey, Task>,
    executors: HashMap<(FrameworkId, ExecutorId), Executor>,
    /// Registered worker endpoints, for deduplication.
    worker_host_ports: HashMap<String, HashSet<u16>>,
    completed_frameworks: VecDeque<FrameworkId>,
    completed_task_capacity: usize,
    completed_framework_capacity: usize,
}

impl Registry {
    pub fn new(completed_task_capacity: usize, completed_framework_capacity: usize) -> Self {
        Self {
            frameworks: HashMap::new(),
            workers: HashMap::new(),
            offers: HashMap::new(),
            tasks: HashMap::new(),
            executors: HashMap::new(),
            worker_host_ports: HashMap::new(),
            completed_frameworks: VecDeque::new(),
            completed_task_capacity,
            completed_framework_capacity,
        }
    }

    pub fn add_framework(&mut self, framework: Framework) -> MasterResult<()> {
        if self.frameworks.contains_key(&framework.id) {
            return Err(MasterError::Duplicate(format!(
                "framework {} is already registered",
                framework.id
            )));
        }
        self.frameworks.insert(framework.id.clone(), framework);
        Ok(())
    }

    pub fn framework(&self, id: &FrameworkId) -> Option<&Framework> {
        self.frameworks.get(id)
    }

    pub fn framework_mut(&mut self, id: &FrameworkId) -> Option<&mut Framework> {
        self.frameworks.get_mut(id)
    }

    /// Remove a framework. Its offers, tasks and executors must have been
    /// removed first; the framework id is retained in a bounded ring of
    /// completed frameworks.
    pub fn remove_framework(&mut self, id: &FrameworkId) -> Option<Framework> {
        let framework = self.frameworks.remove(id)?;
        debug_assert!(framework.offer_ids.is_empty());
        debug_assert!(framework.task_ids.is_empty());
        debug_assert!(framework.executors.is_empty());
        self.completed_frameworks.push_back(framework.id.clone());
        if self.completed_frameworks.len() > self.completed_framework_capacity {
            self.completed_frameworks.pop_front();
        }
        Some(framework)
    }

    pub fn frameworks(&self) -> impl Iterator<Item = &Framework> {
        self.frameworks.values()
    }

    pub fn active_frameworks(&self) -> impl Iterator<Item = &Framework> {
        self.frameworks.values().filter(|f| f.active)
    }

    pub fn completed_frameworks(&self) -> &VecDeque<FrameworkId> {
        &self.completed_frameworks
    }

    pub fn add_worker(&mut self, worker: Worker) -> MasterResult<()> {
        if self.workers.contains_key(&worker.id) {
            return Err(MasterError::Duplicate(format!(
                "worker {} is already registered",
                worker.id
            )));
        }
        self.worker_host_ports
            .entry(worker.info.hostname.clone())
            .or_default()
            .insert(worker.info.port);
        self.workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    pub fn worker(&self, id: &WorkerId) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn worker_mut(&mut self, id: &WorkerId) -> Option<&mut Worker> {
        self.workers.get_mut(id)
    }

    /// Remove a worker. Its offers, tasks and executors must have been
    /// removed first.
    pub fn remove_worker(&mut self, id: &WorkerId) -> Option<Worker> {
        let worker = self.workers.remove(id)?;
        debug_assert!(worker.offer_ids.is_empty());
        debug_assert!(worker.task_keys.is_empty());
        debug_assert!(worker.executor_keys.is_empty());
        if let Some(ports) = self.worker_host_ports.get_mut(&worker.info.hostname) {
            ports.remove(&worker.info.port);
            if ports.is_empty() {
                self.worker_host_ports.remove(&worker.info.hostname);
            }
        }
        Some(worker)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn active_workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values().filter(|w| w.active)
    }

    pub fn has_worker_host_port(&self, hostname: &str, port: u16) -> bool {
        self.worker_host_ports
            .get(hostname)
            .is_some_and(|ports| ports.contains(&port))
    }

    /// Create an offer, reserving its resources from the worker's free
    /// pool and charging them to the framework.
    pub fn add_offer(&mut self, offer: Offer) -> MasterResult<()> {
        let Some(framework) = self.frameworks.get_mut(&offer.framework_id) else {
            return Err(MasterError::Rejected(format!(
                "unknown framework {}",
                offer.framework_id
            )));
        };
        let Some(worker) = self.workers.get_mut(&offer.worker_id) else {
            return Err(MasterError::Rejected(format!(
                "unknown worker {}",
                offer.worker_id
            )));
        };
        framework.offer_ids.insert(offer.id.clone());
        framework.resources += &offer.resources;
        worker.offer_ids.insert(offer.id.clone());
        worker.offered += &offer.resources;
        self.offers.insert(offer.id.clone(), offer);
        Ok(())
    }

    pub fn offer(&self, id: &OfferId) -> Option<&Offer> {
        self.offers.get(id)
    }

    pub fn remove_offer(&mut self, id: &OfferId) -> Option<Offer> {
        let offer = self.offers.remove(id)?;
        if let Some(framework) = self.frameworks.get_mut(&offer.framework_id) {
            framework.offer_ids.remove(&offer.id);
            framework.resources -= &offer.resources;
        }
        if let Some(worker) = self.workers.get_mut(&offer.worker_id) {
            worker.offer_ids.remove(&offer.id);
            worker.offered -= &offer.resources;
        }
        Some(offer)
    }

    pub fn offer_count(&self) -> usize {
        self.offers.len()
    }

    /// Record a launched task, charging its resources to the worker and
    /// the framework. A `(framework, task)` key is unique across all
    /// workers.
    pub fn add_task(&mut self, task: Task) -> MasterResult<()> {
        let key = task.key();
        if self.tasks.contains_key(&key) {
            return Err(MasterError::Duplicate(format!("{key} already exists")));
        }
        let Some(framework) = self.frameworks.get_mut(&task.framework_id) else {
            return Err(MasterError::Rejected(format!(
                "unknown framework {}",
                task.framework_id
            )));
        };
        let Some(worker) = self.workers.get_mut(&task.worker_id) else {
            return Err(MasterError::Rejected(format!(
                "unknown worker {}",
                task.worker_id
            )));
        };
        framework.task_ids.insert(task.task_id.clone());
        framework.resources += &task.resources;
        worker.task_keys.insert(key.clone());
        worker.used += &task.resources;
        self.tasks.insert(key, task);
        Ok(())
    }

    pub fn task(&self, key: &TaskKey) -> Option<&Task> {
        self.tasks.get(key)
    }

    pub fn task_mut(&mut self, key: &TaskKey) -> Option<&mut Task> {
        self.tasks.get_mut(key)
    }

    /// Remove a task, releasing its resources and retaining it in the
    /// framework's bounded ring of completed tasks.
    pub fn remove_task(&mut self, key: &TaskKey) -> Option<Task> {
        let task = self.tasks.remove(key)?;
        if let Some(framework) = self.frameworks.get_mut(&task.framework_id) {
            framework.task_ids.remove(&task.task_id);
            framework.resources -= &task.resources;
            framework.completed_tasks.push_back(task.clone());
            if framework.completed_tasks.len() > self.completed_task_capacity {
                framework.completed_tasks.pop_front();
            }
        }
        if let Some(worker) = self.workers.get_mut(&task.worker_id) {
            worker.task_keys.remove(key);
            worker.used -= &task.resources;
        }
        Some(task)
    }

    pub fn tasks_on_worker(&self, worker_id: &WorkerId) -> Vec<TaskKey> {
        match self.workers.get(worker_id) {
            Some(worker) => worker.task_keys.iter().cloned().collect(),
            None => {
                warn!("worker {worker_id} not found");
                vec![]
            }
        }
    }

    pub fn add_executor(&mut self, executor: Executor) -> MasterResult<()> {
        let key = (
            executor.framework_id.clone(),
            executor.info.executor_id.clone(),
        );
        if self.executors.contains_key(&key) {
            return Err(MasterError::Duplicate(format!(
                "executor {} of framework {} already exists",
                executor.info.executor_id, executor.framework_id
            )));
        }
        let Some(framework) = self.frameworks.get_mut(&executor.framework_id) else {
            return Err(MasterError::Rejected(format!(
                "unknown framework {}",
                executor.framework_id
            )));
        };
        let Some(worker) = self.workers.get_mut(&executor.worker_id) else {
            return Err(MasterError::Rejected(format!(
                "unknown worker {}",
                executor.worker_id
            )));
        };
        framework
            .executors
            .entry(executor.worker_id.clone())
            .or_default()
            .insert(executor.info.executor_id.clone());
        framework.resources += &executor.info.resources;
        worker.executor_keys.insert(key.clone());
        worker.used += &executor.info.resources;
        self.executors.insert(key, executor);
        Ok(())
    }

    pub fn executor(&self, framework_id: &FrameworkId, executor_id: &ExecutorId) -> Option<&Executor> {
        self.executors
            .get(&(framework_id.clone(), executor_id.clone()))
    }

    pub fn remove_executor(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
    ) -> Option<Executor> {
        let key = (framework_id.clone(), executor_id.clone());
        let executor = self.executors.remove(&key)?;
        if let Some(framework) = self.frameworks.get_mut(framework_id) {
            if let Some(executors) = framework.executors.get_mut(&executor.worker_id) {
                executors.remove(executor_id);
                if executors.is_empty() {
                    framework.executors.remove(&executor.worker_id);
                }
            }
            framework.resources -= &executor.info.resources;
        }
        if let Some(worker) = self.workers.get_mut(&executor.worker_id) {
            worker.executor_keys.remove(&key);
            worker.used -= &executor.info.resources;
        }
        Some(executor)
    }

    pub fn executors_on_worker(&self, worker_id: &WorkerId) -> Vec<(FrameworkId, ExecutorId)> {
        match self.workers.get(worker_id) {
            Some(worker) => worker.executor_keys.iter().cloned().collect(),
            None => vec![],
        }
    }

    /// Verify the accounting invariants; returns the first violation.
    pub fn validate(&self) -> Result<(), String> {
        for worker in self.workers.values() {
            let committed = worker.offered.clone() + worker.used.clone();
            if !worker.info.resources.contains(&committed) {
                return Err(format!(
                    "worker {} overcommitted: capacity {} but committed {}",
                    worker.id, worker.info.resources, committed
                ));
            }
        }
        for offer in self.offers.values() {
            if !self.frameworks.contains_key(&offer.framework_id)
                || !self.workers.contains_key(&offer.worker_id)
            {
                return Err(format!("offer {} refers to removed entities", offer.id));
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            frameworks: self
                .frameworks
                .values()
                .map(|f| FrameworkSummary {
                    id: f.id.clone(),
                    name: f.info.name.clone(),
                    user: f.info.user.clone(),
                    active: f.active,
                    resources: f.resources.clone(),
                    task_count: f.task_ids.len(),
                    offer_count: f.offer_ids.len(),
                    completed_task_count: f.completed_tasks.len(),
                })
                .collect(),
            workers: self
                .workers
                .values()
                .map(|w| WorkerSummary {
                    id: w.id.clone(),
                    hostname: w.info.hostname.clone(),
                    port: w.info.port,
                    active: w.active,
                    capacity: w.info.resources.clone(),
                    offered: w.offered.clone(),
                    used: w.used.clone(),
                    task_count: w.task_keys.len(),
                })
                .collect(),
            offer_count: self.offers.len(),
            task_count: self.tasks.len(),
        }
    }
}

/// A point-in-time copy of the registry for external readers.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub frameworks: Vec<FrameworkSummary>,
    pub workers: Vec<WorkerSummary>,
    pub offer_count: usize,
    pub task_count: usize,
}

#[derive(Debug, Clone)]
pub struct FrameworkSummary {
    pub id: FrameworkId,
    pub name: String,
    pub user: String,
    pub active: bool,
    pub resources: Resources,
    pub task_count: usize,
    pub offer_count: usize,
    pub completed_task_count: usize,
}

#[derive(Debug, Clone)]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub hostname: String,
    pub port: u16,
    pub active: bool,
    pub capacity: Resources,
    pub offered: Resources,
    pub used: Resources,
    pub task_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framework(id: &str) -> Framework {
        Framework::new(
            FrameworkId::from(id),
            FrameworkInfo {
                name: format!("framework {id}"),
                user: "alice".to_string(),
                failover_timeout: std::time::Duration::ZERO,
            },
            Connection::closed(),
        )
    }

    fn worker(id: &str, cpus: f64, mem: f64) -> Worker {
        Worker::new(
            WorkerId::from(id),
            WorkerInfo {
                hostname: format!("host-{id}"),
                port: 5051,
                resources: Resources::cpus_mem(cpus, mem),
            },
            Connection::closed(),
        )
    }

    fn task(framework_id: &str, task_id: &str, worker_id: &str, cpus: f64, mem: f64) -> Task {
        Task {
            framework_id: FrameworkId::from(framework_id),
            task_id: TaskId::from(task_id),
            worker_id: WorkerId::from(worker_id),
            executor_id: None,
            name: task_id.to_string(),
            resources: Resources::cpus_mem(cpus, mem),
            state: TaskState::Staging,
            statuses: vec![],
        }
    }

    #[tokio::test]
    async fn test_offer_accounting() {
        let mut registry = Registry::new(100, 50);
        registry.add_framework(framework("f1")).unwrap();
        registry.add_worker(worker("w1", 4.0, 4096.0)).unwrap();

        registry
            .add_offer(Offer {
                id: OfferId::from("o1"),
                framework_id: FrameworkId::from("f1"),
                worker_id: WorkerId::from("w1"),
                resources: Resources::cpus_mem(4.0, 4096.0),
                created_at: Instant::now(),
            })
            .unwrap();

        let worker = registry.worker(&WorkerId::from("w1")).unwrap();
        assert!(worker.free().is_empty());
        registry.validate().unwrap();

        let offer = registry.remove_offer(&OfferId::from("o1")).unwrap();
        assert_eq!(offer.resources.cpus(), 4.0);
        let worker = registry.worker(&WorkerId::from("w1")).unwrap();
        assert_eq!(worker.free().cpus(), 4.0);
        assert!(registry
            .framework(&FrameworkId::from("f1"))
            .unwrap()
            .resources
            .is_empty());
    }

    #[tokio::test]
    async fn test_task_key_unique_across_workers() {
        let mut registry = Registry::new(100, 50);
        registry.add_framework(framework("f1")).unwrap();
        registry.add_worker(worker("w1", 4.0, 4096.0)).unwrap();
        registry.add_worker(worker("w2", 4.0, 4096.0)).unwrap();

        registry.add_task(task("f1", "t1", "w1", 1.0, 128.0)).unwrap();
        let result = registry.add_task(task("f1", "t1", "w2", 1.0, 128.0));
        assert!(matches!(result, Err(MasterError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_completed_task_ring_is_bounded() {
        let mut registry = Registry::new(3, 50);
        registry.add_framework(framework("f1")).unwrap();
        registry.add_worker(worker("w1", 100.0, 102400.0)).unwrap();

        for i in 0..5 {
            let id = format!("t{i}");
            registry.add_task(task("f1", &id, "w1", 1.0, 128.0)).unwrap();
            registry
                .remove_task(&TaskKey::new(FrameworkId::from("f1"), TaskId::from(id.as_str())))
                .unwrap();
        }

        let framework = registry.framework(&FrameworkId::from("f1")).unwrap();
        assert_eq!(framework.completed_tasks.len(), 3);
        // Older entries are dropped in arrival order.
        let retained = framework
            .completed_tasks
            .iter()
            .map(|t| t.task_id.as_str().to_string())
            .collect::<Vec<_>>();
        assert_eq!(retained, vec!["t2", "t3", "t4"]);
        assert!(framework.resources.is_empty());
    }

    #[tokio::test]
    async fn test_executor_accounting() {
        let mut registry = Registry::new(100, 50);
        registry.add_framework(framework("f1")).unwrap();
        registry.add_worker(worker("w1", 4.0, 4096.0)).unwrap();

        registry
            .add_executor(Executor {
                framework_id: FrameworkId::from("f1"),
                worker_id: WorkerId::from("w1"),
                info: ExecutorInfo {
                    executor_id: ExecutorId::from("e1"),
                    resources: Resources::cpus_mem(0.5, 256.0),
                    data: vec![],
                },
            })
            .unwrap();

        let worker = registry.worker(&WorkerId::from("w1")).unwrap();
        assert_eq!(worker.free().cpus(), 3.5);
        assert!(worker.has_executor(&FrameworkId::from("f1"), &ExecutorId::from("e1")));
        registry.validate().unwrap();

        registry
            .remove_executor(&FrameworkId::from("f1"), &ExecutorId::from("e1"))
            .unwrap();
        let worker = registry.worker(&WorkerId::from("w1")).unwrap();
        assert_eq!(worker.free().cpus(), 4.0);
    }

    #[tokio::test]
    async fn test_worker_host_port_deduplication() {
        let mut registry = Registry::new(100, 50);
        registry.add_worker(worker("w1", 4.0, 4096.0)).unwrap();
        assert!(registry.has_worker_host_port("host-w1", 5051));
        assert!(!registry.has_worker_host_port("host-w1", 5052));

        registry.remove_worker(&WorkerId::from("w1")).unwrap();
        assert!(!registry.has_worker_host_port("host-w1", 5051));
    }
}
