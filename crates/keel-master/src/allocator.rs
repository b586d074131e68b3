//! The offer engine: dominant-resource fairness between users and their
//! frameworks.
//!
//! The allocator owns only ephemeral derived state (refuser sets, filters,
//! the running cluster total); the registry stays authoritative for the
//! entities themselves. Every event handler returns the offer decisions
//! for the master to dispatch.

use std::collections::{BTreeMap, HashMap, HashSet};

use keel_common::config::AppConfig;
use log::{debug, warn};
use tokio::time::Instant;

use crate::error::{MasterError, MasterResult};
use crate::id::{FrameworkId, WorkerId};
use crate::messages::Filters;
use crate::registry::Registry;
use crate::resources::{Resources, Value};

#[derive(Debug, Clone)]
pub struct AllocatorOptions {
    /// Minimum free CPUs for a worker to be worth offering.
    pub min_offer_cpus: f64,
    /// Minimum free memory (MiB) for a worker to be worth offering.
    pub min_offer_mem_mib: f64,
    /// Offers batched per framework in one dispatch.
    pub offer_batch_size: usize,
    /// Outstanding offers above which new offers are withheld.
    pub offer_backlog_limit: usize,
    /// Fair-sharing weights per user; unlisted users weigh 1.0.
    pub user_weights: HashMap<String, f64>,
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        Self {
            min_offer_cpus: 1.0,
            min_offer_mem_mib: 32.0,
            offer_batch_size: 100,
            offer_backlog_limit: 1000,
            user_weights: HashMap::new(),
        }
    }
}

impl From<&AppConfig> for AllocatorOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            min_offer_cpus: config.master.min_offer_cpus,
            min_offer_mem_mib: config.master.min_offer_mem_mib,
            offer_batch_size: config.master.offer_batch_size,
            offer_backlog_limit: config.master.offer_backlog_limit,
            user_weights: HashMap::new(),
        }
    }
}

/// An offer decision: resource chunks on workers for one framework.
#[derive(Debug)]
pub struct Allocation {
    pub framework_id: FrameworkId,
    pub offers: Vec<(WorkerId, Resources)>,
}

/// Why an offer came back to the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferReturnReason {
    /// The framework replied (launched on part of it, or declined).
    FrameworkReplied,
    /// The master rescinded the offer.
    OfferRescinded,
    FrameworkRemoved,
    WorkerRemoved,
}

struct Filter {
    worker_id: WorkerId,
    resources: Resources,
    /// `None` filters until offers are revived.
    deadline: Option<Instant>,
}

struct FrameworkEntry {
    id: FrameworkId,
    user: String,
    resources: Resources,
}

pub struct Allocator {
    options: AllocatorOptions,
    /// Total resources of the cluster, maintained across worker add and
    /// remove events.
    total: Resources,
    /// Frameworks that recently declined an offer from each worker. The
    /// set clears when the worker's free resources grow or when every
    /// known framework is in it.
    refusers: HashMap<WorkerId, HashSet<FrameworkId>>,
    filters: HashMap<FrameworkId, Vec<Filter>>,
}

impl Allocator {
    pub fn new(options: AllocatorOptions) -> Self {
        Self {
            options,
            total: Resources::new(),
            refusers: HashMap::new(),
            filters: HashMap::new(),
        }
    }

    pub fn total(&self) -> &Resources {
        &self.total
    }

    pub fn framework_added(
        &mut self,
        registry: &Registry,
        now: Instant,
    ) -> MasterResult<Vec<Allocation>> {
        self.make_offers(registry, all_active_workers(registry), now)
    }

    pub fn framework_removed(
        &mut self,
        framework_id: &FrameworkId,
        registry: &Registry,
        now: Instant,
    ) -> MasterResult<Vec<Allocation>> {
        for refusers in self.refusers.values_mut() {
            refusers.remove(framework_id);
        }
        self.filters.remove(framework_id);
        self.make_offers(registry, all_active_workers(registry), now)
    }

    pub fn worker_added(
        &mut self,
        registry: &Registry,
        worker_id: &WorkerId,
        now: Instant,
    ) -> MasterResult<Vec<Allocation>> {
        let Some(worker) = registry.worker(worker_id) else {
            warn!("worker {worker_id} not found");
            return Ok(vec![]);
        };
        self.total += &worker.info.resources;
        self.refusers.entry(worker_id.clone()).or_default();
        self.make_offers(registry, vec![worker_id.clone()], now)
    }

    pub fn worker_removed(&mut self, worker_id: &WorkerId, capacity: &Resources) {
        self.total -= capacity;
        self.refusers.remove(worker_id);
        for filters in self.filters.values_mut() {
            filters.retain(|filter| filter.worker_id != *worker_id);
        }
    }

    /// A task or executor on the worker ended: its free resources grew, so
    /// recent refusals no longer apply.
    pub fn task_ended(
        &mut self,
        registry: &Registry,
        worker_id: &WorkerId,
        now: Instant,
    ) -> MasterResult<Vec<Allocation>> {
        if let Some(refusers) = self.refusers.get_mut(worker_id) {
            refusers.clear();
        }
        self.make_offers(registry, vec![worker_id.clone()], now)
    }

    pub fn offer_returned(
        &mut self,
        registry: &Registry,
        reason: OfferReturnReason,
        framework_id: &FrameworkId,
        resources_left: Vec<(WorkerId, Resources)>,
        filters: &Filters,
        now: Instant,
    ) -> MasterResult<Vec<Allocation>> {
        if reason == OfferReturnReason::FrameworkReplied {
            for (worker_id, resources) in &resources_left {
                if resources.is_empty() {
                    continue;
                }
                debug!("framework {framework_id} becomes a refuser of worker {worker_id}");
                self.refusers
                    .entry(worker_id.clone())
                    .or_default()
                    .insert(framework_id.clone());
                if let Some(refuse) = filters.refuse {
                    self.filters
                        .entry(framework_id.clone())
                        .or_default()
                        .push(Filter {
                            worker_id: worker_id.clone(),
                            resources: resources.clone(),
                            deadline: (!refuse.is_zero()).then(|| now + refuse),
                        });
                }
            }
        }
        match reason {
            OfferReturnReason::FrameworkRemoved | OfferReturnReason::WorkerRemoved => Ok(vec![]),
            _ => {
                let workers = resources_left
                    .into_iter()
                    .map(|(worker_id, _)| worker_id)
                    .collect();
                self.make_offers(registry, workers, now)
            }
        }
    }

    pub fn offers_revived(
        &mut self,
        registry: &Registry,
        framework_id: &FrameworkId,
        now: Instant,
    ) -> MasterResult<Vec<Allocation>> {
        self.filters.remove(framework_id);
        self.make_offers(registry, all_active_workers(registry), now)
    }

    pub fn tick(&mut self, registry: &Registry, now: Instant) -> MasterResult<Vec<Allocation>> {
        for filters in self.filters.values_mut() {
            filters.retain(|filter| match filter.deadline {
                Some(deadline) => deadline > now,
                None => true,
            });
        }
        self.filters.retain(|_, filters| !filters.is_empty());
        self.make_offers(registry, all_active_workers(registry), now)
    }

    /// Look at the free resources of the given workers and hand each
    /// worker's whole free chunk to the first framework in dominant-share
    /// order that neither refused the worker nor filters it. The ordering
    /// is recomputed after every grant so a framework's pending grants
    /// count against it immediately.
    fn make_offers(
        &mut self,
        registry: &Registry,
        workers: Vec<WorkerId>,
        now: Instant,
    ) -> MasterResult<Vec<Allocation>> {
        if registry.offer_count() >= self.options.offer_backlog_limit {
            return Err(MasterError::Overloaded(
                "outstanding offer backlog limit reached".to_string(),
            ));
        }
        let frameworks = registry
            .active_frameworks()
            .map(|framework| FrameworkEntry {
                id: framework.id.clone(),
                user: framework.info.user.clone(),
                resources: framework.resources.clone(),
            })
            .collect::<Vec<_>>();
        if frameworks.is_empty() {
            return Ok(vec![]);
        }

        let mut free = BTreeMap::new();
        for worker_id in workers {
            let Some(worker) = registry.worker(&worker_id) else {
                continue;
            };
            if !worker.active {
                continue;
            }
            let resources = worker.free();
            if resources.cpus() >= self.options.min_offer_cpus
                && resources.mem_mib() >= self.options.min_offer_mem_mib
            {
                free.insert(worker_id, resources);
            }
        }
        if free.is_empty() {
            return Ok(vec![]);
        }

        for worker_id in free.keys() {
            if let Some(refusers) = self.refusers.get_mut(worker_id) {
                if refusers.len() >= frameworks.len() {
                    debug!("clearing refusers for worker {worker_id} because everyone refused it");
                    refusers.clear();
                }
            }
        }

        let mut pending: HashMap<FrameworkId, Resources> = HashMap::new();
        let mut granted: BTreeMap<FrameworkId, Vec<(WorkerId, Resources)>> = BTreeMap::new();
        for (worker_id, resources) in &free {
            for index in self.ordering(&frameworks, &pending) {
                let framework = &frameworks[index];
                if self
                    .refusers
                    .get(worker_id)
                    .is_some_and(|refusers| refusers.contains(&framework.id))
                {
                    continue;
                }
                if self.is_filtered(&framework.id, worker_id, resources, now) {
                    continue;
                }
                debug!(
                    "offering {resources} on worker {worker_id} to framework {}",
                    framework.id
                );
                *pending.entry(framework.id.clone()).or_default() += resources;
                granted
                    .entry(framework.id.clone())
                    .or_default()
                    .push((worker_id.clone(), resources.clone()));
                break;
            }
        }

        let mut allocations = vec![];
        for (framework_id, offers) in granted {
            for chunk in offers.chunks(self.options.offer_batch_size.max(1)) {
                allocations.push(Allocation {
                    framework_id: framework_id.clone(),
                    offers: chunk.to_vec(),
                });
            }
        }
        Ok(allocations)
    }

    /// The deterministic allocation ordering: users ascending by dominant
    /// share over weight, frameworks within a user likewise, ties broken
    /// by id.
    fn ordering(
        &self,
        frameworks: &[FrameworkEntry],
        pending: &HashMap<FrameworkId, Resources>,
    ) -> Vec<usize> {
        let charged = |entry: &FrameworkEntry| {
            let mut resources = entry.resources.clone();
            if let Some(extra) = pending.get(&entry.id) {
                resources += extra;
            }
            resources
        };

        let mut users: BTreeMap<&str, (Resources, Vec<usize>)> = BTreeMap::new();
        for (index, entry) in frameworks.iter().enumerate() {
            let user = users.entry(entry.user.as_str()).or_default();
            user.0 += &charged(entry);
            user.1.push(index);
        }

        let mut user_list = users.into_iter().collect::<Vec<_>>();
        sort_by_drf(
            &mut user_list,
            &self.total,
            |(_, (resources, _))| resources.clone(),
            |(name, _)| self.user_weight(name),
            |(name, _)| name.to_string(),
        );

        let mut ordering = vec![];
        for (_, (_, mut indices)) in user_list {
            sort_by_drf(
                &mut indices,
                &self.total,
                |index| charged(&frameworks[*index]),
                |_| 1.0,
                |index| frameworks[*index].id.to_string(),
            );
            ordering.extend(indices);
        }
        ordering
    }

    fn user_weight(&self, user: &str) -> f64 {
        self.options.user_weights.get(user).copied().unwrap_or(1.0)
    }

    fn is_filtered(
        &self,
        framework_id: &FrameworkId,
        worker_id: &WorkerId,
        resources: &Resources,
        now: Instant,
    ) -> bool {
        let Some(filters) = self.filters.get(framework_id) else {
            return false;
        };
        filters.iter().any(|filter| {
            filter.worker_id == *worker_id
                && filter.deadline.map_or(true, |deadline| deadline > now)
                && filter.resources.contains(resources)
        })
    }
}

fn all_active_workers(registry: &Registry) -> Vec<WorkerId> {
    registry.active_workers().map(|w| w.id.clone()).collect()
}

/// Sort items ascending by weighted dominant share, with ties broken by id
/// so the order is total and deterministic.
fn sort_by_drf<T>(
    items: &mut [T],
    total: &Resources,
    resources: impl Fn(&T) -> Resources,
    weight: impl Fn(&T) -> f64,
    id: impl Fn(&T) -> String,
) {
    items.sort_by(|a, b| {
        let score_a = dominant_share(&resources(a), total) / weight(a);
        let score_b = dominant_share(&resources(b), total) / weight(b);
        score_a.total_cmp(&score_b).then_with(|| id(a).cmp(&id(b)))
    });
}

/// The largest per-resource share of cluster capacity a vector consumes.
pub fn dominant_share(resources: &Resources, total: &Resources) -> f64 {
    let mut share: f64 = 0.0;
    for (name, value) in total.iter() {
        if let Value::Scalar(capacity) = value {
            if *capacity > 0.0 {
                share = share.max(resources.scalar(name) / capacity);
            }
        }
    }
    share
}
