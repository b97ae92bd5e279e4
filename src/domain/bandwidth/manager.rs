use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::bandwidth::aggregator::SubscriptionAggregator;
use crate::domain::bandwidth::allocation::{BandwidthAllocation, RetrievalStatus, SubscriptionRetrieval};
use crate::domain::bandwidth::allocation_store::{AllocationId, AllocationStore};
use crate::domain::bandwidth::bucket_store::BucketStore;
use crate::domain::bandwidth::config::SchedulerConfig;
use crate::domain::bandwidth::network::Network;
use crate::domain::bandwidth::persistence::{BandwidthDao, PersistedSubscription};
use crate::domain::bandwidth::registry::DataSetRegistry;
use crate::domain::bandwidth::retrieval_plan::{PlanChange, RetrievalPlan};
use crate::domain::bandwidth::subscription::{BandwidthSubscription, Subscription, SubscriptionStore};
use crate::domain::clock::SharedClock;
use crate::error::{Error, Result};
use crate::utils::id::SubscriptionName;

/// Outcome of one `schedule()` call: which subscription names ended fully
/// scheduled and which ended unscheduled (every allocation deferred).
#[derive(Debug, Default, Clone)]
pub struct ScheduleResult {
    pub scheduled: BTreeSet<SubscriptionName>,
    pub unscheduled: BTreeSet<SubscriptionName>,
}

/// Currently allocated versus available bytes over a route's live horizon.
#[derive(Debug, Clone, Copy)]
pub struct RouteBandwidth {
    pub capacity_bytes: u64,
    pub allocated_bytes: u64,
}

impl RouteBandwidth {
    pub fn available_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.allocated_bytes)
    }
}

/// A subscription whose every allocation completed; handed to the
/// notification collaborator.
#[derive(Debug, Clone)]
pub struct FulfilledSubscription {
    pub snapshot: BandwidthSubscription,
    pub completed_at_ms: i64,
}

/// Orchestrates admission and scheduling of bandwidth-constrained retrieval
/// work.
///
/// One instance per process, constructed explicitly at startup and shared by
/// handle. Registry-event callbacks and the periodic dispatch pass both end
/// up here; every bucket-mutating path locks the owning network's plan, so
/// cross-network work proceeds in parallel while a single network is
/// single-writer.
#[derive(Debug)]
pub struct BandwidthManager {
    config: SchedulerConfig,

    plans: HashMap<Network, Mutex<RetrievalPlan>>,

    allocation_store: AllocationStore,
    bucket_store: BucketStore,
    subscription_store: SubscriptionStore,

    aggregator: Arc<dyn SubscriptionAggregator>,
    registry: Arc<dyn DataSetRegistry>,
    dao: Arc<dyn BandwidthDao>,

    clock: SharedClock,
}

impl BandwidthManager {
    pub fn new(
        config: SchedulerConfig,
        aggregator: Arc<dyn SubscriptionAggregator>,
        registry: Arc<dyn DataSetRegistry>,
        dao: Arc<dyn BandwidthDao>,
        clock: SharedClock,
    ) -> Self {
        let allocation_store = AllocationStore::new();
        let bucket_store = BucketStore::new();
        let subscription_store = SubscriptionStore::new();

        let now = clock.now_millis();

        let plans = config
            .configured_networks()
            .map(|network_config| {
                let plan = RetrievalPlan::new(
                    network_config.clone(),
                    bucket_store.clone(),
                    allocation_store.clone(),
                    subscription_store.clone(),
                    config.extended_latency_factor_percent,
                    now,
                );
                (network_config.network, Mutex::new(plan))
            })
            .collect();

        BandwidthManager { config, plans, allocation_store, bucket_store, subscription_store, aggregator, registry, dao, clock }
    }

    /// Rebuilds a manager from persisted scheduling state after a process
    /// restart.
    ///
    /// Allocations persisted as `Active` come back as `Scheduled`: the
    /// in-flight agent call did not survive the process, so the work is
    /// re-dispatched rather than presumed done.
    pub fn from_persisted(
        config: SchedulerConfig,
        aggregator: Arc<dyn SubscriptionAggregator>,
        registry: Arc<dyn DataSetRegistry>,
        dao: Arc<dyn BandwidthDao>,
        clock: SharedClock,
    ) -> Result<Self> {
        let manager = Self::new(config, aggregator, registry, dao, clock);

        for row in manager.dao.load_all()? {
            manager.subscription_store.insert(row.snapshot.clone());

            for mut retrieval in row.retrievals {
                if retrieval.base.status == RetrievalStatus::Active {
                    log::warn!(
                        "Allocation of subscription {} was active at shutdown; recovering it as scheduled.",
                        retrieval.base.subscription_name
                    );
                    retrieval.base.status = RetrievalStatus::Scheduled;
                }

                let network = retrieval.base.network;
                let bucket_start = retrieval.base.bucket_start_ms;
                let size = retrieval.base.estimated_size_bytes;
                let status = retrieval.base.status;

                let id = manager.allocation_store.add(Box::new(retrieval));

                if status == RetrievalStatus::Scheduled {
                    if let Some(start) = bucket_start {
                        let network_config = manager.config.network(network)?;
                        let mut bucket = manager.bucket_store.create_bucket(
                            network,
                            start,
                            network_config.bucket_width_ms,
                            network_config.bucket_capacity_bytes(),
                        );
                        bucket.insert_allocation(id, size);
                        manager.bucket_store.put_bucket(bucket);
                    }
                }
            }

            log::info!("Recovered bandwidth subscription {} from persisted state.", row.snapshot.name);
        }

        Ok(manager)
    }

    fn plan_for(&self, network: Network) -> Result<MutexGuard<'_, RetrievalPlan>> {
        self.plans.get(&network).map(|plan| plan.lock().expect("Mutex poisoned")).ok_or(Error::UnknownNetwork(network))
    }

    fn validate(&self, subscription: &Subscription) -> Result<Network> {
        if !subscription.active {
            return Err(Error::Validation(format!("Subscription {} is not active", subscription.name)));
        }

        let network = subscription
            .route
            .ok_or_else(|| Error::Validation(format!("Subscription {} has no route assigned", subscription.name)))?;

        // A network without bucket configuration is an unrecoverable setup
        // problem, distinct from a bad subscription definition.
        self.config.network(network)?;

        match self.registry.get_by_dataset(&subscription.dataset_name, &subscription.provider) {
            Ok(records) if records.is_empty() => {
                Err(Error::Validation(format!("Data set {} at {} is not known to the registry", subscription.dataset_name, subscription.provider)))
            }
            Ok(_) => Ok(network),
            Err(e) => Err(Error::Validation(format!("Data set lookup for {} failed: {}", subscription.dataset_name, e))),
        }
    }

    /// Admits a subscription: supersedes any previous allocations, aggregates
    /// fresh ones and commits them into the route's retrieval plan.
    ///
    /// The call is idempotent under repeated definitions and transactional per
    /// subscription: a persistence failure leaves no partial bucket mutation
    /// behind, and a superseded definition's live state survives intact.
    pub fn schedule(&self, subscription: &Subscription) -> Result<ScheduleResult> {
        let network = self.validate(subscription)?;
        self.schedule_batch(network, &[subscription])
    }

    /// Admits a batch of subscriptions in one pass, letting the aggregator
    /// see all of them together. This is what makes combining strategies
    /// effective: snapshots sharing a (provider, data set, network) group
    /// ride on a single retrieval.
    ///
    /// Validation is all-or-nothing: one invalid definition rejects the
    /// whole batch before anything is touched.
    pub fn schedule_all(&self, subscriptions: &[Subscription]) -> Result<ScheduleResult> {
        let mut by_network: HashMap<Network, Vec<&Subscription>> = HashMap::new();

        for subscription in subscriptions {
            let network = self.validate(subscription)?;
            by_network.entry(network).or_default().push(subscription);
        }

        let mut result = ScheduleResult::default();

        for (network, group) in by_network {
            let outcome = self.schedule_batch(network, &group)?;
            result.scheduled.extend(outcome.scheduled);
            result.unscheduled.extend(outcome.unscheduled);
        }

        Ok(result)
    }

    fn schedule_batch(&self, network: Network, group: &[&Subscription]) -> Result<ScheduleResult> {
        let now = self.clock.now_millis();
        let plan = self.plan_for(network)?;

        // Supersede: free every non-terminal allocation of the previous
        // definitions before building the new snapshots. The removed state is
        // kept aside so a persistence failure can restore it.
        let mut superseded = Vec::new();
        let mut previous_snapshots = Vec::new();
        let mut snapshots = Vec::new();

        for subscription in group {
            superseded.extend(self.remove_non_terminal(&plan, &subscription.name));
            previous_snapshots.push(self.subscription_store.get(&subscription.name));

            let snapshot = BandwidthSubscription::snapshot_of(subscription, network);
            self.subscription_store.insert(snapshot.clone());
            snapshots.push(snapshot);
        }

        let retrievals = self.aggregator.aggregate(&snapshots, now);

        let ids: Vec<AllocationId> = retrievals.iter().map(|retrieval| self.allocation_store.add(Box::new(retrieval.clone()))).collect();

        let change = plan.stage_placements(&ids, now);

        // Persist the staged end state before any live mutation, so a DAO
        // failure rolls the whole call back.
        let rows = Self::staged_rows(&snapshots, retrievals, &ids, &change);

        if let Err(e) = self.dao.save_all(&rows) {
            for id in ids {
                self.allocation_store.remove(id);
            }
            for snapshot in &snapshots {
                self.subscription_store.remove(&snapshot.name);
            }
            for previous in previous_snapshots.into_iter().flatten() {
                self.subscription_store.insert(previous);
            }
            self.restore_superseded(superseded);

            log::error!("Persistence rejected a schedule on {}; restored the previous state. Cause: {}", network, e);
            return Err(Error::Persistence(e.to_string()));
        }

        plan.apply(&change);

        log::info!(
            "Scheduled {} subscription(s) on {}: {} placed, {} deferred, {} preempted.",
            group.len(),
            network,
            change.scheduled.len(),
            change.deferred.len(),
            change.bumped.len()
        );

        // Bumped residents belong to other subscriptions; bring their rows up
        // to date now that the change is applied.
        for bump in &change.bumped {
            if let Some(name) = self.allocation_store.get(bump.id).map(|h| h.read().expect("RwLock poisoned").subscription_name()) {
                if let Err(e) = self.persist_subscription(&name) {
                    log::error!("Failed to persist preempted subscription {}: {}", name, e);
                }
            }
        }

        let mut result = ScheduleResult::default();

        for row in &rows {
            let any_deferred = row.retrievals.iter().any(|retrieval| retrieval.base.status == RetrievalStatus::Deferred);

            if any_deferred {
                result.unscheduled.insert(row.snapshot.name.clone());
            } else {
                result.scheduled.insert(row.snapshot.name.clone());
            }
        }

        Ok(result)
    }

    /// Projects the staged placement outcome onto the freshly aggregated
    /// retrieval rows and groups them per owning subscription, for
    /// persistence ahead of the live apply. A member riding on another
    /// subscription's shared retrieval gets a row with no retrievals of its
    /// own.
    fn staged_rows(
        snapshots: &[BandwidthSubscription],
        retrievals: Vec<SubscriptionRetrieval>,
        ids: &[AllocationId],
        change: &PlanChange,
    ) -> Vec<PersistedSubscription> {
        let mut rows: Vec<PersistedSubscription> =
            snapshots.iter().map(|snapshot| PersistedSubscription { snapshot: snapshot.clone(), retrievals: Vec::new() }).collect();

        for (mut retrieval, id) in retrievals.into_iter().zip(ids) {
            if let Some((_, start)) = change.scheduled.iter().find(|(scheduled_id, _)| scheduled_id == id) {
                retrieval.base.status = RetrievalStatus::Scheduled;
                retrieval.base.bucket_start_ms = Some(*start);
            } else {
                retrieval.base.status = RetrievalStatus::Deferred;
                retrieval.base.bucket_start_ms = None;
            }

            if let Some(row) = rows.iter_mut().find(|row| row.snapshot.name == retrieval.base.subscription_name) {
                row.retrievals.push(retrieval);
            }
        }

        rows
    }

    /// Cancels and forgets every non-terminal allocation of the subscription,
    /// restoring the freed bytes to their buckets. Runs under the plan lock
    /// held by the caller, so a concurrent dispatch pass cannot pick the
    /// allocations up mid-removal.
    ///
    /// # Returns
    /// Pre-removal clones of the dropped allocations, bucket assignments
    /// included, so the caller can undo the supersede.
    fn remove_non_terminal(&self, plan: &RetrievalPlan, name: &SubscriptionName) -> Vec<Box<dyn BandwidthAllocation>> {
        let mut removed = Vec::new();

        for id in self.allocation_store.non_terminal_for(name) {
            if let Some(handle) = self.allocation_store.get(id) {
                removed.push(handle.read().expect("RwLock poisoned").box_clone());
            }

            plan.release_from_bucket(id);
            self.allocation_store.set_status(id, RetrievalStatus::Cancelled);
            self.allocation_store.remove(id);
        }

        removed
    }

    /// Re-admits allocations dropped by a supersede whose replacing schedule
    /// failed to persist. The clones still carry their original status and
    /// bucket assignment, so the buckets return to their pre-call load.
    fn restore_superseded(&self, superseded: Vec<Box<dyn BandwidthAllocation>>) {
        for allocation in superseded {
            let network = allocation.network();
            let bucket_start = allocation.bucket_start_ms();
            let size = allocation.estimated_size_bytes();

            let id = self.allocation_store.add(allocation);

            if let Some(start) = bucket_start {
                if let Ok(config) = self.config.network(network) {
                    let mut bucket = self.bucket_store.create_bucket(network, start, config.bucket_width_ms, config.bucket_capacity_bytes());
                    bucket.insert_allocation(id, size);
                    self.bucket_store.put_bucket(bucket);
                }
            }
        }
    }

    /// Deletes a subscription from the scheduler: all its non-terminal
    /// allocations are removed synchronously and their capacity restored.
    pub fn unschedule(&self, name: &SubscriptionName) -> Result<()> {
        let Some(snapshot) = self.subscription_store.get(name) else {
            log::debug!("Unschedule requested for unknown subscription {}; nothing to do.", name);
            return Ok(());
        };

        let plan = self.plan_for(snapshot.network)?;

        self.remove_non_terminal(&plan, name);
        self.subscription_store.remove(name);
        self.dao.delete(name)?;

        log::info!("Unscheduled subscription {} from {}.", name, snapshot.network);
        Ok(())
    }

    /// Currently allocated/available bytes over the route's live horizon.
    pub fn get_bandwidth_for_route(&self, network: Network) -> Result<RouteBandwidth> {
        let plan = self.plan_for(network)?;
        let (capacity_bytes, allocated_bytes) = plan.bandwidth_usage();

        Ok(RouteBandwidth { capacity_bytes, allocated_bytes })
    }

    /// All retrieval rows currently tied to a subscription, for status
    /// queries. Reads an eventually-consistent snapshot without the plan lock.
    pub fn get_subscription_dependencies(&self, name: &SubscriptionName) -> Vec<SubscriptionRetrieval> {
        self.allocation_store
            .get_by_subscription(name)
            .into_iter()
            .filter_map(|id| {
                let handle = self.allocation_store.get(id)?;
                let guard = handle.read().expect("RwLock poisoned");
                guard.as_any().downcast_ref::<SubscriptionRetrieval>().cloned()
            })
            .collect()
    }

    pub fn subscription_snapshot(&self, name: &SubscriptionName) -> Option<BandwidthSubscription> {
        self.subscription_store.get(name)
    }

    pub fn networks(&self) -> Vec<Network> {
        self.plans.keys().copied().collect()
    }

    /// Advances every retrieval plan's rolling horizon.
    pub fn advance_plans(&self) {
        let now = self.clock.now_millis();

        for plan in self.plans.values() {
            plan.lock().expect("Mutex poisoned").advance(now);
        }
    }

    /// Claims the due retrievals of one network for dispatch: every
    /// `Scheduled` allocation in a bucket whose start time has arrived is
    /// transitioned to `Active` under the plan lock and handed back.
    ///
    /// The agent call itself happens outside the lock.
    pub fn claim_due_retrievals(&self, network: Network) -> Result<Vec<(AllocationId, SubscriptionRetrieval)>> {
        let now = self.clock.now_millis();
        let plan = self.plan_for(network)?;

        let mut claimed = Vec::new();

        for id in plan.due_scheduled(now) {
            if !self.allocation_store.set_status(id, RetrievalStatus::Active) {
                continue;
            }

            if let Some(handle) = self.allocation_store.get(id) {
                let guard = handle.read().expect("RwLock poisoned");
                if let Some(retrieval) = guard.as_any().downcast_ref::<SubscriptionRetrieval>() {
                    claimed.push((id, retrieval.clone()));
                }
            }
        }

        Ok(claimed)
    }

    /// Records the agent's verdict for one active retrieval.
    ///
    /// On success the estimated size is reconciled with the actual size and
    /// the bucket capacity released; on failure the allocation is failed and
    /// left for the next natural schedule cycle. When this completion turns
    /// the whole subscription fulfilled, the aggregator's completion hook
    /// runs (exactly once) and every subscription it reports fulfilled —
    /// members of a shared retrieval included — is returned for notification.
    pub fn record_outcome(&self, id: AllocationId, actual_size_bytes: Option<u64>, success: bool) -> Result<Vec<FulfilledSubscription>> {
        let Some(handle) = self.allocation_store.get(id) else {
            log::error!("Outcome reported for unknown allocation id {:?}.", id);
            return Ok(Vec::new());
        };

        let (name, network) = {
            let guard = handle.read().expect("RwLock poisoned");
            (guard.subscription_name(), guard.network())
        };

        let now = self.clock.now_millis();
        let plan = self.plan_for(network)?;

        // Terminal allocations no longer hold admission capacity.
        plan.release_from_bucket(id);

        {
            let mut guard = handle.write().expect("RwLock poisoned");
            let base = guard.base_mut();

            if success {
                base.set_status(RetrievalStatus::Completed);
                if let Some(actual) = actual_size_bytes {
                    base.actual_size_bytes = Some(actual);
                }
            } else {
                base.set_status(RetrievalStatus::Failed);
            }
        }

        if let Err(e) = self.persist_subscription(&name) {
            log::error!("Failed to persist retrieval outcome for subscription {}: {}", name, e);
        }

        if !success {
            log::warn!("Retrieval for subscription {} failed; awaiting the next schedule cycle.", name);
            return Ok(Vec::new());
        }

        if !self.allocation_store.all_completed(&name) {
            return Ok(Vec::new());
        }

        // Check-and-set under the store so the completion hook and the
        // notifications fire exactly once per snapshot.
        if !self.subscription_store.mark_fulfilled(&name) {
            return Ok(Vec::new());
        }

        let completed = self.get_subscription_dependencies(&name);
        let fulfilled_names = self.aggregator.complete_retrieval(&completed);

        let mut fulfilled = Vec::new();

        for member in fulfilled_names {
            // The triggering snapshot already passed the check-and-set above.
            if member != name && !self.subscription_store.mark_fulfilled(&member) {
                continue;
            }

            if let Err(e) = self.persist_subscription(&member) {
                log::error!("Failed to persist fulfillment of subscription {}: {}", member, e);
            }

            match self.subscription_store.get(&member) {
                Some(snapshot) => fulfilled.push(FulfilledSubscription { snapshot, completed_at_ms: now }),
                None => log::error!("Snapshot of fulfilled subscription {} vanished before notification.", member),
            }
        }

        Ok(fulfilled)
    }

    /// Writes the subscription's current live rows through the DAO.
    fn persist_subscription(&self, name: &SubscriptionName) -> Result<()> {
        let Some(snapshot) = self.subscription_store.get(name) else {
            return Ok(());
        };

        let row = PersistedSubscription { snapshot, retrievals: self.get_subscription_dependencies(name) };
        self.dao.save(&row)
    }
}
