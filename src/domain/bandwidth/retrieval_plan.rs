use std::cmp::Ordering;
use std::collections::HashMap;

use crate::domain::bandwidth::allocation::{AllocationBase, BandwidthAllocation, RetrievalStatus};
use crate::domain::bandwidth::allocation_store::{AllocationId, AllocationStore};
use crate::domain::bandwidth::bucket_store::BucketStore;
use crate::domain::bandwidth::config::NetworkConfig;
use crate::domain::bandwidth::network::Network;
use crate::domain::bandwidth::subscription::{BandwidthSubscription, SubscriptionStore};

/// Scales the remaining time before data expiry for tie-breaking.
///
/// Unfulfilled subscriptions get their remaining time scaled down by the
/// extended-latency factor, so between two equal-priority competitors the one
/// with unretrieved, soon-to-expire data wins. Lower adjusted remaining time
/// means a stronger claim.
pub fn effective_urgency_ms(subscription: &BandwidthSubscription, extended_latency_factor_percent: u32, now_ms: i64) -> i64 {
    let remaining = subscription.remaining_before_expiry_ms(now_ms);

    if subscription.fulfilled {
        return remaining;
    }

    return remaining * 100 / (100 + extended_latency_factor_percent as i64);
}

/// Compares the scheduling claims of two allocations for preemption.
///
/// `Ordering::Greater` means `a` holds the stronger claim: higher priority
/// first, then lower extended-latency-adjusted urgency, then the earlier
/// original schedule time (FIFO stability).
pub fn compare_claims(
    a: &AllocationBase,
    a_subscription: Option<&BandwidthSubscription>,
    b: &AllocationBase,
    b_subscription: Option<&BandwidthSubscription>,
    extended_latency_factor_percent: u32,
    now_ms: i64,
) -> Ordering {
    let by_priority = a.priority.cmp(&b.priority);
    if by_priority != Ordering::Equal {
        return by_priority;
    }

    // A missing snapshot cannot claim urgency. i64::MAX keeps it last.
    let a_urgency = a_subscription.map(|s| effective_urgency_ms(s, extended_latency_factor_percent, now_ms)).unwrap_or(i64::MAX);
    let b_urgency = b_subscription.map(|s| effective_urgency_ms(s, extended_latency_factor_percent, now_ms)).unwrap_or(i64::MAX);

    let by_urgency = b_urgency.cmp(&a_urgency);
    if by_urgency != Ordering::Equal {
        return by_urgency;
    }

    return b.schedule_time_ms.cmp(&a.schedule_time_ms);
}

/// A resident bumped out of its bucket to make room for a stronger claim.
#[derive(Debug, Clone)]
pub struct BumpedAllocation {
    pub id: AllocationId,
    pub from_bucket_ms: i64,
    /// Best-effort reassignment. `None` leaves the allocation deferred for
    /// the next schedule cycle.
    pub to_bucket_ms: Option<i64>,
    pub size_bytes: u64,
}

/// Staged outcome of placing one subscription's candidate allocations.
///
/// Computed against scratch capacity data under the network lock; nothing in
/// the live ledger changes until [`RetrievalPlan::apply`] runs, so a
/// persistence failure rolls the whole schedule call back by simply dropping
/// this value.
#[derive(Debug, Default)]
pub struct PlanChange {
    pub scheduled: Vec<(AllocationId, i64)>,
    pub deferred: Vec<AllocationId>,
    pub bumped: Vec<BumpedAllocation>,
}

impl PlanChange {
    pub fn is_fully_scheduled(&self) -> bool {
        self.deferred.is_empty()
    }

    pub fn is_fully_deferred(&self) -> bool {
        self.scheduled.is_empty()
    }
}

#[derive(Debug, Clone)]
struct ScratchBucket {
    capacity_bytes: u64,
    allocated_bytes: u64,
    /// Resident allocations still bumpable from this bucket.
    residents: Vec<(AllocationId, u64)>,
}

/// Rolling planning horizon of one network route: the ordered buckets
/// covering `[plan_start, plan_end)` plus the allocation-to-bucket index.
///
/// All mutating entry points run under the manager's per-network lock;
/// cross-network plans never share buckets and may proceed in parallel.
#[derive(Debug)]
pub struct RetrievalPlan {
    config: NetworkConfig,

    plan_start_ms: i64,
    plan_end_ms: i64,

    bucket_store: BucketStore,
    allocation_store: AllocationStore,
    subscription_store: SubscriptionStore,

    extended_latency_factor_percent: u32,
}

impl RetrievalPlan {
    pub fn new(
        config: NetworkConfig,
        bucket_store: BucketStore,
        allocation_store: AllocationStore,
        subscription_store: SubscriptionStore,
        extended_latency_factor_percent: u32,
        now_ms: i64,
    ) -> Self {
        let plan_start_ms = Self::truncate(now_ms.max(0), config.bucket_width_ms);
        let plan_end_ms = plan_start_ms + config.plan_horizon_ms;

        RetrievalPlan { config, plan_start_ms, plan_end_ms, bucket_store, allocation_store, subscription_store, extended_latency_factor_percent }
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    pub fn plan_start_ms(&self) -> i64 {
        self.plan_start_ms
    }

    pub fn plan_end_ms(&self) -> i64 {
        self.plan_end_ms
    }

    /// Aligns a point in time to the start of its bucket.
    ///
    /// **Note:** A negative input time will always yield bucket start 0.
    fn truncate(time_ms: i64, width_ms: i64) -> i64 {
        if time_ms < 0 {
            log::error!("Requested bucket start for a negative time: {}", time_ms);
            return 0;
        }

        return (time_ms / width_ms) * width_ms;
    }

    pub fn bucket_start_for(&self, time_ms: i64) -> i64 {
        Self::truncate(time_ms, self.config.bucket_width_ms)
    }

    /// Advances the rolling horizon: drops fully-past buckets without
    /// committed bytes and extends the far edge to `now + horizon`.
    pub fn advance(&mut self, now_ms: i64) {
        let new_start = self.bucket_start_for(now_ms.max(0));

        if new_start > self.plan_start_ms {
            self.bucket_store.purge_before(self.config.network, new_start);
            self.plan_start_ms = new_start;
        }

        self.plan_end_ms = new_start + self.config.plan_horizon_ms;
    }

    /// Bucket starts intersecting `[start_ms, end_ms)`, clamped to the
    /// current horizon and ordered ascending.
    fn candidate_bucket_starts(&self, start_ms: i64, end_ms: i64) -> Vec<i64> {
        let width = self.config.bucket_width_ms;

        let from = Self::truncate(start_ms.max(self.plan_start_ms), width);
        let to = end_ms.min(self.plan_end_ms);

        let mut starts = Vec::new();
        let mut cursor = from;

        while cursor < to {
            starts.push(cursor);
            cursor += width;
        }

        return starts;
    }

    fn scratch_bucket(&self, scratch: &mut HashMap<i64, ScratchBucket>, start_ms: i64) {
        if scratch.contains_key(&start_ms) {
            return;
        }

        let entry = match self.bucket_store.get_bucket(self.config.network, start_ms) {
            Some(bucket) => {
                let residents = bucket
                    .allocation_ids
                    .iter()
                    .filter_map(|id| {
                        let handle = self.allocation_store.get(*id)?;
                        let guard = handle.read().expect("RwLock poisoned");
                        // Only Scheduled residents are bumpable; Active ones
                        // already hold the agent.
                        (guard.status() == RetrievalStatus::Scheduled).then(|| (*id, guard.estimated_size_bytes()))
                    })
                    .collect();

                ScratchBucket { capacity_bytes: bucket.capacity_bytes, allocated_bytes: bucket.allocated_bytes, residents }
            }
            None => ScratchBucket { capacity_bytes: self.config.bucket_capacity_bytes(), allocated_bytes: 0, residents: Vec::new() },
        };

        scratch.insert(start_ms, entry);
    }

    fn claim_of(&self, id: AllocationId) -> Option<(AllocationBase, Option<BandwidthSubscription>)> {
        let handle = self.allocation_store.get(id)?;
        let base = handle.read().expect("RwLock poisoned").base().clone();
        let subscription = self.subscription_store.get(&base.subscription_name);
        Some((base, subscription))
    }

    /// Stages the placement of one subscription's candidate allocations.
    ///
    /// Each candidate commits whole into the first bucket of its window with
    /// room. If none has room, strictly weaker residents are bumped out of a
    /// candidate bucket until the candidate fits; bumped residents are
    /// re-placed best-effort into later buckets of their own window. A
    /// candidate that still does not fit is staged as deferred.
    pub fn stage_placements(&self, candidate_ids: &[AllocationId], now_ms: i64) -> PlanChange {
        let mut scratch: HashMap<i64, ScratchBucket> = HashMap::new();
        let mut change = PlanChange::default();

        for candidate_id in candidate_ids {
            let Some((candidate_base, candidate_subscription)) = self.claim_of(*candidate_id) else {
                log::error!("Placement requested for unknown allocation id {:?}.", candidate_id);
                continue;
            };

            let size = candidate_base.estimated_size_bytes;
            let starts = self.candidate_bucket_starts(candidate_base.start_time_ms, candidate_base.end_time_ms);

            if starts.is_empty() {
                log::warn!(
                    "Allocation window [{}, {}) of subscription {} lies outside the {} planning horizon.",
                    candidate_base.start_time_ms,
                    candidate_base.end_time_ms,
                    candidate_base.subscription_name,
                    self.config.network
                );
                change.deferred.push(*candidate_id);
                continue;
            }

            for start in &starts {
                self.scratch_bucket(&mut scratch, *start);
            }

            // First pass: plain capacity.
            let direct = starts.iter().copied().find(|start| {
                let bucket = &scratch[start];
                bucket.allocated_bytes + size <= bucket.capacity_bytes
            });

            if let Some(start) = direct {
                let bucket = scratch.get_mut(&start).expect("scratch bucket exists");
                bucket.allocated_bytes += size;
                change.scheduled.push((*candidate_id, start));
                continue;
            }

            // Second pass: preemption of strictly weaker residents.
            let preempted = self.try_preempt(
                &mut scratch,
                &starts,
                &candidate_base,
                candidate_subscription.as_ref(),
                now_ms,
            );

            match preempted {
                Some((start, bumped)) => {
                    let bucket = scratch.get_mut(&start).expect("scratch bucket exists");
                    bucket.allocated_bytes += size;
                    change.scheduled.push((*candidate_id, start));

                    for mut bump in bumped {
                        bump.to_bucket_ms = self.reflow_bumped(&mut scratch, &bump, start);
                        change.bumped.push(bump);
                    }
                }
                None => {
                    log::info!(
                        "No {} bucket admits allocation of subscription {} ({} bytes) even after preemption; deferring.",
                        self.config.network,
                        candidate_base.subscription_name,
                        size
                    );
                    change.deferred.push(*candidate_id);
                }
            }
        }

        return change;
    }

    /// Finds the first candidate bucket where bumping strictly weaker
    /// residents frees enough room, and stages those bumps in the scratch
    /// data. Weakest residents go first.
    fn try_preempt(
        &self,
        scratch: &mut HashMap<i64, ScratchBucket>,
        starts: &[i64],
        candidate_base: &AllocationBase,
        candidate_subscription: Option<&BandwidthSubscription>,
        now_ms: i64,
    ) -> Option<(i64, Vec<BumpedAllocation>)> {
        let size = candidate_base.estimated_size_bytes;

        for start in starts {
            let bucket = &scratch[start];

            let mut weaker: Vec<(AllocationId, u64)> = bucket
                .residents
                .iter()
                .filter(|(id, _)| {
                    self.claim_of(*id)
                        .map(|(base, subscription)| {
                            compare_claims(
                                candidate_base,
                                candidate_subscription,
                                &base,
                                subscription.as_ref(),
                                self.extended_latency_factor_percent,
                                now_ms,
                            ) == Ordering::Greater
                        })
                        .unwrap_or(false)
                })
                .copied()
                .collect();

            weaker.sort_by(|(a_id, _), (b_id, _)| {
                let a_claim = self.claim_of(*a_id);
                let b_claim = self.claim_of(*b_id);
                match (a_claim, b_claim) {
                    (Some((a_base, a_sub)), Some((b_base, b_sub))) => compare_claims(
                        &a_base,
                        a_sub.as_ref(),
                        &b_base,
                        b_sub.as_ref(),
                        self.extended_latency_factor_percent,
                        now_ms,
                    ),
                    _ => Ordering::Equal,
                }
            });

            let mut freed: u64 = 0;
            let mut bumped = Vec::new();

            for (id, resident_size) in weaker {
                if bucket.allocated_bytes - freed + size <= bucket.capacity_bytes {
                    break;
                }

                freed += resident_size;
                bumped.push(BumpedAllocation { id, from_bucket_ms: *start, to_bucket_ms: None, size_bytes: resident_size });
            }

            if bucket.allocated_bytes - freed + size <= bucket.capacity_bytes && !bumped.is_empty() {
                let bucket = scratch.get_mut(start).expect("scratch bucket exists");
                bucket.allocated_bytes -= freed;
                bucket.residents.retain(|(id, _)| bumped.iter().all(|b| b.id != *id));
                return Some((*start, bumped));
            }
        }

        return None;
    }

    /// Best-effort reassignment of a bumped resident into a later bucket of
    /// its own window. Capacity check only; bumping never cascades.
    fn reflow_bumped(&self, scratch: &mut HashMap<i64, ScratchBucket>, bump: &BumpedAllocation, after_ms: i64) -> Option<i64> {
        let (base, _) = self.claim_of(bump.id)?;

        let starts = self.candidate_bucket_starts(base.start_time_ms, base.end_time_ms);

        for start in starts {
            if start <= after_ms {
                continue;
            }

            self.scratch_bucket(scratch, start);
            let bucket = scratch.get_mut(&start).expect("scratch bucket exists");

            if bucket.allocated_bytes + bump.size_bytes <= bucket.capacity_bytes {
                bucket.allocated_bytes += bump.size_bytes;
                return Some(start);
            }
        }

        return None;
    }

    /// Applies a staged [`PlanChange`] to the live ledger and the allocation
    /// statuses. Runs under the same network lock that staged the change.
    pub fn apply(&self, change: &PlanChange) {
        let width = self.config.bucket_width_ms;
        let capacity = self.config.bucket_capacity_bytes();
        let network = self.config.network;

        for bump in &change.bumped {
            if let Some(mut bucket) = self.bucket_store.get_bucket(network, bump.from_bucket_ms) {
                bucket.remove_allocation(bump.id, bump.size_bytes);
                self.bucket_store.put_bucket(bucket);
            }

            self.allocation_store.set_status(bump.id, RetrievalStatus::Deferred);
            self.set_bucket_assignment(bump.id, None);

            if let Some(to) = bump.to_bucket_ms {
                let mut bucket = self.bucket_store.create_bucket(network, to, width, capacity);
                bucket.insert_allocation(bump.id, bump.size_bytes);
                self.bucket_store.put_bucket(bucket);

                self.allocation_store.set_status(bump.id, RetrievalStatus::Scheduled);
                self.set_bucket_assignment(bump.id, Some(to));
            }
        }

        for (id, start) in &change.scheduled {
            let size = self
                .allocation_store
                .get(*id)
                .map(|handle| handle.read().expect("RwLock poisoned").estimated_size_bytes())
                .unwrap_or(0);

            let mut bucket = self.bucket_store.create_bucket(network, *start, width, capacity);
            bucket.insert_allocation(*id, size);
            self.bucket_store.put_bucket(bucket);

            self.allocation_store.set_status(*id, RetrievalStatus::Scheduled);
            self.set_bucket_assignment(*id, Some(*start));
        }

        for id in &change.deferred {
            self.allocation_store.set_status(*id, RetrievalStatus::Deferred);
            self.set_bucket_assignment(*id, None);
        }
    }

    fn set_bucket_assignment(&self, id: AllocationId, bucket_start_ms: Option<i64>) {
        if let Some(handle) = self.allocation_store.get(id) {
            handle.write().expect("RwLock poisoned").base_mut().bucket_start_ms = bucket_start_ms;
        }
    }

    /// Releases an allocation's committed bytes back to its bucket, if it
    /// holds any. The caller decides the follow-up status.
    pub fn release_from_bucket(&self, id: AllocationId) {
        let Some(handle) = self.allocation_store.get(id) else {
            return;
        };

        let (bucket_start, size) = {
            let guard = handle.read().expect("RwLock poisoned");
            (guard.bucket_start_ms(), guard.estimated_size_bytes())
        };

        if let Some(start) = bucket_start {
            if let Some(mut bucket) = self.bucket_store.get_bucket(self.config.network, start) {
                bucket.remove_allocation(id, size);
                self.bucket_store.put_bucket(bucket);
            }

            handle.write().expect("RwLock poisoned").base_mut().bucket_start_ms = None;
        }
    }

    /// Ids of all `Scheduled` allocations sitting in buckets whose start time
    /// has arrived.
    pub fn due_scheduled(&self, now_ms: i64) -> Vec<AllocationId> {
        let mut due = Vec::new();

        for bucket in self.bucket_store.list_buckets(self.config.network, i64::MIN, now_ms + 1) {
            for id in bucket.allocation_ids {
                if self.allocation_store.get_status(id) == Some(RetrievalStatus::Scheduled) {
                    due.push(id);
                }
            }
        }

        return due;
    }

    /// (capacity, allocated) bytes summed over the live horizon.
    pub fn bandwidth_usage(&self) -> (u64, u64) {
        self.bucket_store.usage(self.config.network, self.plan_start_ms, self.plan_end_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bandwidth::allocation::RetrievalPriority;
    use crate::utils::id::{DataSetName, OwnerName, ProviderName, SubscriptionName};
    use uuid::Uuid;

    fn snapshot(name: &str, expiry_ms: i64, fulfilled: bool) -> BandwidthSubscription {
        BandwidthSubscription {
            registry_id: Uuid::new_v4(),
            name: SubscriptionName::new(name),
            owner: OwnerName::new("owner"),
            provider: ProviderName::new("provider"),
            dataset_name: DataSetName::new("dataset"),
            network: Network::Opsnet,
            priority: RetrievalPriority::Normal,
            estimated_size_bytes: 100,
            base_reference_time_ms: 0,
            data_expiry_time_ms: expiry_ms,
            latency_ms: 60_000,
            fulfilled,
        }
    }

    fn base(name: &str, priority: RetrievalPriority, schedule_time_ms: i64) -> AllocationBase {
        AllocationBase {
            subscription_name: SubscriptionName::new(name),
            network: Network::Opsnet,
            priority,
            status: RetrievalStatus::Processing,
            start_time_ms: 0,
            end_time_ms: 3_600_000,
            estimated_size_bytes: 100,
            actual_size_bytes: None,
            schedule_time_ms,
            bucket_start_ms: None,
        }
    }

    #[test]
    fn higher_priority_wins_regardless_of_urgency() {
        let a = base("a", RetrievalPriority::High, 10);
        let b = base("b", RetrievalPriority::Low, 0);
        let a_sub = snapshot("a", i64::MAX / 2, true);
        let b_sub = snapshot("b", 1, false);

        assert_eq!(compare_claims(&a, Some(&a_sub), &b, Some(&b_sub), 50, 0), Ordering::Greater);
    }

    #[test]
    fn extended_latency_factor_scales_urgency_on_ties() {
        const HOUR: i64 = 3_600_000;

        let a = base("a", RetrievalPriority::Normal, 0);
        let b = base("b", RetrievalPriority::Normal, 0);

        // Unfulfilled with 2h remaining versus fulfilled with 4h remaining:
        // 2h * 100/150 = 80min beats 4h.
        let a_sub = snapshot("a", 2 * HOUR, false);
        let b_sub = snapshot("b", 4 * HOUR, true);

        assert_eq!(compare_claims(&a, Some(&a_sub), &b, Some(&b_sub), 50, 0), Ordering::Greater);

        // The factor can even outweigh a longer remaining window: 6h01m
        // unfulfilled adjusts to just under 4h01m, beating a fulfilled
        // subscription with 4h01m left.
        let c = base("c", RetrievalPriority::Normal, 0);
        let c_sub = snapshot("c", 6 * HOUR + 60_000, false);
        let d = base("d", RetrievalPriority::Normal, 0);
        let d_sub = snapshot("d", 4 * HOUR + 50_000, true);

        assert_eq!(compare_claims(&c, Some(&c_sub), &d, Some(&d_sub), 50, 0), Ordering::Greater);
    }

    #[test]
    fn equal_claims_fall_back_to_fifo() {
        let a = base("a", RetrievalPriority::Normal, 100);
        let b = base("b", RetrievalPriority::Normal, 200);
        let a_sub = snapshot("a", 1_000_000, true);
        let b_sub = snapshot("b", 1_000_000, true);

        assert_eq!(compare_claims(&a, Some(&a_sub), &b, Some(&b_sub), 50, 0), Ordering::Greater);
        assert_eq!(compare_claims(&b, Some(&b_sub), &a, Some(&a_sub), 50, 0), Ordering::Less);
    }
}
