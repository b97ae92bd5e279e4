use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::bandwidth::allocation::{AllocationBase, RetrievalStatus, SubscriptionRetrieval};
use crate::domain::bandwidth::registry::DataSetRegistry;
use crate::domain::bandwidth::subscription::BandwidthSubscription;
use crate::utils::id::SubscriptionName;

/// Strategy converting subscription snapshots into the allocations that will
/// carry their retrievals, and mapping completed retrievals back to the
/// subscriptions ready for notification.
pub trait SubscriptionAggregator: std::fmt::Debug + Send + Sync {
    /// Produces the candidate allocations for freshly snapshotted
    /// subscriptions. Must never block scheduling: lookup failures degrade to
    /// defaults instead of erroring.
    fn aggregate(&self, snapshots: &[BandwidthSubscription], now_ms: i64) -> Vec<SubscriptionRetrieval>;

    /// Called once all allocations tied to a subscription completed.
    ///
    /// # Returns
    /// The names of the subscriptions whose data is now fully retrieved and
    /// ready for user notification.
    fn complete_retrieval(&self, retrievals: &[SubscriptionRetrieval]) -> Vec<SubscriptionName>;
}

/// Average availability offset of the data set, asked of the registry.
///
/// Fails softly: a lookup error is logged and the offset defaults to 0 so a
/// registry hiccup never blocks scheduling.
fn availability_delay_ms(registry: &dyn DataSetRegistry, snapshot: &BandwidthSubscription) -> i64 {
    match registry.get_by_dataset(&snapshot.dataset_name, &snapshot.provider) {
        Ok(records) if !records.is_empty() => {
            let sum: i64 = records.iter().map(|record| record.availability_offset_ms).sum();
            sum / records.len() as i64
        }
        Ok(_) => 0,
        Err(e) => {
            log::warn!(
                "Availability-offset lookup failed for data set {} at {}: {}. Defaulting offset to 0.",
                snapshot.dataset_name,
                snapshot.provider,
                e
            );
            0
        }
    }
}

/// Latency tolerance for the retrieval window, extended by the configured
/// factor for subscriptions nearing expiry without fulfilled data.
fn effective_latency_ms(snapshot: &BandwidthSubscription, extended_latency_factor_percent: u32, now_ms: i64) -> i64 {
    let extended = snapshot.latency_ms * (100 + extended_latency_factor_percent as i64) / 100;

    if !snapshot.fulfilled && snapshot.remaining_before_expiry_ms(now_ms) <= extended {
        return extended;
    }

    return snapshot.latency_ms;
}

fn retrieval_for(snapshot: &BandwidthSubscription, registry: &dyn DataSetRegistry, factor: u32, now_ms: i64) -> SubscriptionRetrieval {
    let delay = availability_delay_ms(registry, snapshot);
    let latency = effective_latency_ms(snapshot, factor, now_ms);

    let start_time_ms = snapshot.base_reference_time_ms + delay;
    let end_time_ms = start_time_ms + latency;

    SubscriptionRetrieval {
        base: AllocationBase {
            subscription_name: snapshot.name.clone(),
            network: snapshot.network,
            priority: snapshot.priority,
            status: RetrievalStatus::Processing,
            start_time_ms,
            end_time_ms,
            estimated_size_bytes: snapshot.estimated_size_bytes,
            actual_size_bytes: None,
            schedule_time_ms: now_ms,
            bucket_start_ms: None,
        },
        subscription_latency_ms: latency,
        dataset_availability_delay_ms: delay,
    }
}

/// Non-aggregating strategy: exactly one retrieval per subscription snapshot.
#[derive(Debug)]
pub struct SimpleSubscriptionAggregator {
    registry: Arc<dyn DataSetRegistry>,
    extended_latency_factor_percent: u32,
}

impl SimpleSubscriptionAggregator {
    pub fn new(registry: Arc<dyn DataSetRegistry>, extended_latency_factor_percent: u32) -> Self {
        Self { registry, extended_latency_factor_percent }
    }
}

impl SubscriptionAggregator for SimpleSubscriptionAggregator {
    fn aggregate(&self, snapshots: &[BandwidthSubscription], now_ms: i64) -> Vec<SubscriptionRetrieval> {
        snapshots
            .iter()
            .map(|snapshot| retrieval_for(snapshot, self.registry.as_ref(), self.extended_latency_factor_percent, now_ms))
            .collect()
    }

    fn complete_retrieval(&self, retrievals: &[SubscriptionRetrieval]) -> Vec<SubscriptionName> {
        // 1:1 cardinality: every completed retrieval fulfills its own subscription.
        let mut names: Vec<SubscriptionName> = retrievals.iter().map(|retrieval| retrieval.base.subscription_name.clone()).collect();
        names.dedup();
        names
    }
}

/// Combining strategy: subscriptions sharing (provider, data set, network)
/// ride on a single retrieval sized for the largest member.
#[derive(Debug)]
pub struct SharedSubscriptionAggregator {
    registry: Arc<dyn DataSetRegistry>,
    extended_latency_factor_percent: u32,

    /// Members riding on each emitted retrieval, keyed by the owning
    /// subscription name.
    members: Arc<RwLock<HashMap<SubscriptionName, Vec<SubscriptionName>>>>,
}

impl SharedSubscriptionAggregator {
    pub fn new(registry: Arc<dyn DataSetRegistry>, extended_latency_factor_percent: u32) -> Self {
        Self { registry, extended_latency_factor_percent, members: Arc::new(RwLock::new(HashMap::new())) }
    }
}

impl SubscriptionAggregator for SharedSubscriptionAggregator {
    fn aggregate(&self, snapshots: &[BandwidthSubscription], now_ms: i64) -> Vec<SubscriptionRetrieval> {
        let mut groups: HashMap<(String, String, String), Vec<&BandwidthSubscription>> = HashMap::new();

        for snapshot in snapshots {
            let key = (snapshot.provider.to_string(), snapshot.dataset_name.to_string(), snapshot.network.to_string());
            groups.entry(key).or_default().push(snapshot);
        }

        let mut retrievals = Vec::new();
        let mut members = self.members.write().expect("RwLock poisoned");

        for group in groups.values() {
            // The earliest-expiring member owns the shared retrieval.
            let Some(owner) = group.iter().min_by_key(|snapshot| snapshot.data_expiry_time_ms) else {
                continue;
            };

            let mut retrieval = retrieval_for(owner, self.registry.as_ref(), self.extended_latency_factor_percent, now_ms);
            retrieval.base.estimated_size_bytes = group.iter().map(|snapshot| snapshot.estimated_size_bytes).max().unwrap_or(0);

            members.insert(owner.name.clone(), group.iter().map(|snapshot| snapshot.name.clone()).collect());
            retrievals.push(retrieval);
        }

        retrievals
    }

    fn complete_retrieval(&self, retrievals: &[SubscriptionRetrieval]) -> Vec<SubscriptionName> {
        let mut members = self.members.write().expect("RwLock poisoned");
        let mut names = Vec::new();

        // Completed groups leave the map; the next aggregation round builds
        // them afresh.
        for retrieval in retrievals {
            match members.remove(&retrieval.base.subscription_name) {
                Some(group) => names.extend(group),
                None => names.push(retrieval.base.subscription_name.clone()),
            }
        }

        names.dedup();
        names
    }
}
