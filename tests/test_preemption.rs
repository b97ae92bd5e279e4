use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use bandwidth_scheduler::domain::bandwidth::aggregator::SimpleSubscriptionAggregator;
use bandwidth_scheduler::domain::bandwidth::allocation::{RetrievalPriority, RetrievalStatus};
use bandwidth_scheduler::domain::bandwidth::config::{NetworkConfig, SchedulerConfig};
use bandwidth_scheduler::domain::bandwidth::manager::BandwidthManager;
use bandwidth_scheduler::domain::bandwidth::network::Network;
use bandwidth_scheduler::domain::bandwidth::persistence::InMemoryBandwidthDao;
use bandwidth_scheduler::domain::bandwidth::registry::{DataSetMetaData, DataSetRegistry};
use bandwidth_scheduler::domain::bandwidth::subscription::Subscription;
use bandwidth_scheduler::domain::clock::{SharedClock, SystemClock};
use bandwidth_scheduler::error::Result;
use bandwidth_scheduler::utils::id::{DataSetName, OwnerName, ProviderName, SubscriptionName};

const WIDTH_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;

#[derive(Debug, Clone)]
struct MockClock {
    now_ms: Arc<AtomicI64>,
}

impl MockClock {
    fn at(now_ms: i64) -> Self {
        MockClock { now_ms: Arc::new(AtomicI64::new(now_ms)) }
    }

    fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl SystemClock for MockClock {
    fn now_millis(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn clone_box(&self) -> SharedClock {
        SharedClock(Arc::new(self.clone()))
    }
}

#[derive(Debug, Clone)]
struct OpenRegistry;

impl DataSetRegistry for OpenRegistry {
    fn get_by_dataset(&self, name: &DataSetName, provider: &ProviderName) -> Result<Vec<DataSetMetaData>> {
        Ok(vec![DataSetMetaData { dataset_name: name.clone(), provider: provider.clone(), availability_offset_ms: 0 }])
    }

    fn get_subscription(&self, _name: &SubscriptionName) -> Result<Option<Subscription>> {
        Ok(None)
    }
}

fn manager_at(clock: &MockClock) -> BandwidthManager {
    // Capacity per bucket: 100 bytes/s x 60s = 6000 bytes.
    let opsnet = NetworkConfig { network: Network::Opsnet, bucket_width_ms: WIDTH_MS, bytes_per_second: 100, plan_horizon_ms: 6 * HOUR_MS };
    let config = SchedulerConfig::from_networks(vec![opsnet], 50);

    let registry = Arc::new(OpenRegistry);
    let aggregator = Arc::new(SimpleSubscriptionAggregator::new(registry.clone(), 50));

    BandwidthManager::new(config, aggregator, registry, Arc::new(InMemoryBandwidthDao::new()), clock.clone_box())
}

/// Subscription whose retrieval window covers exactly `buckets` buckets
/// starting at bucket 0.
fn subscription(name: &str, priority: RetrievalPriority, size: u64, expiry_ms: i64, buckets: i64) -> Subscription {
    Subscription {
        name: SubscriptionName::new(name),
        owner: OwnerName::new("ops"),
        provider: ProviderName::new("nomads"),
        dataset_name: DataSetName::new("gfs-global"),
        route: Some(Network::Opsnet),
        priority,
        dataset_size_bytes: size,
        latency_minutes: buckets,
        active: true,
        base_reference_time_ms: 0,
        data_expiry_time_ms: expiry_ms,
    }
}

fn status_of(manager: &BandwidthManager, name: &str) -> RetrievalStatus {
    let dependencies = manager.get_subscription_dependencies(&SubscriptionName::new(name));
    assert_eq!(dependencies.len(), 1);
    dependencies[0].base.status
}

fn bucket_of(manager: &BandwidthManager, name: &str) -> Option<i64> {
    let dependencies = manager.get_subscription_dependencies(&SubscriptionName::new(name));
    dependencies[0].base.bucket_start_ms
}

#[test]
fn higher_priority_wins_when_scheduled_first() {
    let clock = MockClock::at(0);
    let manager = manager_at(&clock);

    // Both need 3600 of the bucket's 6000 bytes; only one fits.
    manager.schedule(&subscription("x-high", RetrievalPriority::High, 3600, 4 * HOUR_MS, 1)).expect("schedule X");
    let result = manager.schedule(&subscription("y-low", RetrievalPriority::Low, 3600, 4 * HOUR_MS, 1)).expect("schedule Y");

    assert!(result.unscheduled.contains(&SubscriptionName::new("y-low")));
    assert_eq!(status_of(&manager, "x-high"), RetrievalStatus::Scheduled);
    assert_eq!(status_of(&manager, "y-low"), RetrievalStatus::Deferred);
}

#[test]
fn higher_priority_preempts_when_scheduled_second() {
    let clock = MockClock::at(0);
    let manager = manager_at(&clock);

    manager.schedule(&subscription("y-low", RetrievalPriority::Low, 3600, 4 * HOUR_MS, 1)).expect("schedule Y");
    assert_eq!(status_of(&manager, "y-low"), RetrievalStatus::Scheduled);

    let result = manager.schedule(&subscription("x-high", RetrievalPriority::High, 3600, 4 * HOUR_MS, 1)).expect("schedule X");

    // Preemption reorders: X ends scheduled in the contested bucket and Y is
    // bumped to deferred (its single-bucket window leaves no later room).
    assert!(result.scheduled.contains(&SubscriptionName::new("x-high")));
    assert_eq!(status_of(&manager, "x-high"), RetrievalStatus::Scheduled);
    assert_eq!(bucket_of(&manager, "x-high"), Some(0));
    assert_eq!(status_of(&manager, "y-low"), RetrievalStatus::Deferred);

    // Bumping Y released its bytes, so only X counts against the route.
    let bandwidth = manager.get_bandwidth_for_route(Network::Opsnet).expect("route is configured");
    assert_eq!(bandwidth.allocated_bytes, 3600);
}

#[test]
fn bumped_allocation_reflows_into_a_later_bucket() {
    let clock = MockClock::at(0);
    let manager = manager_at(&clock);

    // Y's window spans two buckets, so it can be pushed from bucket 0 to 1.
    manager.schedule(&subscription("y-low", RetrievalPriority::Low, 3600, 4 * HOUR_MS, 2)).expect("schedule Y");
    assert_eq!(bucket_of(&manager, "y-low"), Some(0));

    manager.schedule(&subscription("x-high", RetrievalPriority::High, 3600, 4 * HOUR_MS, 1)).expect("schedule X");

    assert_eq!(bucket_of(&manager, "x-high"), Some(0));
    assert_eq!(status_of(&manager, "y-low"), RetrievalStatus::Scheduled);
    assert_eq!(bucket_of(&manager, "y-low"), Some(WIDTH_MS));

    let bandwidth = manager.get_bandwidth_for_route(Network::Opsnet).expect("route is configured");
    assert_eq!(bandwidth.allocated_bytes, 7200);
    assert!(bandwidth.allocated_bytes <= bandwidth.capacity_bytes);
}

#[test]
fn equal_priority_ties_break_on_adjusted_urgency() {
    let clock = MockClock::at(0);
    let manager = manager_at(&clock);

    // Same priority, but the later arrival expires in 2h versus 4h. Its
    // extended-latency-adjusted urgency is smaller, so it wins the bucket.
    manager.schedule(&subscription("relaxed", RetrievalPriority::Normal, 3600, 4 * HOUR_MS, 1)).expect("schedule relaxed");
    manager.schedule(&subscription("urgent", RetrievalPriority::Normal, 3600, 2 * HOUR_MS, 1)).expect("schedule urgent");

    assert_eq!(status_of(&manager, "urgent"), RetrievalStatus::Scheduled);
    assert_eq!(bucket_of(&manager, "urgent"), Some(0));
    assert_eq!(status_of(&manager, "relaxed"), RetrievalStatus::Deferred);
}

#[test]
fn equal_urgency_keeps_fifo_order() {
    let clock = MockClock::at(0);
    let manager = manager_at(&clock);

    manager.schedule(&subscription("first", RetrievalPriority::Normal, 3600, 4 * HOUR_MS, 1)).expect("schedule first");

    // Identical claim arriving later must not displace the earlier one.
    clock.set(1_000);
    manager.schedule(&subscription("second", RetrievalPriority::Normal, 3600, 4 * HOUR_MS, 1)).expect("schedule second");

    assert_eq!(status_of(&manager, "first"), RetrievalStatus::Scheduled);
    assert_eq!(status_of(&manager, "second"), RetrievalStatus::Deferred);
}
