use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bandwidth_scheduler::domain::bandwidth::agent::{RetrievalAgent, RetrievalOutcome};
use bandwidth_scheduler::domain::bandwidth::aggregator::{SharedSubscriptionAggregator, SimpleSubscriptionAggregator};
use bandwidth_scheduler::domain::bandwidth::allocation::{RetrievalPriority, RetrievalStatus, SubscriptionRetrieval};
use bandwidth_scheduler::domain::bandwidth::config::{NetworkConfig, SchedulerConfig};
use bandwidth_scheduler::domain::bandwidth::dispatch::RetrievalDispatcher;
use bandwidth_scheduler::domain::bandwidth::manager::BandwidthManager;
use bandwidth_scheduler::domain::bandwidth::network::Network;
use bandwidth_scheduler::domain::bandwidth::notification::NotificationService;
use bandwidth_scheduler::domain::bandwidth::persistence::{BandwidthDao, InMemoryBandwidthDao};
use bandwidth_scheduler::domain::bandwidth::registry::{DataSetMetaData, DataSetRegistry};
use bandwidth_scheduler::domain::bandwidth::subscription::Subscription;
use bandwidth_scheduler::domain::clock::{SharedClock, SystemClock};
use bandwidth_scheduler::error::{Error, Result};
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

/// Agent recording every performed retrieval; fails on demand.
#[derive(Debug)]
struct RecordingAgent {
    performed: Mutex<Vec<SubscriptionName>>,
    fail: bool,
    actual_size_bytes: Option<u64>,
}

impl RecordingAgent {
    fn succeeding(actual_size_bytes: Option<u64>) -> Arc<Self> {
        Arc::new(RecordingAgent { performed: Mutex::new(Vec::new()), fail: false, actual_size_bytes })
    }

    fn failing() -> Arc<Self> {
        Arc::new(RecordingAgent { performed: Mutex::new(Vec::new()), fail: true, actual_size_bytes: None })
    }

    fn performed(&self) -> Vec<SubscriptionName> {
        self.performed.lock().expect("Mutex poisoned").clone()
    }
}

impl RetrievalAgent for RecordingAgent {
    fn perform(&self, retrieval: &SubscriptionRetrieval) -> Result<RetrievalOutcome> {
        self.performed.lock().expect("Mutex poisoned").push(retrieval.base.subscription_name.clone());

        if self.fail {
            return Err(Error::Retrieval("provider closed the connection".to_string()));
        }

        Ok(RetrievalOutcome { actual_size_bytes: self.actual_size_bytes })
    }
}

#[derive(Debug, Default)]
struct RecordingNotifier {
    notified: RwLock<Vec<SubscriptionName>>,
}

impl RecordingNotifier {
    fn notified(&self) -> Vec<SubscriptionName> {
        self.notified.read().expect("RwLock poisoned").clone()
    }
}

impl NotificationService for RecordingNotifier {
    fn notify(&self, subscription: &SubscriptionName, _owner: &OwnerName, _message: &str, _priority: RetrievalPriority, _timestamp_ms: i64) {
        self.notified.write().expect("RwLock poisoned").push(subscription.clone());
    }
}

fn config() -> SchedulerConfig {
    let opsnet = NetworkConfig { network: Network::Opsnet, bucket_width_ms: WIDTH_MS, bytes_per_second: 100, plan_horizon_ms: 6 * HOUR_MS };
    SchedulerConfig::from_networks(vec![opsnet], 50)
}

fn manager_with(clock: &MockClock, dao: Arc<dyn BandwidthDao>) -> Arc<BandwidthManager> {
    let registry = Arc::new(OpenRegistry);
    let aggregator = Arc::new(SimpleSubscriptionAggregator::new(registry.clone(), 50));

    Arc::new(BandwidthManager::new(config(), aggregator, registry, dao, clock.clone_box()))
}

fn subscription(name: &str, base_reference_time_ms: i64) -> Subscription {
    Subscription {
        name: SubscriptionName::new(name),
        owner: OwnerName::new("ops"),
        provider: ProviderName::new("nomads"),
        dataset_name: DataSetName::new("gfs-global"),
        route: Some(Network::Opsnet),
        priority: RetrievalPriority::Normal,
        dataset_size_bytes: 3600,
        latency_minutes: 2,
        active: true,
        base_reference_time_ms,
        data_expiry_time_ms: base_reference_time_ms + 4 * HOUR_MS,
    }
}

#[test]
fn due_retrieval_is_dispatched_completed_and_notified() {
    let clock = MockClock::at(0);
    let manager = manager_with(&clock, Arc::new(InMemoryBandwidthDao::new()));
    let agent = RecordingAgent::succeeding(Some(4000));
    let notifier = Arc::new(RecordingNotifier::default());

    let sub = subscription("gfs-austria", 0);
    manager.schedule(&sub).expect("schedule succeeds");

    let dispatcher = RetrievalDispatcher::new(manager.clone(), agent.clone(), notifier.clone());
    let report = dispatcher.run_cycle();

    assert_eq!(report.dispatched, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(report.fulfilled_subscriptions, 1);
    assert_eq!(agent.performed(), vec![sub.name.clone()]);
    assert_eq!(notifier.notified(), vec![sub.name.clone()]);

    let dependencies = manager.get_subscription_dependencies(&sub.name);
    assert_eq!(dependencies[0].base.status, RetrievalStatus::Completed);
    // Estimated size reconciled with what the agent actually transferred.
    assert_eq!(dependencies[0].base.actual_size_bytes, Some(4000));

    // Terminal allocations no longer hold admission capacity.
    let bandwidth = manager.get_bandwidth_for_route(Network::Opsnet).expect("route is configured");
    assert_eq!(bandwidth.allocated_bytes, 0);
}

#[test]
fn retrieval_waits_for_its_bucket_start() {
    let clock = MockClock::at(0);
    let manager = manager_with(&clock, Arc::new(InMemoryBandwidthDao::new()));
    let agent = RecordingAgent::succeeding(None);
    let notifier = Arc::new(RecordingNotifier::default());

    // Window starts two buckets in the future.
    manager.schedule(&subscription("later", 2 * WIDTH_MS)).expect("schedule succeeds");

    let dispatcher = RetrievalDispatcher::new(manager.clone(), agent.clone(), notifier.clone());

    assert_eq!(dispatcher.run_cycle().dispatched, 0);

    clock.set(2 * WIDTH_MS);
    assert_eq!(dispatcher.run_cycle().dispatched, 1);
}

#[test]
fn failed_retrieval_is_not_retried_and_never_notifies() {
    let clock = MockClock::at(0);
    let manager = manager_with(&clock, Arc::new(InMemoryBandwidthDao::new()));
    let agent = RecordingAgent::failing();
    let notifier = Arc::new(RecordingNotifier::default());

    let sub = subscription("gfs-austria", 0);
    manager.schedule(&sub).expect("schedule succeeds");

    let dispatcher = RetrievalDispatcher::new(manager.clone(), agent.clone(), notifier.clone());
    let report = dispatcher.run_cycle();

    assert_eq!(report.failed, 1);
    assert_eq!(report.fulfilled_subscriptions, 0);
    assert!(notifier.notified().is_empty());
    assert_eq!(manager.get_subscription_dependencies(&sub.name)[0].base.status, RetrievalStatus::Failed);

    // The dispatcher does not loop on failures; retry belongs to the next
    // natural schedule cycle.
    assert_eq!(dispatcher.run_cycle().dispatched, 0);
    assert_eq!(agent.performed().len(), 1);
}

#[test]
fn fulfillment_notification_fires_exactly_once() {
    let clock = MockClock::at(0);
    let manager = manager_with(&clock, Arc::new(InMemoryBandwidthDao::new()));
    let agent = RecordingAgent::succeeding(None);
    let notifier = Arc::new(RecordingNotifier::default());

    manager.schedule(&subscription("gfs-austria", 0)).expect("schedule succeeds");

    let dispatcher = RetrievalDispatcher::new(manager.clone(), agent.clone(), notifier.clone());
    dispatcher.run_cycle();
    dispatcher.run_cycle();
    dispatcher.run_cycle();

    assert_eq!(notifier.notified().len(), 1);
}

#[test]
fn cancelled_subscription_is_never_dispatched() {
    let clock = MockClock::at(0);
    let manager = manager_with(&clock, Arc::new(InMemoryBandwidthDao::new()));
    let agent = RecordingAgent::succeeding(None);
    let notifier = Arc::new(RecordingNotifier::default());

    let sub = subscription("gfs-austria", 0);
    manager.schedule(&sub).expect("schedule succeeds");
    manager.unschedule(&sub.name).expect("unschedule succeeds");

    let dispatcher = RetrievalDispatcher::new(manager.clone(), agent.clone(), notifier.clone());
    let report = dispatcher.run_cycle();

    assert_eq!(report.dispatched, 0);
    assert!(agent.performed().is_empty());
}

#[test]
fn shared_retrieval_notifies_every_member_subscription() {
    let clock = MockClock::at(0);
    let registry = Arc::new(OpenRegistry);
    let aggregator = Arc::new(SharedSubscriptionAggregator::new(registry.clone(), 50));
    let manager = Arc::new(BandwidthManager::new(config(), aggregator, registry, Arc::new(InMemoryBandwidthDao::new()), clock.clone_box()));

    // Same provider, data set and route: one retrieval carries both.
    let a = subscription("member-a", 0);
    let b = subscription("member-b", 0);

    let result = manager.schedule_all(&[a.clone(), b.clone()]).expect("batch schedule succeeds");
    assert!(result.scheduled.contains(&a.name));
    assert!(result.scheduled.contains(&b.name));

    let bandwidth = manager.get_bandwidth_for_route(Network::Opsnet).expect("route is configured");
    assert_eq!(bandwidth.allocated_bytes, 3600);

    let agent = RecordingAgent::succeeding(None);
    let notifier = Arc::new(RecordingNotifier::default());
    let dispatcher = RetrievalDispatcher::new(manager.clone(), agent.clone(), notifier.clone());

    let report = dispatcher.run_cycle();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(report.fulfilled_subscriptions, 2);

    // Both members get their own notification, exactly once.
    let notified = notifier.notified();
    assert_eq!(notified.len(), 2);
    assert!(notified.contains(&a.name));
    assert!(notified.contains(&b.name));

    assert_eq!(dispatcher.run_cycle().fulfilled_subscriptions, 0);
}

#[test]
fn scheduling_state_survives_a_restart() {
    let clock = MockClock::at(0);
    let dao: Arc<dyn BandwidthDao> = Arc::new(InMemoryBandwidthDao::new());

    let sub = subscription("gfs-austria", 0);

    {
        let manager = manager_with(&clock, dao.clone());
        manager.schedule(&sub).expect("schedule succeeds");
    }

    // Fresh process: rebuild from the DAO.
    let registry = Arc::new(OpenRegistry);
    let aggregator = Arc::new(SimpleSubscriptionAggregator::new(registry.clone(), 50));
    let manager =
        Arc::new(BandwidthManager::from_persisted(config(), aggregator, registry, dao, clock.clone_box()).expect("recovery succeeds"));

    let dependencies = manager.get_subscription_dependencies(&sub.name);
    assert_eq!(dependencies.len(), 1);
    assert_eq!(dependencies[0].base.status, RetrievalStatus::Scheduled);

    let bandwidth = manager.get_bandwidth_for_route(Network::Opsnet).expect("route is configured");
    assert_eq!(bandwidth.allocated_bytes, 3600);

    // The recovered allocation dispatches normally.
    let agent = RecordingAgent::succeeding(None);
    let notifier = Arc::new(RecordingNotifier::default());
    let dispatcher = RetrievalDispatcher::new(manager, agent, notifier.clone());

    assert_eq!(dispatcher.run_cycle().completed, 1);
    assert_eq!(notifier.notified(), vec![sub.name]);
}
