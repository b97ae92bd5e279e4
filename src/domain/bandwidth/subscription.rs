use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::bandwidth::allocation::RetrievalPriority;
use crate::domain::bandwidth::network::Network;
use crate::utils::id::{DataSetName, OwnerName, ProviderName, SubscriptionName};

/// Registry-side subscription definition, as handed to `schedule()`.
///
/// The registry itself is an external collaborator; this is the slice of a
/// subscription record the scheduler needs to admit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub name: SubscriptionName,
    pub owner: OwnerName,
    pub provider: ProviderName,
    pub dataset_name: DataSetName,

    /// Route the subscription is assigned to. Scheduling a subscription
    /// without a route is a validation error.
    pub route: Option<Network>,

    pub priority: RetrievalPriority,

    /// Expected size of one retrieval for this subscription, in bytes.
    pub dataset_size_bytes: u64,

    /// How long past availability the subscriber tolerates waiting, in minutes.
    pub latency_minutes: i64,

    pub active: bool,

    /// Reference time (epoch ms) of the data cycle being retrieved.
    pub base_reference_time_ms: i64,

    /// Time (epoch ms) after which the subscribed data is no longer useful.
    pub data_expiry_time_ms: i64,
}

/// Denormalized snapshot of a [`Subscription`] taken at the moment bandwidth
/// was reserved for it.
///
/// Snapshots are superseded, never mutated: when the subscription definition
/// changes, the old snapshot's allocations are unscheduled and a fresh
/// snapshot is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthSubscription {
    /// Registry id of this snapshot.
    pub registry_id: Uuid,

    pub name: SubscriptionName,
    pub owner: OwnerName,
    pub provider: ProviderName,
    pub dataset_name: DataSetName,

    pub network: Network,
    pub priority: RetrievalPriority,

    pub estimated_size_bytes: u64,

    pub base_reference_time_ms: i64,
    pub data_expiry_time_ms: i64,

    /// Subscriber latency tolerance, in milliseconds.
    pub latency_ms: i64,

    /// Set once all of the snapshot's allocations completed and the
    /// aggregator's completion hook ran. Guards exactly-once notification.
    pub fulfilled: bool,
}

impl BandwidthSubscription {
    /// Builds a fresh snapshot for a validated subscription. The caller has
    /// already checked that a route is assigned.
    pub fn snapshot_of(subscription: &Subscription, network: Network) -> Self {
        BandwidthSubscription {
            registry_id: Uuid::new_v4(),
            name: subscription.name.clone(),
            owner: subscription.owner.clone(),
            provider: subscription.provider.clone(),
            dataset_name: subscription.dataset_name.clone(),
            network,
            priority: subscription.priority,
            estimated_size_bytes: subscription.dataset_size_bytes,
            base_reference_time_ms: subscription.base_reference_time_ms,
            data_expiry_time_ms: subscription.data_expiry_time_ms,
            latency_ms: subscription.latency_minutes * 60_000,
            fulfilled: false,
        }
    }

    /// Milliseconds left before the subscribed data expires. Negative once
    /// the expiry has passed.
    pub fn remaining_before_expiry_ms(&self, now_ms: i64) -> i64 {
        self.data_expiry_time_ms - now_ms
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    snapshots: HashMap<SubscriptionName, BandwidthSubscription>,
}

/// Shared store of the live subscription snapshots, keyed by name. Exactly
/// one snapshot per subscription name is live at a time.
#[derive(Debug, Clone)]
pub struct SubscriptionStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(StoreInner::default())) }
    }

    /// Inserts a snapshot, superseding any previous one for the same name.
    pub fn insert(&self, snapshot: BandwidthSubscription) {
        let mut guard = self.inner.write().expect("RwLock poisoned");

        if let Some(old) = guard.snapshots.insert(snapshot.name.clone(), snapshot) {
            log::debug!("Superseded bandwidth subscription snapshot {} ({}).", old.name, old.registry_id);
        }
    }

    pub fn get(&self, name: &SubscriptionName) -> Option<BandwidthSubscription> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.snapshots.get(name).cloned()
    }

    pub fn remove(&self, name: &SubscriptionName) -> Option<BandwidthSubscription> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.snapshots.remove(name)
    }

    pub fn names(&self) -> Vec<SubscriptionName> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.snapshots.keys().cloned().collect()
    }

    /// Marks a snapshot fulfilled.
    ///
    /// # Returns
    /// Returns true only on the first call for a given snapshot, so the
    /// completion hook and notification fire exactly once.
    pub fn mark_fulfilled(&self, name: &SubscriptionName) -> bool {
        let mut guard = self.inner.write().expect("RwLock poisoned");

        match guard.snapshots.get_mut(name) {
            Some(snapshot) if !snapshot.fulfilled => {
                snapshot.fulfilled = true;
                true
            }
            Some(_) => false,
            None => {
                log::error!("Fulfillment recorded for unknown subscription snapshot {}.", name);
                false
            }
        }
    }
}
