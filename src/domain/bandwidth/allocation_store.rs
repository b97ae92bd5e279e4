use slotmap::{SlotMap, new_key_type};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::bandwidth::allocation::{BandwidthAllocation, RetrievalStatus};
use crate::utils::id::SubscriptionName;

new_key_type! {
    pub struct AllocationId;
}

#[derive(Debug)]
struct StoreInner {
    /// Allocation storage.
    slots: SlotMap<AllocationId, Arc<RwLock<Box<dyn BandwidthAllocation>>>>,

    /// Index lookup of all allocations belonging to one subscription snapshot.
    subscription_index: HashMap<SubscriptionName, Vec<AllocationId>>,
}

/// Shared store of every allocation the manager knows about, across all
/// networks and lifecycle states.
#[derive(Debug, Clone)]
pub struct AllocationStore {
    /// Both maps are protected with a single lock.
    inner: Arc<RwLock<StoreInner>>,
}

impl AllocationStore {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(StoreInner { slots: SlotMap::with_key(), subscription_index: HashMap::new() })) }
    }

    /// Adds an allocation to the store.
    ///
    /// # Returns
    /// Returns the AllocationId (internal key for the store).
    pub fn add(&self, allocation: Box<dyn BandwidthAllocation>) -> AllocationId {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let name = allocation.subscription_name();
        let key = guard.slots.insert(Arc::new(RwLock::new(allocation)));

        guard.subscription_index.entry(name).or_default().push(key);

        return key;
    }

    /// Get an allocation by its internal id.
    ///
    /// # Returns
    /// Returns Some(allocation handle) if the id was present, else None.
    pub fn get(&self, key: AllocationId) -> Option<Arc<RwLock<Box<dyn BandwidthAllocation>>>> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.slots.get(key).cloned()
    }

    /// Get the ids of all allocations owned by a subscription snapshot.
    pub fn get_by_subscription(&self, name: &SubscriptionName) -> Vec<AllocationId> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.subscription_index.get(name).cloned().unwrap_or_default()
    }

    /// Removes an allocation entirely. Used when a subscription definition is
    /// superseded; terminal history rows live in the DAO, not here.
    pub fn remove(&self, key: AllocationId) -> Option<Box<dyn BandwidthAllocation>> {
        let mut guard = self.inner.write().expect("RwLock poisoned");

        let handle = guard.slots.remove(key)?;
        let allocation = match Arc::try_unwrap(handle) {
            Ok(lock) => lock.into_inner().expect("RwLock poisoned"),
            Err(handle) => handle.read().expect("RwLock poisoned").box_clone(),
        };

        let name = allocation.subscription_name();

        let now_empty = match guard.subscription_index.get_mut(&name) {
            Some(ids) => {
                ids.retain(|id| *id != key);
                ids.is_empty()
            }
            None => false,
        };

        if now_empty {
            guard.subscription_index.remove(&name);
        }

        Some(allocation)
    }

    pub fn get_status(&self, key: AllocationId) -> Option<RetrievalStatus> {
        self.get(key).map(|handle| handle.read().expect("RwLock poisoned").status())
    }

    /// Applies a status transition to one allocation.
    ///
    /// # Returns
    /// Returns false if the allocation does not exist or the transition is not
    /// part of the state machine (the offending transition is logged).
    pub fn set_status(&self, key: AllocationId, status: RetrievalStatus) -> bool {
        match self.get(key) {
            Some(handle) => handle.write().expect("RwLock poisoned").base_mut().set_status(status),
            None => {
                log::error!("Status change to {} requested for unknown allocation id {:?}.", status, key);
                false
            }
        }
    }

    /// Ids of every allocation currently in a non-terminal state for the
    /// given subscription.
    pub fn non_terminal_for(&self, name: &SubscriptionName) -> Vec<AllocationId> {
        self.get_by_subscription(name)
            .into_iter()
            .filter(|id| self.get_status(*id).map(|status| !status.is_terminal()).unwrap_or(false))
            .collect()
    }

    /// Checks whether every allocation of the subscription completed. An
    /// empty allocation set does not count as fulfilled.
    pub fn all_completed(&self, name: &SubscriptionName) -> bool {
        let ids = self.get_by_subscription(name);

        if ids.is_empty() {
            return false;
        }

        ids.iter().all(|id| self.get_status(*id) == Some(RetrievalStatus::Completed))
    }
}
