use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::bandwidth::bucket::BandwidthBucket;
use crate::domain::bandwidth::network::Network;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct StoreInner {
    /// Per network, buckets ordered by start time.
    buckets: HashMap<Network, BTreeMap<i64, BandwidthBucket>>,
}

/// Ledger of the time-bucketed bandwidth budget, keyed by
/// `(network, truncated start time)`.
///
/// Lookups are idempotent on that key; buckets are created lazily as the
/// planning horizon advances and purged once fully in the past.
#[derive(Debug, Clone)]
pub struct BucketStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl BucketStore {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(StoreInner::default())) }
    }

    pub fn get_bucket(&self, network: Network, start_time_ms: i64) -> Option<BandwidthBucket> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.buckets.get(&network).and_then(|tree| tree.get(&start_time_ms)).cloned()
    }

    /// Creates the bucket for `(network, start_time_ms)` if it does not exist
    /// yet and returns a copy of the stored state.
    ///
    /// The caller passes the start time already truncated to the bucket width;
    /// a misaligned start signals an indexing bug and is logged.
    pub fn create_bucket(&self, network: Network, start_time_ms: i64, width_ms: i64, capacity_bytes: u64) -> BandwidthBucket {
        if width_ms > 0 && start_time_ms % width_ms != 0 {
            log::error!("Bucket start {} for {} is not aligned to the bucket width {}.", start_time_ms, network, width_ms);
        }

        let mut guard = self.inner.write().expect("RwLock poisoned");

        guard
            .buckets
            .entry(network)
            .or_default()
            .entry(start_time_ms)
            .or_insert_with(|| BandwidthBucket::new(network, start_time_ms, width_ms, capacity_bytes))
            .clone()
    }

    /// Buckets of one network whose start time lies in `[from_ms, to_ms)`,
    /// ordered by start time.
    pub fn list_buckets(&self, network: Network, from_ms: i64, to_ms: i64) -> Vec<BandwidthBucket> {
        let guard = self.inner.read().expect("RwLock poisoned");

        match guard.buckets.get(&network) {
            Some(tree) => tree.range(from_ms..to_ms).map(|(_, bucket)| bucket.clone()).collect(),
            None => Vec::new(),
        }
    }

    /// Drops every bucket of the network whose interval ended before
    /// `time_ms` and which no longer carries committed bytes.
    ///
    /// # Returns
    /// The start times of the purged buckets.
    pub fn purge_before(&self, network: Network, time_ms: i64) -> Vec<i64> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let mut purged = Vec::new();

        if let Some(tree) = guard.buckets.get_mut(&network) {
            let candidates: Vec<i64> = tree
                .values()
                .take_while(|bucket| bucket.end_time_ms() <= time_ms)
                .filter(|bucket| bucket.allocated_bytes == 0)
                .map(|bucket| bucket.start_time_ms)
                .collect();

            for start in candidates {
                tree.remove(&start);
                purged.push(start);
            }
        }

        if !purged.is_empty() {
            log::debug!("Purged {} expired bucket(s) for {} before {}.", purged.len(), network, time_ms);
        }

        purged
    }

    /// Replaces the stored bucket with an updated copy. The bucket must have
    /// been created through this store first.
    pub fn put_bucket(&self, bucket: BandwidthBucket) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.buckets.entry(bucket.network).or_default().insert(bucket.start_time_ms, bucket);
    }

    /// Applies a capacity change coming from network reconfiguration.
    ///
    /// A reduction below the bytes already committed to the bucket is
    /// rejected rather than silently truncating over-committed work.
    pub fn resize_capacity(&self, network: Network, start_time_ms: i64, new_capacity_bytes: u64) -> Result<()> {
        let mut guard = self.inner.write().expect("RwLock poisoned");

        let bucket = guard
            .buckets
            .get_mut(&network)
            .and_then(|tree| tree.get_mut(&start_time_ms))
            .ok_or_else(|| Error::Validation(format!("No bucket {}@{} to resize", network, start_time_ms)))?;

        if new_capacity_bytes < bucket.allocated_bytes {
            return Err(Error::Validation(format!(
                "Capacity reduction to {} would truncate {} committed bytes in bucket {}@{}",
                new_capacity_bytes, bucket.allocated_bytes, network, start_time_ms
            )));
        }

        bucket.capacity_bytes = new_capacity_bytes;
        Ok(())
    }

    /// Sum of (capacity, allocated) over the network's buckets in
    /// `[from_ms, to_ms)`.
    pub fn usage(&self, network: Network, from_ms: i64, to_ms: i64) -> (u64, u64) {
        let guard = self.inner.read().expect("RwLock poisoned");

        match guard.buckets.get(&network) {
            Some(tree) => tree.range(from_ms..to_ms).fold((0, 0), |(capacity, allocated), (_, bucket)| {
                (capacity + bucket.capacity_bytes, allocated + bucket.allocated_bytes)
            }),
            None => (0, 0),
        }
    }
}
