use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::domain::bandwidth::allocation_store::AllocationId;
use crate::domain::bandwidth::network::Network;

/// One discrete time interval of the bandwidth ledger for a network route.
///
/// Identified by `(network, start_time_ms)` with the start time truncated to
/// the configured bucket width. Capacity is a soft admission constraint:
/// committed allocations never exceed it, but candidates that do not fit are
/// deferred rather than squeezed in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthBucket {
    pub network: Network,

    /// Interval start (epoch ms), aligned to the bucket width.
    pub start_time_ms: i64,

    /// Interval width in milliseconds.
    pub width_ms: i64,

    /// Bytes this interval can carry (bytes/second x width).
    pub capacity_bytes: u64,

    /// Bytes currently committed by scheduled or active allocations.
    pub allocated_bytes: u64,

    /// Ids of all allocations currently holding capacity in this bucket.
    pub allocation_ids: HashSet<AllocationId>,
}

impl BandwidthBucket {
    pub fn new(network: Network, start_time_ms: i64, width_ms: i64, capacity_bytes: u64) -> Self {
        BandwidthBucket { network, start_time_ms, width_ms, capacity_bytes, allocated_bytes: 0, allocation_ids: HashSet::new() }
    }

    pub fn end_time_ms(&self) -> i64 {
        self.start_time_ms + self.width_ms
    }

    /// Remaining admission capacity in bytes.
    pub fn available_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.allocated_bytes)
    }

    /// Checks whether the interval intersects `[start_ms, end_ms)`.
    pub fn overlaps(&self, start_ms: i64, end_ms: i64) -> bool {
        self.start_time_ms < end_ms && start_ms < self.end_time_ms()
    }

    /// Commits an allocation into the bucket, updating the load and the key set.
    ///
    /// # Returns
    /// `true` if the id was newly inserted and the load adjusted;
    /// `false` if the allocation does not fit or was already present.
    pub fn insert_allocation(&mut self, id: AllocationId, size_bytes: u64) -> bool {
        if self.allocated_bytes + size_bytes > self.capacity_bytes {
            log::error!(
                "Allocation {:?} exceeds capacity of bucket {}@{}. Load with request: {} Bucket capacity: {}",
                id,
                self.network,
                self.start_time_ms,
                self.allocated_bytes + size_bytes,
                self.capacity_bytes
            );

            return false;
        }

        if self.allocation_ids.insert(id) {
            self.allocated_bytes += size_bytes;
            true
        } else {
            log::warn!("Attempted to insert duplicate allocation id {:?} into bucket {}@{}.", id, self.network, self.start_time_ms);
            false
        }
    }

    /// Removes an allocation from the bucket, releasing its committed bytes.
    ///
    /// # Returns
    /// `true` if the allocation id was found and removed, `false` otherwise
    /// (and an error is logged).
    pub fn remove_allocation(&mut self, id: AllocationId, size_bytes: u64) -> bool {
        if self.allocated_bytes < size_bytes {
            log::error!(
                "Removing allocation {:?} would drive bucket {}@{} to negative load. Signals an accounting error.",
                id,
                self.network,
                self.start_time_ms
            );
        }

        match self.allocation_ids.remove(&id) {
            true => {
                self.allocated_bytes = self.allocated_bytes.saturating_sub(size_bytes);
                true
            }
            false => {
                log::error!("Allocation {:?} is not mapped to bucket {}@{}; nothing removed.", id, self.network, self.start_time_ms);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::KeyData;

    fn id(n: u64) -> AllocationId {
        AllocationId::from(KeyData::from_ffi(n | (1 << 32)))
    }

    #[test]
    fn insert_respects_capacity() {
        let mut bucket = BandwidthBucket::new(Network::Opsnet, 0, 60_000, 1000);

        assert!(bucket.insert_allocation(id(1), 600));
        assert_eq!(bucket.available_bytes(), 400);

        // 600 + 600 > 1000
        assert!(!bucket.insert_allocation(id(2), 600));
        assert_eq!(bucket.allocated_bytes, 600);
    }

    #[test]
    fn duplicate_insert_does_not_double_count() {
        let mut bucket = BandwidthBucket::new(Network::Sbn, 0, 60_000, 1000);

        assert!(bucket.insert_allocation(id(1), 300));
        assert!(!bucket.insert_allocation(id(1), 300));
        assert_eq!(bucket.allocated_bytes, 300);
    }

    #[test]
    fn remove_releases_exact_size() {
        let mut bucket = BandwidthBucket::new(Network::Opsnet, 0, 60_000, 1000);

        bucket.insert_allocation(id(1), 400);
        bucket.insert_allocation(id(2), 500);

        assert!(bucket.remove_allocation(id(1), 400));
        assert_eq!(bucket.allocated_bytes, 500);
        assert!(!bucket.remove_allocation(id(1), 400));
    }

    #[test]
    fn overlap_is_half_open() {
        let bucket = BandwidthBucket::new(Network::Opsnet, 60_000, 60_000, 1000);

        assert!(bucket.overlaps(0, 60_001));
        assert!(!bucket.overlaps(0, 60_000));
        assert!(bucket.overlaps(119_999, 200_000));
        assert!(!bucket.overlaps(120_000, 200_000));
    }
}
