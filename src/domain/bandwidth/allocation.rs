use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::domain::bandwidth::network::Network;
use crate::utils::id::SubscriptionName;

/// Scheduling priority of a retrieval. Ordering follows urgency, so
/// `Critical > High > Normal > Low` under the derived `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RetrievalPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// The lifecycle state of a [`BandwidthAllocation`].
///
/// Happy path: `Processing -> Scheduled -> Active -> Completed`.
/// Side transitions: `Scheduled | Active -> Deferred` (no bucket capacity,
/// retried at the next schedule cycle), any non-terminal state -> `Failed`
/// (unrecoverable provider/transport error) and any non-terminal state ->
/// `Cancelled` (subscription deleted or superseded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetrievalStatus {
    /// The allocation exists but has not been admitted into a bucket yet.
    Processing,

    /// The allocation holds capacity in exactly one bucket.
    Scheduled,

    /// The retrieval agent is working on this allocation.
    Active,

    /// No bucket had room; the allocation holds no capacity and waits for
    /// the next schedule cycle.
    Deferred,

    /// The retrieval finished and the data arrived.
    Completed,

    /// The retrieval agent reported an unrecoverable error.
    Failed,

    /// The owning subscription was deleted or its definition superseded.
    Cancelled,
}

impl RetrievalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetrievalStatus::Completed | RetrievalStatus::Failed | RetrievalStatus::Cancelled)
    }

    /// Checks whether a transition from `self` to `target` is part of the
    /// allocation state machine.
    pub fn can_transition_to(&self, target: RetrievalStatus) -> bool {
        use RetrievalStatus::*;

        if self.is_terminal() {
            return false;
        }

        match (self, target) {
            (_, Failed) | (_, Cancelled) => true,
            (Processing, Scheduled) | (Processing, Deferred) => true,
            (Scheduled, Active) | (Scheduled, Deferred) => true,
            (Active, Completed) | (Active, Deferred) => true,
            (Deferred, Scheduled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RetrievalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Common data carried by every unit of scheduled retrieval work.
///
/// Priority and estimated size are treated as immutable once the status
/// passes `Active`; the stores enforce this by only reconciling
/// `actual_size_bytes` afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationBase {
    /// Name of the owning subscription snapshot.
    pub subscription_name: SubscriptionName,

    /// Route whose bucket ledger this allocation draws from.
    pub network: Network,

    pub priority: RetrievalPriority,

    pub status: RetrievalStatus,

    /// Earliest time (epoch ms) the retrieval may start.
    pub start_time_ms: i64,

    /// Latest time (epoch ms) the retrieval is useful.
    pub end_time_ms: i64,

    /// Capacity this allocation consumes in its bucket, in bytes.
    pub estimated_size_bytes: u64,

    /// Size reported by the agent after a completed retrieval, if available.
    pub actual_size_bytes: Option<u64>,

    /// Time (epoch ms) the allocation was first submitted for scheduling.
    /// Used as the FIFO tie-break during preemption.
    pub schedule_time_ms: i64,

    /// Start time of the bucket currently holding this allocation, if any.
    pub bucket_start_ms: Option<i64>,
}

impl AllocationBase {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies a status transition, logging and refusing transitions the
    /// state machine does not define.
    pub fn set_status(&mut self, target: RetrievalStatus) -> bool {
        if self.status == target {
            return true;
        }

        if self.status.can_transition_to(target) {
            self.status = target;
            return true;
        }

        log::error!(
            "Rejected status transition {} -> {} for allocation of subscription {}.",
            self.status,
            target,
            self.subscription_name,
        );
        return false;
    }
}

/// A unit of scheduled work consuming bucket capacity.
///
/// Concrete variants share [`AllocationBase`] and add retrieval-specific
/// metadata; collaborators handle them as trait objects the same way the
/// stores do.
pub trait BandwidthAllocation: std::fmt::Debug + Any + Send + Sync {
    fn base(&self) -> &AllocationBase;

    fn base_mut(&mut self) -> &mut AllocationBase;

    fn box_clone(&self) -> Box<dyn BandwidthAllocation>;

    fn as_any(&self) -> &dyn Any;

    fn subscription_name(&self) -> SubscriptionName {
        self.base().subscription_name.clone()
    }

    fn network(&self) -> Network {
        self.base().network
    }

    fn priority(&self) -> RetrievalPriority {
        self.base().priority
    }

    fn status(&self) -> RetrievalStatus {
        self.base().status
    }

    fn start_time_ms(&self) -> i64 {
        self.base().start_time_ms
    }

    fn end_time_ms(&self) -> i64 {
        self.base().end_time_ms
    }

    fn estimated_size_bytes(&self) -> u64 {
        self.base().estimated_size_bytes
    }

    fn schedule_time_ms(&self) -> i64 {
        self.base().schedule_time_ms
    }

    fn bucket_start_ms(&self) -> Option<i64> {
        self.base().bucket_start_ms
    }
}

impl Clone for Box<dyn BandwidthAllocation> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Retrieval scheduled on behalf of one (or, for the shared aggregator,
/// several) subscription snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRetrieval {
    pub base: AllocationBase,

    /// How long past its availability the subscription tolerates waiting for
    /// data, in milliseconds.
    pub subscription_latency_ms: i64,

    /// Average delay between a data set's reference time and its actual
    /// availability at the provider, in milliseconds.
    pub dataset_availability_delay_ms: i64,
}

impl BandwidthAllocation for SubscriptionRetrieval {
    fn base(&self) -> &AllocationBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut AllocationBase {
        &mut self.base
    }

    fn box_clone(&self) -> Box<dyn BandwidthAllocation> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_by_urgency() {
        assert!(RetrievalPriority::Critical > RetrievalPriority::High);
        assert!(RetrievalPriority::High > RetrievalPriority::Normal);
        assert!(RetrievalPriority::Normal > RetrievalPriority::Low);
    }

    #[test]
    fn terminal_states_accept_no_transition() {
        for terminal in [RetrievalStatus::Completed, RetrievalStatus::Failed, RetrievalStatus::Cancelled] {
            assert!(!terminal.can_transition_to(RetrievalStatus::Scheduled));
            assert!(!terminal.can_transition_to(RetrievalStatus::Failed));
        }
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        assert!(RetrievalStatus::Processing.can_transition_to(RetrievalStatus::Scheduled));
        assert!(RetrievalStatus::Scheduled.can_transition_to(RetrievalStatus::Active));
        assert!(RetrievalStatus::Active.can_transition_to(RetrievalStatus::Completed));
        assert!(RetrievalStatus::Deferred.can_transition_to(RetrievalStatus::Scheduled));
        assert!(!RetrievalStatus::Processing.can_transition_to(RetrievalStatus::Active));
    }
}
