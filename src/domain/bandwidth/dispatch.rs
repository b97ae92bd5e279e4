use std::sync::Arc;

use crate::domain::bandwidth::agent::RetrievalAgent;
use crate::domain::bandwidth::manager::BandwidthManager;
use crate::domain::bandwidth::notification::NotificationService;

/// Counters from one dispatch pass, for logging and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub fulfilled_subscriptions: usize,
}

/// Periodic fulfillment pass over every retrieval plan.
///
/// An external trigger (cron collaborator, or the binary's tokio loop) calls
/// [`RetrievalDispatcher::run_cycle`]; this component never retries failed
/// retrievals itself — the next natural schedule cycle re-evaluates the
/// owning subscription.
#[derive(Debug)]
pub struct RetrievalDispatcher {
    manager: Arc<BandwidthManager>,
    agent: Arc<dyn RetrievalAgent>,
    notifier: Arc<dyn NotificationService>,
}

impl RetrievalDispatcher {
    pub fn new(manager: Arc<BandwidthManager>, agent: Arc<dyn RetrievalAgent>, notifier: Arc<dyn NotificationService>) -> Self {
        RetrievalDispatcher { manager, agent, notifier }
    }

    /// Scans all networks for buckets whose time has arrived, dispatches the
    /// due retrievals and records their outcomes.
    ///
    /// Due allocations are claimed (marked `Active`) under the per-network
    /// plan lock; the agent performs the actual fetch with the lock released.
    pub fn run_cycle(&self) -> DispatchReport {
        self.manager.advance_plans();

        let mut report = DispatchReport::default();

        for network in self.manager.networks() {
            let claimed = match self.manager.claim_due_retrievals(network) {
                Ok(claimed) => claimed,
                Err(e) => {
                    log::error!("Failed to claim due retrievals for {}: {}", network, e);
                    continue;
                }
            };

            report.dispatched += claimed.len();

            for (id, retrieval) in claimed {
                let outcome = self.agent.perform(&retrieval);

                let (success, actual_size) = match outcome {
                    Ok(outcome) => {
                        report.completed += 1;
                        (true, outcome.actual_size_bytes)
                    }
                    Err(e) => {
                        report.failed += 1;
                        log::error!("Retrieval agent failed for subscription {}: {}", retrieval.base.subscription_name, e);
                        (false, None)
                    }
                };

                match self.manager.record_outcome(id, actual_size, success) {
                    Ok(fulfilled) => {
                        report.fulfilled_subscriptions += fulfilled.len();

                        // A shared retrieval fulfills every member; each one
                        // gets its own notification.
                        for member in fulfilled {
                            self.notifier.notify(
                                &member.snapshot.name,
                                &member.snapshot.owner,
                                &format!("Data set {} retrieved in full.", member.snapshot.dataset_name),
                                member.snapshot.priority,
                                member.completed_at_ms,
                            );
                        }
                    }
                    Err(e) => log::error!("Failed to record retrieval outcome for subscription {}: {}", retrieval.base.subscription_name, e),
                }
            }
        }

        if report.dispatched > 0 {
            log::info!(
                "Dispatch cycle: {} dispatched, {} completed, {} failed, {} subscription(s) fulfilled.",
                report.dispatched,
                report.completed,
                report.failed,
                report.fulfilled_subscriptions
            );
        }

        report
    }
}
