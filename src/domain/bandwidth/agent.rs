use crate::domain::bandwidth::allocation::SubscriptionRetrieval;
use crate::error::Result;

/// What the agent reports back for a finished retrieval.
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    /// Bytes actually transferred, when the transport can tell.
    pub actual_size_bytes: Option<u64>,
}

/// Performs the actual network fetch for one retrieval.
///
/// Opaque to the scheduler: transport, timeouts and per-provider protocol
/// handling live behind this trait. From the scheduler's perspective the call
/// is synchronous-or-failed; it is always invoked with the scheduling lock
/// released.
pub trait RetrievalAgent: std::fmt::Debug + Send + Sync {
    fn perform(&self, retrieval: &SubscriptionRetrieval) -> Result<RetrievalOutcome>;
}

/// Agent that only logs the request and reports the estimated size back.
/// Stands in when no transport is wired up.
#[derive(Debug, Clone)]
pub struct LoggingRetrievalAgent;

impl RetrievalAgent for LoggingRetrievalAgent {
    fn perform(&self, retrieval: &SubscriptionRetrieval) -> Result<RetrievalOutcome> {
        log::info!(
            "Retrieval requested for subscription {} on {} ({} bytes estimated); no transport configured.",
            retrieval.base.subscription_name,
            retrieval.base.network,
            retrieval.base.estimated_size_bytes
        );

        Ok(RetrievalOutcome { actual_size_bytes: Some(retrieval.base.estimated_size_bytes) })
    }
}
