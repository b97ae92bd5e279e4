use crate::domain::bandwidth::allocation::RetrievalPriority;
use crate::utils::id::{OwnerName, SubscriptionName};

/// Sink for user-facing events about subscription fulfillment.
///
/// Delivery mechanics (JMS topics, GUI alerting) are external; the scheduler
/// only emits through this trait.
pub trait NotificationService: std::fmt::Debug + Send + Sync {
    fn notify(&self, subscription: &SubscriptionName, owner: &OwnerName, message: &str, priority: RetrievalPriority, timestamp_ms: i64);
}

/// Default sink writing notifications through the log facade.
#[derive(Debug, Clone)]
pub struct LogNotificationService;

impl NotificationService for LogNotificationService {
    fn notify(&self, subscription: &SubscriptionName, owner: &OwnerName, message: &str, priority: RetrievalPriority, timestamp_ms: i64) {
        log::info!("[notification {:?} @{}] {} (owner {}): {}", priority, timestamp_ms, subscription, owner, message);
    }
}
