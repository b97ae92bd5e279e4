use crate::domain::bandwidth::subscription::Subscription;
use crate::error::Result;
use crate::utils::id::{DataSetName, ProviderName, SubscriptionName};

/// One harvested metadata record of a data set, as stored by the registry.
#[derive(Debug, Clone)]
pub struct DataSetMetaData {
    pub dataset_name: DataSetName,
    pub provider: ProviderName,

    /// Observed delay between the data set's reference time and its actual
    /// availability at the provider, in milliseconds.
    pub availability_offset_ms: i64,
}

/// Query facade over the external subscription/data-set registry.
///
/// The registry itself (ebXML storage, harvester) is outside this crate;
/// the scheduler only reads through this trait.
pub trait DataSetRegistry: std::fmt::Debug + Send + Sync {
    /// All harvested metadata records for a data set at a provider.
    fn get_by_dataset(&self, name: &DataSetName, provider: &ProviderName) -> Result<Vec<DataSetMetaData>>;

    /// The current registry definition of a subscription, if any.
    fn get_subscription(&self, name: &SubscriptionName) -> Result<Option<Subscription>>;
}

/// Registry stand-in for deployments where no registry endpoint is wired up
/// yet. Resolves nothing, so new subscriptions are rejected at validation;
/// recovered state still dispatches normally.
#[derive(Debug, Clone)]
pub struct UnbackedDataSetRegistry;

impl DataSetRegistry for UnbackedDataSetRegistry {
    fn get_by_dataset(&self, name: &DataSetName, _provider: &ProviderName) -> Result<Vec<DataSetMetaData>> {
        log::debug!("Data set lookup for {} against the unbacked registry.", name);
        Ok(Vec::new())
    }

    fn get_subscription(&self, _name: &SubscriptionName) -> Result<Option<Subscription>> {
        Ok(None)
    }
}
