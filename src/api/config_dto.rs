use serde::Deserialize;

/// Top-level scheduler configuration file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfigDto {
    pub networks: Vec<NetworkConfigDto>,

    /// Percentage boost applied to the tie-break urgency of subscriptions
    /// with unretrieved, soon-to-expire data.
    pub extended_latency_factor_percent: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfigDto {
    /// Route name, e.g. "OPSNET" or "SBN".
    pub name: String,

    /// Width of one bandwidth bucket, in minutes.
    pub bucket_minutes: i64,

    /// Default bandwidth of the route, in bytes per second.
    pub bytes_per_second: u64,

    /// Length of the rolling planning horizon, in hours.
    pub plan_hours: i64,
}
