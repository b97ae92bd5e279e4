use std::collections::HashMap;
use std::str::FromStr;

use crate::api::config_dto::{NetworkConfigDto, SchedulerConfigDto};
use crate::domain::bandwidth::network::Network;
use crate::error::{Error, Result};

/// Validated bucket configuration for one network route.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub network: Network,

    /// Width of one bucket in milliseconds.
    pub bucket_width_ms: i64,

    /// Route bandwidth in bytes per second.
    pub bytes_per_second: u64,

    /// Rolling planning horizon in milliseconds.
    pub plan_horizon_ms: i64,
}

impl NetworkConfig {
    /// Bytes one bucket can carry: bytes/second x bucket width in seconds.
    pub fn bucket_capacity_bytes(&self) -> u64 {
        self.bytes_per_second * (self.bucket_width_ms / 1000) as u64
    }

    fn from_dto(dto: NetworkConfigDto) -> Result<Self> {
        let network = Network::from_str(&dto.name).map_err(Error::Configuration)?;

        if dto.bucket_minutes <= 0 {
            return Err(Error::Configuration(format!("Bucket size for {} must be positive, got {} minutes", network, dto.bucket_minutes)));
        }

        if dto.bytes_per_second == 0 {
            return Err(Error::Configuration(format!("Bandwidth for {} must be positive", network)));
        }

        if dto.plan_hours <= 0 {
            return Err(Error::Configuration(format!("Planning horizon for {} must be positive, got {} hours", network, dto.plan_hours)));
        }

        Ok(NetworkConfig {
            network,
            bucket_width_ms: dto.bucket_minutes * 60_000,
            bytes_per_second: dto.bytes_per_second,
            plan_horizon_ms: dto.plan_hours * 3_600_000,
        })
    }
}

/// Validated scheduler configuration. A network without an entry here is
/// undefined territory: scheduling onto it raises `Error::UnknownNetwork`.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    networks: HashMap<Network, NetworkConfig>,

    pub extended_latency_factor_percent: u32,
}

impl SchedulerConfig {
    pub fn from_dto(dto: SchedulerConfigDto) -> Result<Self> {
        if dto.networks.is_empty() {
            return Err(Error::Configuration("At least one network must be configured".to_string()));
        }

        let mut networks = HashMap::new();

        for network_dto in dto.networks {
            let config = NetworkConfig::from_dto(network_dto)?;

            if networks.insert(config.network, config.clone()).is_some() {
                return Err(Error::Configuration(format!("Network {} is configured twice", config.network)));
            }
        }

        Ok(SchedulerConfig { networks, extended_latency_factor_percent: dto.extended_latency_factor_percent })
    }

    /// Convenience constructor for tests and embedded use.
    pub fn from_networks(networks: Vec<NetworkConfig>, extended_latency_factor_percent: u32) -> Self {
        SchedulerConfig {
            networks: networks.into_iter().map(|config| (config.network, config)).collect(),
            extended_latency_factor_percent,
        }
    }

    pub fn network(&self, network: Network) -> Result<&NetworkConfig> {
        self.networks.get(&network).ok_or(Error::UnknownNetwork(network))
    }

    pub fn configured_networks(&self) -> impl Iterator<Item = &NetworkConfig> {
        self.networks.values()
    }
}
