use crate::api::config_dto::SchedulerConfigDto;
use crate::domain::bandwidth::config::SchedulerConfig;
use crate::error::Result;
use crate::loader::parser::parse_json_file;

pub mod api;
pub mod domain;
pub mod error;
pub mod loader;
pub mod logger;
pub mod utils;

/// Loads and validates the scheduler configuration from a JSON file.
pub fn load_config(file_path: &str) -> Result<SchedulerConfig> {
    let dto: SchedulerConfigDto = parse_json_file::<SchedulerConfigDto>(file_path)?;
    log::info!("Scheduler configuration parsed from '{}'.", file_path);

    let config = SchedulerConfig::from_dto(dto)?;
    log::info!("Configured networks: {}.", config.configured_networks().map(|n| n.network.to_string()).collect::<Vec<_>>().join(", "));

    Ok(config)
}
