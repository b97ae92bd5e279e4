use std::sync::Arc;

use clap::Parser;
use tokio::time::{Duration, sleep};

use bandwidth_scheduler::domain::bandwidth::agent::LoggingRetrievalAgent;
use bandwidth_scheduler::domain::bandwidth::aggregator::SimpleSubscriptionAggregator;
use bandwidth_scheduler::domain::bandwidth::dispatch::RetrievalDispatcher;
use bandwidth_scheduler::domain::bandwidth::manager::BandwidthManager;
use bandwidth_scheduler::domain::bandwidth::notification::LogNotificationService;
use bandwidth_scheduler::domain::bandwidth::persistence::JsonFileBandwidthDao;
use bandwidth_scheduler::domain::bandwidth::registry::UnbackedDataSetRegistry;
use bandwidth_scheduler::domain::clock::WallClock;
use bandwidth_scheduler::{load_config, logger};

/// Bandwidth-constrained retrieval scheduler.
#[derive(Debug, Parser)]
#[command(name = "bandwidth_scheduler")]
struct Args {
    /// Path to the scheduler configuration file (JSON).
    #[arg(long, default_value = "config/scheduler.json")]
    config: String,

    /// Path to the persisted scheduling state (JSON).
    #[arg(long, default_value = "state/scheduler-state.json")]
    state: String,

    /// Seconds between dispatch cycles.
    #[arg(long, default_value_t = 60)]
    interval_secs: u64,
}

#[tokio::main]
async fn main() {
    logger::init();

    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Cannot start without a valid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let dao = match JsonFileBandwidthDao::open(&args.state) {
        Ok(dao) => Arc::new(dao),
        Err(e) => {
            log::error!("Cannot open persisted scheduling state at '{}': {}", args.state, e);
            std::process::exit(1);
        }
    };

    let registry = Arc::new(UnbackedDataSetRegistry);
    let aggregator = Arc::new(SimpleSubscriptionAggregator::new(registry.clone(), config.extended_latency_factor_percent));
    let clock = WallClock::shared();

    let manager = match BandwidthManager::from_persisted(config, aggregator, registry, dao, clock) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            log::error!("Failed to recover scheduling state: {}", e);
            std::process::exit(1);
        }
    };

    let dispatcher = RetrievalDispatcher::new(manager, Arc::new(LoggingRetrievalAgent), Arc::new(LogNotificationService));

    log::info!("Retrieval dispatcher running every {}s.", args.interval_secs);

    loop {
        dispatcher.run_cycle();
        sleep(Duration::from_secs(args.interval_secs)).await;
    }
}
