use chrono::Local;
use fern::Dispatch;
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;
use std::fs;

const LOG_DIR: &str = "logs";
const LOG_FILE: &str = "scheduler.log";

/// Wires the global logger: colored stderr plus `logs/scheduler.log`.
///
/// Called once at the top of `main`. The level comes from `RUST_LOG`
/// (default `info`); runtime internals are capped at `warn` so bucket and
/// dispatch decisions stay readable at `debug`.
pub fn init() {
    if let Err(e) = fs::create_dir_all(LOG_DIR) {
        eprintln!("Failed to create log directory '{}': {}", LOG_DIR, e);
    }

    let path = format!("{}/{}", LOG_DIR, LOG_FILE);

    let level = std::env::var("RUST_LOG").ok().and_then(|value| value.parse::<LevelFilter>().ok()).unwrap_or(LevelFilter::Info);

    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Blue)
        .trace(Color::BrightBlack);

    let stderr_log = Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .chain(std::io::stderr());

    // The file log keeps millisecond precision; bucket starts and dispatch
    // times are sub-second decisions.
    let file_log = Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .chain(fern::log_file(&path).unwrap_or_else(|e| {
            eprintln!("Failed to open log file '{}': {}", path, e);
            fern::log_file("/dev/stderr").expect("Failed to open stderr as fallback")
        }));

    let applied = Dispatch::new()
        .level(level)
        .level_for("tokio", LevelFilter::Warn)
        .level_for("mio", LevelFilter::Warn)
        .chain(stderr_log)
        .chain(file_log)
        .apply();

    if let Err(e) = applied {
        eprintln!("Failed to install the logger: {}", e);
        return;
    }

    log::info!("Logging to stderr and '{}'.", path);
}
