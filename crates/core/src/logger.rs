//! Logging setup.
//!
//! Components log through `tracing` with their own target (`capture`,
//! `classifier`, `bus`, `scanner`, `orchestrator`, `connectivity`, `device`,
//! `runtime`) so a filter such as `info,scanner=debug` can single one out.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;
use tracing_subscriber::fmt::{format::Writer, time::FormatTime};
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

pub const LOG_FILE: &str = "app.log";

/// Local wall-clock time, `HH:MM:SS`.
#[derive(Debug, Clone, Copy, Default)]
struct Clock;

impl FormatTime for Clock {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%H:%M:%S"))
    }
}

/// Install the global subscriber. Clears the log file.
///
/// Everything passing `filter` goes to `<log_dir>/app.log`; warnings and
/// errors are echoed to stderr as well.
pub fn init(log_dir: &Path, filter: &str) -> Result<()> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let log_path = log_dir.join(LOG_FILE);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .with_context(|| format!("failed to open log file {}", log_path.display()))?;

    let env_filter = EnvFilter::try_new(filter)
        .with_context(|| format!("failed to parse log filter '{}'", filter))?;

    let file_layer = fmt::layer()
        .with_timer(Clock)
        .with_target(true)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(env_filter);

    let stderr_layer = fmt::layer()
        .with_timer(Clock)
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    tracing::info!(target: "runtime", dir = %log_dir.display(), filter, "logging initialized");
    Ok(())
}
