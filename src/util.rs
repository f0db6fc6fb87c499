use std::time::SystemTime;

use chrono::{DateTime, Local};
use tracing_subscriber::{EnvFilter, fmt};

/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `--verbose`.
pub fn setup_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

pub fn format_modified(modified: SystemTime) -> String {
    let local: DateTime<Local> = modified.into();
    local.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn plural(count: usize, singular: &str, plural: &str) -> String {
    if count == 1 {
        format!("{count} {singular}")
    } else {
        format!("{count} {plural}")
    }
}
