//! Tracing setup for the CLI.
//!
//! Two outputs: a compact human-readable layer on stderr, and a daily-rolling
//! JSON file under `<workspace>/log/` for the long-running `run` loop. The
//! audit trail (`audit.jsonl`) is separate and unaffected by `RUST_LOG`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("foreman=debug")
        } else {
            EnvFilter::new("foreman=info")
        }
    })
}

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process or buffered file output is lost.
///
/// ```bash
/// RUST_LOG=foreman=trace foreman tick
/// ```
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "foreman.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter(verbose))
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    guard
}
