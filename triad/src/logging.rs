//! Diagnostics for debugging the engine.
//!
//! Tracing output goes to stderr and is never persisted. The record of what a
//! run did lives in the iteration logs (`io::iteration_log`) under
//! `<runs_dir>/<run>/iterations/`, which are written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directive for a `-v` count when `RUST_LOG` is unset.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "warn,triad=info",
        2 => "warn,triad=debug",
        _ => "debug",
    }
}

/// Install the stderr subscriber.
///
/// `RUST_LOG` wins over `verbosity`. Calling this twice is a no-op.
///
/// # Example
/// ```bash
/// RUST_LOG=triad::core::guard=debug triad run --goal "summarize the crab census"
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
