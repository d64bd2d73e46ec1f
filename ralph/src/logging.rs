//! Diagnostic tracing for the loop itself.
//!
//! Tracing goes to stderr and is never persisted. The loop's real record of
//! what happened is the per-iteration artifacts (`io::iteration_log`) and the
//! session progress log (`io::progress`), which are written regardless of
//! the filter set here.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Env var checked before `RUST_LOG`, so the agent's own logging is not
/// affected when only ralph needs to be verbose.
pub const LOG_ENV: &str = "RALPH_LOG";

const DEFAULT_FILTER: &str = "warn";

/// Install the global subscriber. Filter comes from `RALPH_LOG`, then
/// `RUST_LOG`, then `warn`.
///
/// ```bash
/// RALPH_LOG=ralph=debug ralph run --mode build
/// ```
pub fn init() {
    tracing_subscriber::registry()
        .with(filter())
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
