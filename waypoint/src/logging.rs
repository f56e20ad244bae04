//! Development-time tracing.
//!
//! Tracing output is diagnostics only: it goes to stderr, is filtered by
//! `RUST_LOG`, and is never persisted. Journals, `output.log` and build
//! iteration logs are product artifacts and are written regardless.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=waypoint=debug waypoint reconcile
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
