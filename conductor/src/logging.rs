//! Development-time tracing for debugging orchestration runs.
//!
//! Diagnostics go to stderr and are controlled by `RUST_LOG`. They are never
//! part of command output: reports and final states are printed on stdout by
//! the CLI regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const QUIET: &str = "warn";
const VERBOSE: &str = "warn,conductor=debug";

/// Install the stderr subscriber.
///
/// `RUST_LOG` wins when set; otherwise `verbose` picks between warnings only
/// and debug output for this crate (worker attempts, backoff, transitions).
///
/// ```bash
/// RUST_LOG=conductor::invoke=debug conductor run workflow.json
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { VERBOSE } else { QUIET };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact().with_target(verbose))
        .init();
}
