//! Diagnostic tracing on stderr.
//!
//! Stdout carries command results (JSON), so diagnostics never go there.
//! Durable audit data lives in execution records (`io/execution_log`), which
//! `RUST_LOG` does not affect.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set (e.g. `RUST_LOG=orchestrator::engine=debug`);
/// otherwise only warnings are shown, plus this crate's debug events when
/// `verbose` is set.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "warn,orchestrator=debug"
    } else {
        "warn"
    }
}
