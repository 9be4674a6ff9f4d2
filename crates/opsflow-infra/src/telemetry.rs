//! Tracing subscriber setup for engine embedders.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// The filter comes from `OPSFLOW_LOG` (else `RUST_LOG`), falling back to
/// the given default directive. Safe to call once per process; a second
/// call is a no-op.
pub fn init_tracing(default_directive: &str) {
    let filter = std::env::var("OPSFLOW_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_directive.to_string());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .try_init();
}
