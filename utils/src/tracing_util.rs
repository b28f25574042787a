//! Tracing setup for the hammer entrypoints.

/// Environment variable selecting log verbosity, e.g.
/// `HAMMER_LOG=debug hammer deploy`. Falls back to the conventional
/// `RUST_LOG`, then to warnings only.
const LOG_ENV_VAR: &str = "HAMMER_LOG";

/// Initialize tracing: terse single-line events on stderr, so
/// diagnostics never mix into the stdout the query commands print.
/// Timestamps are omitted; the operation log carries its own.
pub fn initialize_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .without_time()
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();
}
