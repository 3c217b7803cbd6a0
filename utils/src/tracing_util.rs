//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Initialize tracing with the default configuration.
///
/// Verbosity is controlled with `RUST_LOG`; without it only warnings
/// and errors are shown.
pub fn initialize_tracing() {
    // Don't include timestamps and such because they're not really useful and
    // too verbose; the operator-facing progress lines are printed separately.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    // Log to stderr by default
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}
