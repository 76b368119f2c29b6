//! Logging initialization for the embedding server.

use tracing_subscriber::EnvFilter;

/// Initialize tracing with the standard env-filter setup. The default
/// level is `info`; `RUST_LOG` overrides it.
pub fn init_logging(no_color: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!no_color)
        .init();
}
