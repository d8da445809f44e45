//! Logging initialization for the replication engine.
//!
//! All diagnostics go through `tracing`. Binaries and tests call [`init`]
//! once; the filter is taken from `RUST_LOG` with a sane default that keeps
//! per-completion chatter out of production logs.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("aurora_mirror=info"));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    });
}

/// Initialize logging for tests: debug level, test writer.
pub fn init_for_tests() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("aurora_mirror=debug"))
            .with_test_writer()
            .try_init();
    });
}
