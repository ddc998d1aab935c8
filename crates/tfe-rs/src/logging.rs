//! Tracing subscriber setup.
//!
//! The filter is read from `TFE_LOG`, then `RUST_LOG`, falling back to `warn`.
//! Initialization happens at most once per process; later calls are no-ops.

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_FILTER_ENV: &str = "TFE_LOG";
const DEFAULT_FILTER: &str = "warn";

fn build_env_filter() -> EnvFilter {
    if let Ok(filter) = std::env::var(LOG_FILTER_ENV) {
        if let Ok(filter) = EnvFilter::try_new(filter.trim()) {
            return filter;
        }
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs a human-readable fmt subscriber for the process.
///
/// Returns without touching the global dispatcher if another subscriber is already installed.
pub fn init_logging() {
    TRACING_INITIALIZED.get_or_init(|| {
        let layer = fmt::layer().with_target(true).with_thread_names(true);
        let _ = tracing_subscriber::registry()
            .with(build_env_filter())
            .with(layer)
            .try_init();
    });
}

/// Same as [`init_logging`] but writes through the test writer so output is captured per test.
pub fn init_test_logging() {
    TRACING_INITIALIZED.get_or_init(|| {
        let layer = fmt::layer().with_test_writer().with_target(true);
        let _ = tracing_subscriber::registry()
            .with(build_env_filter())
            .with(layer)
            .try_init();
    });
}
