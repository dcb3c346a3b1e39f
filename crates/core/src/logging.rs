//! Logging initialization.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter used when neither `RUST_LOG` nor the config provide one.
pub const DEFAULT_LOG_FILTER: &str = "info,ember=debug";

/// Initialize the global tracing subscriber.
///
/// Filter precedence is `RUST_LOG`, then `filter` (usually the config's
/// `log_filter`), then [`DEFAULT_LOG_FILTER`].
///
/// # Example
/// ```
/// ember_core::init_logging(None);
/// tracing::info!("Engine starting");
/// ```
pub fn init_logging(filter: Option<&str>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        filter
            .and_then(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
    });

    // A second call (e.g. from several doctests in one process) must not panic.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init();
}
