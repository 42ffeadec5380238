use std::time::Duration;

use tracing_subscriber::EnvFilter;

/// Initialize tracing for logging.
///
/// In debug builds, default to debug level for our crate.
/// Can be overridden with the RUST_LOG environment variable.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            // Debug build: show debug logs for our crate, info for others
            EnvFilter::new("eddie_sync=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    // A second init (e.g. from tests) must not panic
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub fn fmt_ms(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 { "<1ms".into() } else { format!("{}ms", ms) }
}
