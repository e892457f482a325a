//! Process-wide log setup for binaries embedding the queue.

use tracing_subscriber::EnvFilter;

/// Install a `tracing` subscriber.
///
/// `RUST_LOG` wins over `default_filter`. Subsequent calls are no-ops.
pub fn init_tracing(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = if json {
        builder.json().with_target(true).try_init()
    } else {
        builder.with_target(true).try_init()
    };
}
