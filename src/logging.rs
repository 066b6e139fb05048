use tracing_subscriber::{fmt, EnvFilter};

/// Initialize logging with a default filter of `info`.
///
/// Use the `RUST_LOG` environment variable to override the default filter.
pub fn init_logging() {
    init_with_default("info");
}

/// Like `init_logging`, but also reports every collection.
pub fn init_gc_logging() {
    init_with_default("info,irvm=debug");
}

fn init_with_default(default: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // Tests and embedders may already have installed a subscriber.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
