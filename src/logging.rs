use tracing_subscriber::EnvFilter;

/// Install the default stderr subscriber. `RUST_LOG` overrides the level.
pub fn init_logging() {
    init_logging_with(false, false);
}

pub fn init_logging_with(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    // A subscriber may already be installed (tests, embedding callers).
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
