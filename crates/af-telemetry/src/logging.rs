use tracing_subscriber::{fmt, EnvFilter};

/// Initialize human-readable logging for a binary.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies (e.g. "info"
/// or "af_pilot=debug,warn"). Calling more than once (tests, embedded use)
/// is a no-op.
pub fn init_logging(service_name: &str, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::debug!(service = service_name, "logging initialised");
}

/// Initialize JSON logging, for runs whose output is shipped to a log
/// aggregator. Same filter rules as [`init_logging`]; also idempotent.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .json()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::debug!(service = service_name, "logging initialised (json)");
}
