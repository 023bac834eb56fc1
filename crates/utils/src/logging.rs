//! provides logging helpers

use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::util::TryInitError;

/// Environment variable holding the `EnvFilter` directives.
pub const LOG_ENV: &str = "CHUNK_POOL_LOG";

/// initiate the global tracing subscriber, panics if one is already set
pub fn init() {
    if let Err(err) = try_init() {
        panic!("failed to initialize logging: {err}");
    }
}

/// initiate the global tracing subscriber unless another one is already set
pub fn try_init() -> Result<(), TryInitError> {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_filter(env_filter);

    registry().with(fmt_layer).try_init()
}
