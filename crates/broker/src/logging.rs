//! Tracing setup for the broker daemon.

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

/// Installs the global subscriber: INFO by default, overridable through
/// `RUST_LOG`, formatted to stderr so stdout stays free for tooling.
pub fn init() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(fmt_layer).init();
}
