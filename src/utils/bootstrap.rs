//! Bootstrap utilities for amqp-courier binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the tracing filter directives.
pub const LOG_ENV: &str = "AMQP_COURIER_LOG";

/// Initialize tracing with the AMQP_COURIER_LOG environment variable.
///
/// Defaults to "info" level if AMQP_COURIER_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
