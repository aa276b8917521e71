//! Logging initialization.
//!
//! The level is controlled by the `RUST_LOG` environment variable and
//! defaults to `info`:
//!
//! ```bash
//! # Per-connection and per-response events
//! RUST_LOG=etude=debug etude 8080
//!
//! # Timer ticks as well
//! RUST_LOG=etude=trace etude 8080
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogFormat;

/// Install the global tracing subscriber.
///
/// Call once at startup, before the server is built. A second call is a
/// no-op that returns quietly (tests build several servers in one process).
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let _ = match format {
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_thread_names(true))
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_line_number(true)
                    .with_thread_names(true)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
}
