//! Logging initialization and the access-log line.
//!
//! The log level is controlled via the `RUST_LOG` environment variable:
//!
//! ```bash
//! RUST_LOG=debug plinth 8080
//! RUST_LOG=warn plinth 8080
//! ```

use std::net::IpAddr;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with sensible defaults.
///
/// Call this once at startup, before the server is constructed. Defaults to
/// `info` when `RUST_LOG` is unset.
///
/// # Panics
///
/// Panics if called more than once.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Emit one access line for a completed request, common-log shaped.
pub fn log_access(peer: IpAddr, method: &str, path: &str, status: u16, response_bytes: usize) {
    tracing::info!(
        target: "plinth::access",
        %peer,
        method,
        path,
        status,
        bytes = response_bytes,
        "request"
    );
}
