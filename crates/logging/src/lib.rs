//! GarlicCraft Logging
//!
//! Shared tracing setup for the daemon and tools.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber: env-filtered, defaulting to info with
/// debug for our own crates. Safe to call once per process.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,garliccraft=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}
