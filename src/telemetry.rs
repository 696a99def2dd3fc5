//! Tracing setup for hosts that do not install their own subscriber.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber honoring `RUST_LOG`.
///
/// Safe to call repeatedly; installs are first-wins and later calls are
/// no-ops, so embedding applications that already configured tracing are
/// left alone.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
