//! Test helpers for jobchain: fixtures, mock handlers, a recording
//! transport, a recording notifier and a sample plugin.

mod fixtures;
mod mock;
mod plugin;
mod transport;

pub use fixtures::*;
pub use mock::*;
pub use plugin::*;
pub use transport::*;

/// Installs a test subscriber honoring `RUST_LOG`. Safe to call from every
/// test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
