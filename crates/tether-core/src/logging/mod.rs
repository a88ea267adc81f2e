//! `tracing` subscriber setup.
//!
//! The engine only emits events through `tracing` macros. Binaries call
//! [`init_subscriber`] once at startup; tests use [`test_utils::capture_logs`].

pub mod test_utils;

pub use test_utils::{CapturedLogs, capture_logs};

/// Install the global subscriber writing compact lines to stderr.
///
/// `RUST_LOG` takes precedence over `level` when set. Later calls are no-ops.
pub fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    let _ = subscriber.try_init();
}
