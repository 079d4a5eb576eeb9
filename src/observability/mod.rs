//! Structured logging setup.
//!
//! All crate code logs through `tracing`; this module installs the
//! subscriber once at program start.

use tracing_subscriber::EnvFilter;

/// Initialize structured logging with `RUST_LOG` environment variable support.
///
/// `default_filter` (usually `logging.filter` from the config) applies when
/// `RUST_LOG` is not set. Call once at program startup; subsequent calls are
/// silently ignored by `tracing_subscriber`.
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("church_network=info"));

    // try_init so double-init in tests doesn't panic
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .try_init();
}
