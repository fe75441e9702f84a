//! Observability helpers shared across the workspace.

use tracing_subscriber::EnvFilter;

/// Filter applied when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,store=debug,database=debug";

/// Installs the global fmt subscriber for a binary. Later calls are no-ops.
pub fn init_logger() {
    try_init(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)));
}

fn try_init(filter: EnvFilter) {
    // Another component (or an earlier test) may already have installed a
    // subscriber; that one wins.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub mod testonly {
    use tracing_subscriber::EnvFilter;

    /// Installs a subscriber that cooperates with `cargo test`'s output
    /// capture. Safe to call from every test.
    pub fn init_test_logger() {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(super::DEFAULT_FILTER));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
    }
}
