use tracing_subscriber::{fmt, EnvFilter};

/// Install the tracing subscriber used by examples and tests.
///
/// Filtering is controlled through `RUST_LOG` (e.g. `RUST_LOG=someip_ipc_client=debug`);
/// without it only warnings and errors are emitted. Installation is
/// best-effort so tests can call this repeatedly without panicking on the
/// second attempt.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
