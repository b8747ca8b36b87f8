//! Structured logging setup.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global `tracing` subscriber. `RUST_LOG` (or `NEURON_LOG`) is
/// honored via `EnvFilter`; defaults to `info` when unset.
pub fn init() {
    let filter = EnvFilter::try_from_env("NEURON_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
