//! Ready-made subscriber for binaries and scripts using this crate.
//!
//! Log lines go through the progress bars instead of tearing them, and the
//! filter is read from `RUST_LOG`, defaulting to `info`.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber, failing if one is already set.
pub fn try_init() -> Result<(), TryInitError> {
    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()
}

/// Like [`try_init`], but a subscriber that is already installed is kept.
pub fn init() {
    if try_init().is_err() {
        tracing::debug!("a global subscriber was already installed");
    }
}
