//! Tracing setup for the hashtree CLI.
//!
//! The configured level is the baseline; `RUST_LOG` overrides it so
//! operators can raise verbosity per module without editing the config
//! file.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. Falls back to `info` when both the
/// environment and the configured level fail to parse.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    Ok(())
}
